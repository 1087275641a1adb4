//! Schemas and the registry that opens one engine table per schema.

use std::fmt;
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::RwLock;
use tracing::debug;

use simplestore_core::{CursorOptions, StoreEngine, StoreError, TableHandle, TableOptions};

use crate::codec;
use crate::error::{ResourceError, ResourceResult};

/// Storage layout of one resource type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schema {
    /// Table name
    pub name: &'static str,
    /// Key field names, in key order
    pub fields: &'static [&'static str],
    pub record_len: Option<usize>,
    pub duplicates: bool,
}

impl Schema {
    pub const fn new(name: &'static str, fields: &'static [&'static str]) -> Self {
        Self { name, fields, record_len: None, duplicates: false }
    }

    pub const fn with_record_len(mut self, len: usize) -> Self {
        self.record_len = Some(len);
        self
    }

    pub const fn with_duplicates(mut self) -> Self {
        self.duplicates = true;
        self
    }

    pub const fn arity(&self) -> usize {
        self.fields.len()
    }

    /// Position of `field` among the key fields.
    pub fn field_index(&self, field: &str) -> Option<usize> {
        self.fields.iter().position(|f| *f == field)
    }

    fn table_options(&self) -> TableOptions {
        let options = TableOptions::new().duplicates(self.duplicates);
        match self.record_len {
            Some(len) => options.record_len(len),
            None => options,
        }
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.fields.join(", "))
    }
}

/// One open table per registered schema.
pub struct TableRegistry {
    engine: Arc<StoreEngine>,
    tables: RwLock<HashMap<&'static str, (Schema, TableHandle)>>,
}

impl TableRegistry {
    pub fn new(engine: Arc<StoreEngine>) -> Self {
        Self { engine, tables: RwLock::new(HashMap::new()) }
    }

    /// Handle of the table backing `schema`, opening it on first use.
    pub fn table(&self, schema: &Schema) -> ResourceResult<TableHandle> {
        if let Some((known, handle)) = self.tables.read().get(schema.name) {
            Self::check_same(known, schema)?;
            return Ok(handle.clone());
        }

        let mut tables = self.tables.write();
        if let Some((known, handle)) = tables.get(schema.name) {
            Self::check_same(known, schema)?;
            return Ok(handle.clone());
        }
        let handle = self.engine.open_table(schema.name, schema.table_options())?;
        debug!(table = schema.name, fields = ?schema.fields, "table registered");
        tables.insert(schema.name, (*schema, handle.clone()));
        Ok(handle)
    }

    fn check_same(known: &Schema, schema: &Schema) -> ResourceResult<()> {
        if known.fields != schema.fields {
            return Err(ResourceError::validation(format!(
                "table {:?} is registered as {} and cannot be reused as {}",
                schema.name, known, schema
            )));
        }
        Ok(())
    }

    /// Every encoded key of the schema's table, in key order.
    pub fn all_keys(&self, schema: &Schema) -> ResourceResult<Vec<Vec<u8>>> {
        let table = self.table(schema)?;
        Ok(self.engine.keys(&table, None)?)
    }

    /// Every key of the schema's table, decoded into parts.
    pub fn all_key_tuples(&self, schema: &Schema) -> ResourceResult<Vec<Vec<String>>> {
        self.all_keys(schema)?.iter().map(|k| codec::decode_key(k)).collect()
    }

    pub fn has_key(&self, schema: &Schema, encoded: &[u8]) -> ResourceResult<bool> {
        let table = self.table(schema)?;
        Ok(self.engine.contains_key(&table, encoded, None)?)
    }

    /// Encoded keys that start with `prefix`, in key order.
    pub fn keys_with_prefix(&self, schema: &Schema, prefix: &[u8]) -> ResourceResult<Vec<Vec<u8>>> {
        let table = self.table(schema)?;
        let txn = self.engine.begin()?;
        let mut cursor = txn.cursor(&table, CursorOptions::bulk())?;

        let mut keys = Vec::new();
        let mut entry = cursor.set_range(prefix)?;
        while let Some((key, _)) = entry {
            if !key.starts_with(prefix) {
                break;
            }
            keys.push(key);
            entry = cursor.next_nodup()?;
        }
        cursor.close();
        drop(cursor);
        txn.abort();
        Ok(keys)
    }

    /// Number of registered schemas.
    pub fn len(&self) -> usize {
        self.tables.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every registered table. Failures are collected, not fatal.
    pub fn close_all(&self) -> Vec<(&'static str, StoreError)> {
        let mut failures = Vec::new();
        for (name, (_, handle)) in self.tables.write().drain() {
            if let Err(e) = self.engine.close_table(&handle) {
                failures.push((name, e));
            }
        }
        failures
    }

    pub fn engine(&self) -> &Arc<StoreEngine> {
        &self.engine
    }
}

impl fmt::Debug for TableRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.tables.read().keys().copied().collect();
        names.sort_unstable();
        f.debug_struct("TableRegistry").field("tables", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use simplestore_core::Config;
    use tempfile::TempDir;

    const USERS: Schema = Schema::new("users", &["org", "name"]);

    fn registry() -> (TableRegistry, TempDir) {
        let dir = TempDir::new().unwrap();
        let engine = Arc::new(StoreEngine::open(dir.path(), Config::relaxed()).unwrap());
        (TableRegistry::new(engine), dir)
    }

    #[test]
    fn test_registration_is_cached() {
        let (registry, _dir) = registry();
        let a = registry.table(&USERS).unwrap();
        let b = registry.table(&USERS).unwrap();
        assert_eq!(a.name(), b.name());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_conflicting_schema_rejected() {
        let (registry, _dir) = registry();
        registry.table(&USERS).unwrap();
        let other = Schema::new("users", &["id"]);
        assert!(matches!(registry.table(&other), Err(ResourceError::Validation(_))));
    }

    #[test]
    fn test_schema_options_reach_the_table() {
        let (registry, _dir) = registry();
        let schema = Schema::new("fixed", &["id"]).with_record_len(64).with_duplicates();
        let table = registry.table(&schema).unwrap();
        assert_eq!(table.options().record_len, Some(64));
        assert!(table.options().duplicates);
        assert_eq!(schema.arity(), 1);
        assert_eq!(schema.to_string(), "fixed(id)");
    }

    #[test]
    fn test_keys_and_prefix_scan() {
        let (registry, _dir) = registry();
        let table = registry.table(&USERS).unwrap();
        for key in ["acme bob", "acme alice", "acmex carol", "zeta dan"] {
            registry.engine().put(&table, key.as_bytes(), b"v", None).unwrap();
        }

        let tuples = registry.all_key_tuples(&USERS).unwrap();
        assert_eq!(tuples[0], vec!["acme", "alice"]);
        assert_eq!(tuples.len(), 4);

        let prefixed = registry.keys_with_prefix(&USERS, b"acme ").unwrap();
        assert_eq!(prefixed, vec![b"acme alice".to_vec(), b"acme bob".to_vec()]);
        assert!(registry.has_key(&USERS, b"zeta dan").unwrap());
        assert!(!registry.has_key(&USERS, b"zeta eve").unwrap());
    }

    #[test]
    fn test_close_all_closes_handles() {
        let (registry, _dir) = registry();
        let table = registry.table(&USERS).unwrap();
        assert!(registry.close_all().is_empty());
        assert!(table.is_closed());
        assert!(registry.is_empty());
    }
}
