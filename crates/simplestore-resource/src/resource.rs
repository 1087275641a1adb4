//! Typed resources: values stored under composite string keys.
//!
//! A resource type names its table and key fields through [`ResourceType`];
//! a [`Resource`] is one key of that type. Handles are cheap and hold no
//! value: every `get` reads the engine.

use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::info;

use simplestore_core::{CursorOptions, TableHandle, Transaction};

use crate::codec;
use crate::cursor::Cursor;
use crate::environment::Environment;
use crate::error::{ResourceError, ResourceResult};
use crate::registry::Schema;

/// A kind of resource: its table layout, value type and default rule.
pub trait ResourceType: Sized + 'static {
    const SCHEMA: Schema;

    /// Stored in every value envelope; bump when `Value` changes shape.
    const VALUE_VERSION: u16 = 1;

    type Value: Serialize + DeserializeOwned + Clone;

    /// Value to create (and persist) when a key has none.
    /// `None` means the type has no default rule.
    fn make_details(_resource: &Resource<Self>) -> Option<Self::Value> {
        None
    }
}

/// One key of resource type `T`.
pub struct Resource<T: ResourceType> {
    env: Arc<Environment>,
    table: TableHandle,
    parts: Vec<String>,
    db_key: Vec<u8>,
    _type: PhantomData<fn() -> T>,
}

/// Outcome of [`Resource::rename_all`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenameReport {
    /// Entries matching the search
    pub matched: usize,
    /// Entries in the table
    pub total: usize,
    /// Old and new encoded key of every renamed entry, in key order
    pub renamed: Vec<(String, String)>,
}

impl<T: ResourceType> Resource<T> {
    /// Handle for the key `parts` in `env`.
    pub fn open<S: AsRef<str>>(env: &Arc<Environment>, parts: &[S]) -> ResourceResult<Self> {
        let db_key = codec::encode_key(parts, T::SCHEMA.arity())?;
        let table = env.registry().table(&T::SCHEMA)?;
        Ok(Self {
            env: Arc::clone(env),
            table,
            parts: parts.iter().map(|p| p.as_ref().to_string()).collect(),
            db_key,
            _type: PhantomData,
        })
    }

    /// Handle for the key `parts` in the process-wide environment.
    pub fn new<S: AsRef<str>>(parts: &[S]) -> ResourceResult<Self> {
        Self::open(&Environment::global()?, parts)
    }

    /// Key parts, in schema order.
    pub fn key(&self) -> &[String] {
        &self.parts
    }

    /// Key parts by field name.
    pub fn info(&self) -> BTreeMap<&'static str, &str> {
        T::SCHEMA.fields.iter().copied().zip(self.parts.iter().map(String::as_str)).collect()
    }

    /// Value of one key field.
    pub fn field(&self, name: &str) -> Option<&str> {
        T::SCHEMA.field_index(name).map(|i| self.parts[i].as_str())
    }

    /// Encoded key as stored in the table.
    pub fn db_key(&self) -> &[u8] {
        &self.db_key
    }

    pub fn env(&self) -> &Arc<Environment> {
        &self.env
    }

    /// The stored value, or the result of [`make`](Self::make) when there is none.
    pub fn get(&self, txn: Option<&Transaction>) -> ResourceResult<Option<T::Value>> {
        match self.env.engine().get(&self.table, &self.db_key, txn)? {
            Some(bytes) => codec::deserialize(&bytes, T::VALUE_VERSION).map(Some),
            None => self.make(txn),
        }
    }

    /// Run the default rule and persist its value. Without a rule, returns
    /// `None` and stores nothing.
    pub fn make(&self, txn: Option<&Transaction>) -> ResourceResult<Option<T::Value>> {
        match T::make_details(self) {
            Some(value) => {
                self.put(Some(&value), txn)?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Store `value`, or delete the entry when `value` is `None`.
    ///
    /// On a duplicates schema every record under the key is replaced, inside
    /// `txn` or a transaction of its own.
    pub fn put(&self, value: Option<&T::Value>, txn: Option<&Transaction>) -> ResourceResult<()> {
        let engine = self.env.engine();
        let value = match value {
            Some(value) => value,
            None => {
                engine.delete(&self.table, &self.db_key, txn)?;
                return Ok(());
            }
        };
        let bytes = codec::serialize(value, T::VALUE_VERSION)?;
        if !self.table.options().duplicates {
            engine.put(&self.table, &self.db_key, &bytes, txn)?;
            return Ok(());
        }
        self.in_transaction(txn, |txn| {
            engine.delete(&self.table, &self.db_key, Some(txn))?;
            engine.put(&self.table, &self.db_key, &bytes, Some(txn))?;
            Ok(())
        })
    }

    /// Append `value` as one more record under the key. Only a duplicates
    /// schema keeps earlier records; otherwise this is `put`.
    pub fn put_dup(&self, value: &T::Value, txn: Option<&Transaction>) -> ResourceResult<()> {
        let bytes = codec::serialize(value, T::VALUE_VERSION)?;
        self.env.engine().put(&self.table, &self.db_key, &bytes, txn)?;
        Ok(())
    }

    /// Read-modify-write: store `f(current)` and return it.
    ///
    /// With `txn` everything happens inside it and the caller commits.
    /// Without, a transaction is begun and committed here, and aborted when
    /// any step fails.
    pub fn alter<F>(&self, f: F, txn: Option<&Transaction>) -> ResourceResult<Option<T::Value>>
    where
        F: FnOnce(Option<T::Value>) -> ResourceResult<Option<T::Value>>,
    {
        self.in_transaction(txn, |txn| self.alter_in(f, txn))
    }

    /// Run `work` inside `txn`, or inside a new transaction committed on
    /// success and aborted on failure.
    fn in_transaction<R, F>(&self, txn: Option<&Transaction>, work: F) -> ResourceResult<R>
    where
        F: FnOnce(&Transaction) -> ResourceResult<R>,
    {
        if let Some(txn) = txn {
            return work(txn);
        }
        let txn = self.env.begin_transaction()?;
        match work(&txn) {
            Ok(result) => {
                txn.commit()?;
                Ok(result)
            }
            Err(e) => {
                txn.abort();
                Err(e)
            }
        }
    }

    fn alter_in<F>(&self, f: F, txn: &Transaction) -> ResourceResult<Option<T::Value>>
    where
        F: FnOnce(Option<T::Value>) -> ResourceResult<Option<T::Value>>,
    {
        let before = self.get(Some(txn))?;
        let after = f(before)?;
        self.put(after.as_ref(), Some(txn))?;
        Ok(after)
    }

    /// Move the value to a new key with some fields replaced.
    ///
    /// Reads, deletes and rewrites as separate steps: pass `txn` to make
    /// the move atomic.
    pub fn rename<S: AsRef<str>>(&mut self, changes: &[(&str, S)], txn: Option<&Transaction>) -> ResourceResult<()> {
        let mut parts = self.parts.clone();
        for (field, value) in changes {
            let idx = T::SCHEMA.field_index(field).ok_or_else(|| {
                ResourceError::validation(format!(
                    "{:?} is not a key field of {}; expected one of {}",
                    field,
                    T::SCHEMA.name,
                    T::SCHEMA.fields.join(", ")
                ))
            })?;
            codec::validate_part(value.as_ref())?;
            parts[idx] = value.as_ref().to_string();
        }
        let db_key = codec::encode_key(&parts, T::SCHEMA.arity())?;

        let value = self.get(txn)?;
        self.put(None, txn)?;
        self.parts = parts;
        self.db_key = db_key;
        if value.is_some() {
            self.put(value.as_ref(), txn)?;
        }
        Ok(())
    }

    /// Rename every entry whose key fields equal all of `find`, applying
    /// `replace` to each. Best effort: entries are renamed one by one.
    pub fn rename_all<S: AsRef<str>>(
        env: &Arc<Environment>,
        find: &[(&str, S)],
        replace: &[(&str, S)],
    ) -> ResourceResult<RenameReport> {
        for (field, _) in find {
            if T::SCHEMA.field_index(field).is_none() {
                return Err(ResourceError::validation(format!(
                    "{:?} is not a key field of {}",
                    field,
                    T::SCHEMA.name
                )));
            }
        }

        let tuples = Self::db_key_tuples(env)?;
        let mut matching = Vec::new();
        for parts in &tuples {
            let entry = Self::open(env, parts)?;
            if find.iter().all(|(field, value)| entry.field(field) == Some(value.as_ref())) {
                matching.push(entry);
            }
        }
        info!(
            resource = T::SCHEMA.name,
            matched = matching.len(),
            total = tuples.len(),
            "rename: {} / {} {}",
            matching.len(),
            tuples.len(),
            if matching.len() == 1 { "entry matches" } else { "entries match" }
        );

        let mut report = RenameReport { matched: matching.len(), total: tuples.len(), renamed: Vec::new() };
        for (i, mut entry) in matching.into_iter().enumerate() {
            let old = entry.key_string();
            entry.rename(replace, None)?;
            let new = entry.key_string();
            info!(resource = T::SCHEMA.name, "rename {} / {} '{}' -> '{}'", i + 1, report.matched, old, new);
            report.renamed.push((old, new));
        }
        Ok(report)
    }

    /// Value of every entry in the table, in key order.
    pub fn all(env: &Arc<Environment>) -> ResourceResult<Vec<T::Value>> {
        let mut values = Vec::new();
        for parts in Self::db_key_tuples(env)? {
            if let Some(value) = Self::open(env, &parts)?.get(None)? {
                values.push(value);
            }
        }
        Ok(values)
    }

    /// Encoded keys of every entry, in key order.
    pub fn db_keys(env: &Arc<Environment>) -> ResourceResult<Vec<Vec<u8>>> {
        env.registry().all_keys(&T::SCHEMA)
    }

    /// Keys of every entry, split into parts.
    pub fn db_key_tuples(env: &Arc<Environment>) -> ResourceResult<Vec<Vec<String>>> {
        env.registry().all_key_tuples(&T::SCHEMA)
    }

    /// Whether the table has an entry under the encoded key.
    pub fn has_key(env: &Arc<Environment>, db_key: &[u8]) -> ResourceResult<bool> {
        env.registry().has_key(&T::SCHEMA, db_key)
    }

    /// Cursor over this type's table, bound to `txn`.
    pub fn cursor<'t>(env: &Arc<Environment>, txn: &'t Transaction, bulk: bool) -> ResourceResult<Cursor<'t, T>> {
        let table = env.registry().table(&T::SCHEMA)?;
        Ok(Cursor::new(txn.cursor(&table, CursorOptions { bulk })?))
    }

    fn key_string(&self) -> String {
        String::from_utf8_lossy(&self.db_key).into_owned()
    }

    fn type_name() -> &'static str {
        let full = std::any::type_name::<T>();
        full.rsplit("::").next().unwrap_or(full)
    }
}

impl<T: ResourceType> Clone for Resource<T> {
    fn clone(&self) -> Self {
        Self {
            env: Arc::clone(&self.env),
            table: self.table.clone(),
            parts: self.parts.clone(),
            db_key: self.db_key.clone(),
            _type: PhantomData,
        }
    }
}

impl<T: ResourceType> PartialEq for Resource<T> {
    fn eq(&self, other: &Self) -> bool {
        self.parts == other.parts
    }
}

impl<T: ResourceType> Eq for Resource<T> {}

impl<T: ResourceType> fmt::Display for Resource<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(\"{}\")", Self::type_name(), self.key_string())
    }
}

impl<T: ResourceType> fmt::Debug for Resource<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
