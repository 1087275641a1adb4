//! Row-set resources with upsert-by-match and match-based removal.
//!
//! A tabular value is an ordered list of rows; a row maps column names to
//! cells. The type decides which rows "match" through [`TabularType::matches`].

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use simplestore_core::Transaction;

use crate::codec;
use crate::environment::Environment;
use crate::error::{ResourceError, ResourceResult};
use crate::resource::{Resource, ResourceType};

#[derive(Debug, Clone, PartialEq, PartialOrd, Serialize, Deserialize)]
pub enum Cell {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cell::Null => f.write_str("null"),
            Cell::Bool(b) => write!(f, "{}", b),
            Cell::Int(i) => write!(f, "{}", i),
            Cell::Float(x) => write!(f, "{}", x),
            Cell::Str(s) => f.write_str(s),
        }
    }
}

impl From<bool> for Cell {
    fn from(b: bool) -> Self {
        Cell::Bool(b)
    }
}

impl From<i64> for Cell {
    fn from(i: i64) -> Self {
        Cell::Int(i)
    }
}

impl From<f64> for Cell {
    fn from(x: f64) -> Self {
        Cell::Float(x)
    }
}

impl From<&str> for Cell {
    fn from(s: &str) -> Self {
        Cell::Str(s.to_string())
    }
}

impl From<String> for Cell {
    fn from(s: String) -> Self {
        Cell::Str(s)
    }
}

pub type Row = BTreeMap<String, Cell>;

pub type RowSet = Vec<Row>;

/// Build a row from `(column, cell)` pairs.
pub fn row<I, K, V>(cells: I) -> Row
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<Cell>,
{
    cells.into_iter().map(|(k, v)| (k.into(), v.into())).collect()
}

/// Input to [`Tabular::add`]: one row or a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum Rows {
    One(Row),
    Many(RowSet),
}

impl Rows {
    fn as_slice(&self) -> &[Row] {
        match self {
            Rows::One(row) => std::slice::from_ref(row),
            Rows::Many(rows) => rows,
        }
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_slice().is_empty()
    }
}

impl From<Row> for Rows {
    fn from(row: Row) -> Self {
        Rows::One(row)
    }
}

impl From<RowSet> for Rows {
    fn from(rows: RowSet) -> Self {
        Rows::Many(rows)
    }
}

/// A resource whose value is a row-set.
pub trait TabularType: ResourceType<Value = RowSet> {
    /// Whether `existing` is the row that `incoming` updates (or, for
    /// `remove`, one of the rows to delete).
    fn matches(incoming: &Row, existing: &Row) -> bool;

    /// Ordering applied after every `add`.
    fn sort_rows(_rows: &mut RowSet) {}
}

/// One key of a tabular type.
pub struct Tabular<T: TabularType> {
    inner: Resource<T>,
}

impl<T: TabularType> Tabular<T> {
    pub fn open<S: AsRef<str>>(env: &Arc<Environment>, parts: &[S]) -> ResourceResult<Self> {
        Ok(Self { inner: Resource::open(env, parts)? })
    }

    pub fn new<S: AsRef<str>>(parts: &[S]) -> ResourceResult<Self> {
        Ok(Self { inner: Resource::new(parts)? })
    }

    /// The stored rows, or an empty row-set (persisted on first read).
    pub fn get(&self, txn: Option<&Transaction>) -> ResourceResult<RowSet> {
        if let Some(rows) = self.inner.get(txn)? {
            return Ok(rows);
        }
        let empty = RowSet::new();
        self.inner.put(Some(&empty), txn)?;
        Ok(empty)
    }

    /// Upsert every incoming row, in order, then sort.
    ///
    /// The first existing row that matches gets the incoming cells written
    /// over it (other columns stay); without a match the row is appended.
    pub fn add(&self, rows: impl Into<Rows>, txn: Option<&Transaction>) -> ResourceResult<(Rows, RowSet)> {
        let rows = rows.into();
        let after = self.inner.alter(
            |current| {
                let mut set = current.unwrap_or_default();
                for incoming in rows.as_slice() {
                    match set.iter_mut().find(|existing| T::matches(incoming, existing)) {
                        Some(existing) => {
                            existing.extend(incoming.iter().map(|(k, v)| (k.clone(), v.clone())));
                        }
                        None => set.push(incoming.clone()),
                    }
                }
                T::sort_rows(&mut set);
                Ok(Some(set))
            },
            txn,
        )?;
        Ok((rows, after.unwrap_or_default()))
    }

    /// Delete every row matching `values`; returns the removed rows and the
    /// remaining ones.
    pub fn remove(&self, values: &Row, txn: Option<&Transaction>) -> ResourceResult<(RowSet, RowSet)> {
        let mut removed = RowSet::new();
        let after = self.inner.alter(
            |current| {
                let (gone, kept): (RowSet, RowSet) =
                    current.unwrap_or_default().into_iter().partition(|row| T::matches(values, row));
                removed = gone;
                Ok(Some(kept))
            },
            txn,
        )?;
        Ok((removed, after.unwrap_or_default()))
    }

    /// Full keys whose leading parts equal `prefix`, in key order. The prefix
    /// must name at least one field and fewer than all of them.
    pub fn keys_which_match<S: AsRef<str>>(env: &Arc<Environment>, prefix: &[S]) -> ResourceResult<Vec<Vec<String>>> {
        let arity = T::SCHEMA.arity();
        if prefix.is_empty() || prefix.len() >= arity {
            return Err(ResourceError::validation(format!(
                "{} prefix needs 1 to {} key parts, got {}",
                T::SCHEMA.name,
                arity.saturating_sub(1),
                prefix.len()
            )));
        }
        let encoded = codec::encode_prefix(prefix)?;
        env.registry()
            .keys_with_prefix(&T::SCHEMA, &encoded)?
            .iter()
            .map(|k| codec::decode_key(k))
            .collect()
    }

    pub fn resource(&self) -> &Resource<T> {
        &self.inner
    }
}

impl<T: TabularType> Deref for Tabular<T> {
    type Target = Resource<T>;

    fn deref(&self) -> &Resource<T> {
        &self.inner
    }
}

impl<T: TabularType> fmt::Debug for Tabular<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.inner, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Schema;
    use simplestore_core::Config;
    use tempfile::TempDir;

    struct Jobs;

    impl ResourceType for Jobs {
        const SCHEMA: Schema = Schema::new("Jobs", &["user", "project", "run"]);
        type Value = RowSet;
    }

    impl TabularType for Jobs {
        fn matches(incoming: &Row, existing: &Row) -> bool {
            incoming.get("id").is_some() && incoming.get("id") == existing.get("id")
        }

        fn sort_rows(rows: &mut RowSet) {
            rows.sort_by(|a, b| a.get("id").partial_cmp(&b.get("id")).unwrap_or(std::cmp::Ordering::Equal));
        }
    }

    fn env() -> (Arc<Environment>, TempDir) {
        let dir = TempDir::new().unwrap();
        let env = Environment::open(dir.path(), Config::relaxed()).unwrap();
        (env, dir)
    }

    #[test]
    fn test_upsert_merges_cells() {
        let (env, _dir) = env();
        let jobs = Tabular::<Jobs>::open(&env, &["u", "p", "1"]).unwrap();
        jobs.add(row([("id", Cell::Int(1)), ("state", "queued".into()), ("host", "h1".into())]), None).unwrap();

        let (_, rows) = jobs.add(row([("id", Cell::Int(1)), ("state", "done".into())]), None).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["state"], Cell::from("done"));
        assert_eq!(rows[0]["host"], Cell::from("h1"));
    }

    #[test]
    fn test_batch_appends_and_sorts() {
        let (env, _dir) = env();
        let jobs = Tabular::<Jobs>::open(&env, &["u", "p", "2"]).unwrap();
        let batch = vec![
            row([("id", 3i64)]),
            row([("id", 1i64)]),
            row([("id", 3i64)]),
        ];
        let (input, rows) = jobs.add(batch, None).unwrap();
        assert_eq!(input.len(), 3);
        let ids: Vec<_> = rows.iter().map(|r| r["id"].clone()).collect();
        assert_eq!(ids, vec![Cell::Int(1), Cell::Int(3)]);
    }

    #[test]
    fn test_remove_returns_matching_rows() {
        let (env, _dir) = env();
        let jobs = Tabular::<Jobs>::open(&env, &["u", "p", "3"]).unwrap();
        jobs.add(vec![row([("id", 1i64)]), row([("id", 2i64)])], None).unwrap();

        let (removed, rest) = jobs.remove(&row([("id", 2i64)]), None).unwrap();
        assert_eq!(removed, vec![row([("id", 2i64)])]);
        assert_eq!(rest, vec![row([("id", 1i64)])]);
        assert_eq!(jobs.get(None).unwrap(), rest);
    }

    #[test]
    fn test_keys_which_match() {
        let (env, _dir) = env();
        for parts in [["u", "a", "1"], ["u", "a", "2"], ["u", "b", "1"], ["v", "a", "1"]] {
            Tabular::<Jobs>::open(&env, &parts).unwrap().get(None).unwrap();
        }
        assert_eq!(Tabular::<Jobs>::keys_which_match(&env, &["u"]).unwrap().len(), 3);
        assert_eq!(
            Tabular::<Jobs>::keys_which_match(&env, &["u", "a"]).unwrap(),
            vec![vec!["u", "a", "1"], vec!["u", "a", "2"]]
        );
        assert!(matches!(
            Tabular::<Jobs>::keys_which_match::<&str>(&env, &[]),
            Err(ResourceError::Validation(_))
        ));
        assert!(matches!(
            Tabular::<Jobs>::keys_which_match(&env, &["u", "a", "1"]),
            Err(ResourceError::Validation(_))
        ));
    }

    #[test]
    fn test_cell_display() {
        assert_eq!(Cell::from(2.5).to_string(), "2.5");
        assert_eq!(Cell::Null.to_string(), "null");
        assert_eq!(Cell::from("x").to_string(), "x");
    }
}
