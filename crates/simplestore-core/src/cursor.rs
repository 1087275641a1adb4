//! Positioned iteration over one table inside a transaction.
//!
//! A cursor sits on one record: a key plus an index into that key's
//! duplicates. Moving past either end returns `None` and leaves the cursor
//! where it was.

use std::collections::VecDeque;
use std::ops::Bound;

use crate::error::{StoreError, StoreResult};
use crate::table::{KeyGroup, TableHandle};
use crate::transaction::Transaction;

/// A key and one of its records.
pub type Entry = (Vec<u8>, Vec<u8>);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CursorOptions {
    /// Read key groups ahead in batches of `Config::bulk_prefetch`.
    /// A write by the owning transaction discards the batch.
    pub bulk: bool,
}

impl CursorOptions {
    pub fn bulk() -> Self {
        Self { bulk: true }
    }
}

pub struct RawCursor<'t> {
    txn: &'t Transaction,
    table: TableHandle,
    options: CursorOptions,
    /// Current key group and the index of the current record in it
    current: Option<(KeyGroup, usize)>,
    /// Groups following `current` in key order, bulk mode only
    ahead: VecDeque<KeyGroup>,
    /// Transaction write counter when `current` and `ahead` were read
    seen_seq: u64,
    closed: bool,
}

impl<'t> RawCursor<'t> {
    pub(crate) fn new(txn: &'t Transaction, table: TableHandle, options: CursorOptions) -> StoreResult<Self> {
        table.ensure_open()?;
        Ok(Self { txn, table, options, current: None, ahead: VecDeque::new(), seen_seq: 0, closed: false })
    }

    pub fn table(&self) -> &TableHandle {
        &self.table
    }

    pub fn options(&self) -> CursorOptions {
        self.options
    }

    /// First record of the first key.
    pub fn first(&mut self) -> StoreResult<Option<Entry>> {
        self.seek_forward(Bound::Unbounded)
    }

    /// Last record of the last key.
    pub fn last(&mut self) -> StoreResult<Option<Entry>> {
        self.seek_backward(Bound::Unbounded)
    }

    /// Next record: the next duplicate, else the first record of the next key.
    /// An unpositioned cursor moves to `first`.
    pub fn next(&mut self) -> StoreResult<Option<Entry>> {
        if let Some(entry) = self.next_dup()? {
            return Ok(Some(entry));
        }
        self.next_nodup()
    }

    /// Next duplicate of the current key only.
    pub fn next_dup(&mut self) -> StoreResult<Option<Entry>> {
        self.ensure_usable()?;
        self.refresh_current();
        match &mut self.current {
            Some((group, idx)) if *idx + 1 < group.1.len() => {
                *idx += 1;
                Ok(Some((group.0.clone(), group.1[*idx].clone())))
            }
            _ => Ok(None),
        }
    }

    /// First record of the next key, skipping remaining duplicates.
    pub fn next_nodup(&mut self) -> StoreResult<Option<Entry>> {
        self.ensure_usable()?;
        let key = match &self.current {
            Some(((key, _), _)) => key.clone(),
            None => return self.first(),
        };
        self.refresh_current();
        if let Some(group) = self.ahead.pop_front() {
            return Ok(self.land(group, 0));
        }
        self.seek_forward(Bound::Excluded(key.as_slice()))
    }

    /// Previous record: the previous duplicate, else the last record of the
    /// previous key. An unpositioned cursor moves to `last`.
    pub fn prev(&mut self) -> StoreResult<Option<Entry>> {
        self.ensure_usable()?;
        self.refresh_current();
        let key = match &mut self.current {
            Some((group, idx)) if *idx > 0 => {
                *idx -= 1;
                return Ok(Some((group.0.clone(), group.1[*idx].clone())));
            }
            Some(((key, _), _)) => key.clone(),
            None => return self.last(),
        };
        self.seek_backward(Bound::Excluded(key.as_slice()))
    }

    /// Position on `key` exactly. Returns its first record, or `None` (the
    /// cursor stays put) when the key is absent.
    pub fn set(&mut self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        self.ensure_usable()?;
        let group = self
            .txn
            .engine()
            .view_key(self.table.name(), Some(self.txn.state()), key)
            .map(|records| (key.to_vec(), records));
        match group {
            Some(group) => {
                self.ahead.clear();
                Ok(self.land(group, 0).map(|(_, v)| v))
            }
            None => Ok(None),
        }
    }

    /// Position on the first key `>= key`.
    pub fn set_range(&mut self, key: &[u8]) -> StoreResult<Option<Entry>> {
        self.seek_forward(Bound::Included(key))
    }

    /// Record under the cursor.
    pub fn current(&mut self) -> StoreResult<Option<Entry>> {
        self.ensure_usable()?;
        self.refresh_current();
        Ok(self
            .current
            .as_ref()
            .and_then(|((key, records), idx)| records.get(*idx).map(|r| (key.clone(), r.clone()))))
    }

    /// Number of records under the current key.
    pub fn count(&mut self) -> StoreResult<usize> {
        self.ensure_usable()?;
        self.refresh_current();
        Ok(self.current.as_ref().map_or(0, |((_, records), _)| records.len()))
    }

    /// A second cursor at the same position with its own read-ahead.
    pub fn dup(&self) -> StoreResult<RawCursor<'t>> {
        self.ensure_usable()?;
        Ok(Self {
            txn: self.txn,
            table: self.table.clone(),
            options: self.options,
            current: self.current.clone(),
            ahead: VecDeque::new(),
            seen_seq: self.seen_seq,
            closed: false,
        })
    }

    /// Release the cursor. Idempotent; any later move fails with `CursorClosed`.
    pub fn close(&mut self) {
        self.closed = true;
        self.current = None;
        self.ahead.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn ensure_usable(&self) -> StoreResult<()> {
        if self.closed {
            return Err(StoreError::CursorClosed(self.table.name().to_string()));
        }
        if self.txn.is_finished() {
            return Err(StoreError::TransactionFinished(self.txn.id()));
        }
        self.table.ensure_open()
    }

    fn batch_size(&self) -> usize {
        if self.options.bulk {
            self.txn.engine().config().bulk_prefetch.max(1)
        } else {
            1
        }
    }

    fn write_seq(&self) -> u64 {
        self.txn.state().lock().write_seq
    }

    /// Re-read the current group so the cursor sees the latest writes.
    /// Bulk cursors skip this until their transaction writes, then drop the
    /// read-ahead as well.
    fn refresh_current(&mut self) {
        let seq = self.write_seq();
        if self.options.bulk && seq == self.seen_seq {
            return;
        }
        self.seen_seq = seq;
        self.ahead.clear();
        if let Some(((key, records), idx)) = &mut self.current {
            if let Some(latest) = self.txn.engine().view_key(self.table.name(), Some(self.txn.state()), key) {
                *idx = (*idx).min(latest.len() - 1);
                *records = latest;
            }
        }
    }

    fn land(&mut self, group: KeyGroup, idx: usize) -> Option<Entry> {
        self.seen_seq = self.write_seq();
        let entry = group.1.get(idx).map(|r| (group.0.clone(), r.clone()));
        self.current = Some((group, idx));
        entry
    }

    fn seek_forward(&mut self, lower: Bound<&[u8]>) -> StoreResult<Option<Entry>> {
        self.ensure_usable()?;
        let mut groups = self.txn.engine().view_groups(
            self.table.name(),
            Some(self.txn.state()),
            lower,
            Bound::Unbounded,
            false,
            self.batch_size(),
        );
        if groups.is_empty() {
            return Ok(None);
        }
        let head = groups.remove(0);
        self.ahead = groups.into();
        Ok(self.land(head, 0))
    }

    fn seek_backward(&mut self, upper: Bound<&[u8]>) -> StoreResult<Option<Entry>> {
        self.ensure_usable()?;
        let groups = self.txn.engine().view_groups(
            self.table.name(),
            Some(self.txn.state()),
            Bound::Unbounded,
            upper,
            true,
            1,
        );
        match groups.into_iter().next() {
            Some(group) => {
                self.ahead.clear();
                let idx = group.1.len().saturating_sub(1);
                Ok(self.land(group, idx))
            }
            None => Ok(None),
        }
    }
}

impl std::fmt::Debug for RawCursor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawCursor")
            .field("table", &self.table.name())
            .field("bulk", &self.options.bulk)
            .field("positioned", &self.current.is_some())
            .field("closed", &self.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::engine::StoreEngine;
    use crate::table::TableOptions;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn setup(options: TableOptions) -> (Arc<StoreEngine>, TableHandle, TempDir) {
        let dir = TempDir::new().unwrap();
        let engine = Arc::new(StoreEngine::open(dir.path(), Config::relaxed()).unwrap());
        let table = engine.open_table("t", options).unwrap();
        (engine, table, dir)
    }

    fn entry(k: &str, v: &str) -> Option<Entry> {
        Some((k.as_bytes().to_vec(), v.as_bytes().to_vec()))
    }

    #[test]
    fn test_walk_forward_and_stop_at_end() {
        let (engine, t, _dir) = setup(TableOptions::new());
        for k in ["a", "b", "c"] {
            engine.put(&t, k.as_bytes(), k.as_bytes(), None).unwrap();
        }
        let txn = engine.begin().unwrap();
        for options in [CursorOptions::default(), CursorOptions::bulk()] {
            let mut cur = txn.cursor(&t, options).unwrap();
            assert_eq!(cur.next().unwrap(), entry("a", "a"));
            assert_eq!(cur.next().unwrap(), entry("b", "b"));
            assert_eq!(cur.next().unwrap(), entry("c", "c"));
            assert_eq!(cur.next().unwrap(), None);
            assert_eq!(cur.current().unwrap(), entry("c", "c"));
        }
    }

    #[test]
    fn test_walk_backward() {
        let (engine, t, _dir) = setup(TableOptions::new());
        for k in ["a", "b"] {
            engine.put(&t, k.as_bytes(), b"v", None).unwrap();
        }
        let txn = engine.begin().unwrap();
        let mut cur = txn.cursor(&t, CursorOptions::default()).unwrap();
        assert_eq!(cur.prev().unwrap(), entry("b", "v"));
        assert_eq!(cur.prev().unwrap(), entry("a", "v"));
        assert_eq!(cur.prev().unwrap(), None);
        assert_eq!(cur.last().unwrap(), entry("b", "v"));
    }

    #[test]
    fn test_duplicates_navigation() {
        let (engine, t, _dir) = setup(TableOptions::new().duplicates(true));
        engine.put(&t, b"a", b"1", None).unwrap();
        engine.put(&t, b"a", b"2", None).unwrap();
        engine.put(&t, b"b", b"3", None).unwrap();

        let txn = engine.begin().unwrap();
        let mut cur = txn.cursor(&t, CursorOptions::bulk()).unwrap();
        assert_eq!(cur.first().unwrap(), entry("a", "1"));
        assert_eq!(cur.count().unwrap(), 2);
        assert_eq!(cur.next_dup().unwrap(), entry("a", "2"));
        assert_eq!(cur.next_dup().unwrap(), None);
        assert_eq!(cur.next().unwrap(), entry("b", "3"));

        cur.first().unwrap();
        assert_eq!(cur.next_nodup().unwrap(), entry("b", "3"));
        assert_eq!(cur.prev().unwrap(), entry("a", "2"));
        assert_eq!(cur.prev().unwrap(), entry("a", "1"));
    }

    #[test]
    fn test_set_and_set_range() {
        let (engine, t, _dir) = setup(TableOptions::new());
        for k in ["apple", "banana", "cherry"] {
            engine.put(&t, k.as_bytes(), b"v", None).unwrap();
        }
        let txn = engine.begin().unwrap();
        let mut cur = txn.cursor(&t, CursorOptions::default()).unwrap();
        assert_eq!(cur.set(b"banana").unwrap(), Some(b"v".to_vec()));
        assert_eq!(cur.set(b"blueberry").unwrap(), None);
        assert_eq!(cur.current().unwrap(), entry("banana", "v"));
        assert_eq!(cur.set_range(b"blueberry").unwrap(), entry("cherry", "v"));
        assert_eq!(cur.set_range(b"zzz").unwrap(), None);
    }

    #[test]
    fn test_sees_own_uncommitted_writes() {
        let (engine, t, _dir) = setup(TableOptions::new());
        engine.put(&t, b"a", b"1", None).unwrap();
        engine.put(&t, b"c", b"3", None).unwrap();

        let txn = engine.begin().unwrap();
        engine.put(&t, b"b", b"2", Some(&txn)).unwrap();
        engine.delete(&t, b"c", Some(&txn)).unwrap();

        let mut cur = txn.cursor(&t, CursorOptions::default()).unwrap();
        assert_eq!(cur.first().unwrap(), entry("a", "1"));
        assert_eq!(cur.next().unwrap(), entry("b", "2"));
        assert_eq!(cur.next().unwrap(), None);
    }

    #[test]
    fn test_walk_sees_writes_made_mid_walk() {
        let (engine, t, _dir) = setup(TableOptions::new());
        for k in ["1", "2", "4"] {
            engine.put(&t, k.as_bytes(), k.as_bytes(), None).unwrap();
        }

        for options in [CursorOptions::default(), CursorOptions::bulk()] {
            let txn = engine.begin().unwrap();
            let mut cur = txn.cursor(&t, options).unwrap();
            let mut keys = vec![cur.next().unwrap().unwrap().0];

            engine.put(&t, b"3", b"3", Some(&txn)).unwrap();
            engine.put(&t, b"1", b"100", Some(&txn)).unwrap();
            assert_eq!(cur.current().unwrap(), entry("1", "100"), "{:?}", options);

            while let Some((key, _)) = cur.next().unwrap() {
                keys.push(key);
            }
            let expected: Vec<Vec<u8>> = ["1", "2", "3", "4"].iter().map(|k| k.as_bytes().to_vec()).collect();
            assert_eq!(keys, expected, "{:?}", options);
            drop(cur);
            txn.abort();
        }
    }

    #[test]
    fn test_bulk_drops_read_ahead_after_delete() {
        let (engine, t, _dir) = setup(TableOptions::new());
        for k in ["a", "b", "c"] {
            engine.put(&t, k.as_bytes(), b"v", None).unwrap();
        }
        let txn = engine.begin().unwrap();
        let mut cur = txn.cursor(&t, CursorOptions::bulk()).unwrap();
        assert_eq!(cur.first().unwrap(), entry("a", "v"));
        engine.delete(&t, b"b", Some(&txn)).unwrap();
        assert_eq!(cur.next().unwrap(), entry("c", "v"));
        assert_eq!(cur.next().unwrap(), None);
    }

    #[test]
    fn test_dup_is_independent() {
        let (engine, t, _dir) = setup(TableOptions::new());
        for k in ["a", "b", "c"] {
            engine.put(&t, k.as_bytes(), b"v", None).unwrap();
        }
        let txn = engine.begin().unwrap();
        let mut cur = txn.cursor(&t, CursorOptions::bulk()).unwrap();
        cur.first().unwrap();
        let mut other = cur.dup().unwrap();
        assert_eq!(other.next().unwrap(), entry("b", "v"));
        assert_eq!(cur.current().unwrap(), entry("a", "v"));
    }

    #[test]
    fn test_close_is_idempotent() {
        let (engine, t, _dir) = setup(TableOptions::new());
        let txn = engine.begin().unwrap();
        let mut cur = txn.cursor(&t, CursorOptions::default()).unwrap();
        cur.close();
        cur.close();
        assert!(cur.is_closed());
        assert!(matches!(cur.first(), Err(StoreError::CursorClosed(_))));
    }

    #[test]
    fn test_empty_table() {
        let (engine, t, _dir) = setup(TableOptions::new());
        let txn = engine.begin().unwrap();
        let mut cur = txn.cursor(&t, CursorOptions::default()).unwrap();
        assert_eq!(cur.first().unwrap(), None);
        assert_eq!(cur.next().unwrap(), None);
        assert_eq!(cur.count().unwrap(), 0);
    }
}
