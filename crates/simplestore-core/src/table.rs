//! Named tables: options, handles and the ordered record maps behind them.
//!
//! A table maps a byte key to one or more records. Non-duplicate tables keep
//! exactly one record per key; duplicate tables keep every record put under a
//! key in insertion order.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::iter::Peekable;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use crate::error::{StoreError, StoreResult};

/// Committed records of one table.
pub(crate) type Records = BTreeMap<Vec<u8>, Vec<Vec<u8>>>;

/// Uncommitted writes of one transaction to one table. `None` marks a delete.
pub(crate) type Overlay = BTreeMap<Vec<u8>, Option<Vec<Vec<u8>>>>;

/// One key and all of its records, as seen by a reader.
pub type KeyGroup = (Vec<u8>, Vec<Vec<u8>>);

/// How a table stores its records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableOptions {
    /// Fixed record length; shorter values are padded, longer ones rejected
    pub record_len: Option<usize>,
    /// Byte used to pad fixed-length records
    pub pad_byte: u8,
    /// Keep every record put under a key instead of overwriting
    pub duplicates: bool,
}

impl TableOptions {
    pub fn new() -> Self {
        Self { record_len: None, pad_byte: b' ', duplicates: false }
    }

    pub fn record_len(mut self, len: usize) -> Self {
        self.record_len = Some(len);
        self
    }

    pub fn duplicates(mut self, enabled: bool) -> Self {
        self.duplicates = enabled;
        self
    }

    /// Apply the fixed record length, if any, to a value about to be stored.
    pub(crate) fn shape_record(&self, table: &str, value: &[u8]) -> StoreResult<Vec<u8>> {
        match self.record_len {
            None => Ok(value.to_vec()),
            Some(len) if value.len() > len => Err(StoreError::RecordTooLong {
                table: table.to_string(),
                len: value.len(),
                record_len: len,
            }),
            Some(len) => {
                let mut record = Vec::with_capacity(len);
                record.extend_from_slice(value);
                record.resize(len, self.pad_byte);
                Ok(record)
            }
        }
    }
}

impl Default for TableOptions {
    fn default() -> Self { Self::new() }
}

#[derive(Debug)]
struct TableMeta {
    name: String,
    options: TableOptions,
    closed: AtomicBool,
}

/// Handle to an open table. Cheap to clone; every clone observes `close`.
#[derive(Debug, Clone)]
pub struct TableHandle {
    meta: Arc<TableMeta>,
}

impl TableHandle {
    pub(crate) fn new(name: &str, options: TableOptions) -> Self {
        Self {
            meta: Arc::new(TableMeta {
                name: name.to_string(),
                options,
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.meta.name
    }

    pub fn options(&self) -> &TableOptions {
        &self.meta.options
    }

    pub fn is_closed(&self) -> bool {
        self.meta.closed.load(AtomicOrdering::Acquire)
    }

    pub(crate) fn mark_closed(&self) {
        self.meta.closed.store(true, AtomicOrdering::Release);
    }

    pub(crate) fn ensure_open(&self) -> StoreResult<()> {
        if self.is_closed() {
            Err(StoreError::TableClosed(self.meta.name.clone()))
        } else {
            Ok(())
        }
    }

    pub(crate) fn same_table(&self, other: &TableHandle) -> bool {
        Arc::ptr_eq(&self.meta, &other.meta)
    }
}

type BaseIter<'a> = Box<dyn Iterator<Item = (&'a Vec<u8>, &'a Vec<Vec<u8>>)> + 'a>;
type OverlayIter<'a> = Box<dyn Iterator<Item = (&'a Vec<u8>, &'a Option<Vec<Vec<u8>>>)> + 'a>;

/// Committed records merged with a transaction's overlay, in key order
/// (or reverse key order). Overlay entries shadow committed ones; deleted
/// and empty keys are skipped.
pub(crate) struct MergedRange<'a> {
    base: Peekable<BaseIter<'a>>,
    overlay: Peekable<OverlayIter<'a>>,
    reverse: bool,
}

impl<'a> MergedRange<'a> {
    pub(crate) fn new(
        base: Option<&'a Records>,
        overlay: Option<&'a Overlay>,
        lower: Bound<&[u8]>,
        upper: Bound<&[u8]>,
        reverse: bool,
    ) -> Self {
        let base: BaseIter<'a> = match base {
            Some(records) if reverse => Box::new(records.range::<[u8], _>((lower, upper)).rev()),
            Some(records) => Box::new(records.range::<[u8], _>((lower, upper))),
            None => Box::new(std::iter::empty()),
        };
        let overlay: OverlayIter<'a> = match overlay {
            Some(writes) if reverse => Box::new(writes.range::<[u8], _>((lower, upper)).rev()),
            Some(writes) => Box::new(writes.range::<[u8], _>((lower, upper))),
            None => Box::new(std::iter::empty()),
        };
        Self { base: base.peekable(), overlay: overlay.peekable(), reverse }
    }
}

impl<'a> Iterator for MergedRange<'a> {
    type Item = (&'a Vec<u8>, &'a Vec<Vec<u8>>);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            // Less: the committed entry comes first in iteration order
            let order = match (self.base.peek(), self.overlay.peek()) {
                (None, None) => return None,
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (Some((bk, _)), Some((ok, _))) => {
                    let o = bk.cmp(ok);
                    if self.reverse { o.reverse() } else { o }
                }
            };

            let shadowed = match order {
                Ordering::Less => {
                    let (key, records) = self.base.next()?;
                    if records.is_empty() { continue; }
                    return Some((key, records));
                }
                Ordering::Equal => {
                    self.base.next();
                    self.overlay.next()?
                }
                Ordering::Greater => self.overlay.next()?,
            };

            match shadowed {
                (key, Some(records)) if !records.is_empty() => return Some((key, records)),
                _ => continue,
            }
        }
    }
}
