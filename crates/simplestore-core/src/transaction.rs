//! Transactions: buffered writes plus the keys they have locked.

use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::warn;

use crate::cursor::{CursorOptions, RawCursor};
use crate::engine::StoreEngine;
use crate::error::StoreResult;
use crate::format::WalOp;
use crate::table::{Overlay, TableHandle};

/// Mutable part of a transaction.
#[derive(Debug, Default)]
pub(crate) struct TxnState {
    /// Uncommitted writes per table
    pub(crate) overlay: HashMap<String, Overlay>,
    /// The same writes in order, as they will be logged
    pub(crate) log: Vec<WalOp>,
    /// Keys locked by this transaction
    pub(crate) locks: Vec<(String, Vec<u8>)>,
    /// Bumped on every buffered write; cursors compare it to drop stale reads
    pub(crate) write_seq: u64,
    pub(crate) finished: bool,
}

/// A unit of atomic work against one engine.
///
/// Reads inside the transaction see its own writes. Nothing is visible to
/// other readers until `commit`. Dropping an unfinished transaction aborts it.
pub struct Transaction {
    engine: Arc<StoreEngine>,
    id: u64,
    state: Mutex<TxnState>,
}

impl Transaction {
    pub(crate) fn new(engine: Arc<StoreEngine>, id: u64) -> Self {
        Self { engine, id, state: Mutex::new(TxnState::default()) }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn engine(&self) -> &Arc<StoreEngine> {
        &self.engine
    }

    /// Whether commit or abort has already run.
    pub fn is_finished(&self) -> bool {
        self.state.lock().finished
    }

    /// Number of writes buffered so far.
    pub fn pending_ops(&self) -> usize {
        self.state.lock().log.len()
    }

    /// Make every buffered write durable and visible, then release locks.
    pub fn commit(self) -> StoreResult<()> {
        self.engine.finish(self.id, &self.state, true)
    }

    /// Discard every buffered write and release locks.
    pub fn abort(self) {
        if let Err(e) = self.engine.finish(self.id, &self.state, false) {
            warn!(txn = self.id, error = %e, "abort failed");
        }
    }

    /// Open a cursor over `table` that sees this transaction's writes.
    pub fn cursor(&self, table: &TableHandle, options: CursorOptions) -> StoreResult<RawCursor<'_>> {
        RawCursor::new(self, table.clone(), options)
    }

    pub(crate) fn state(&self) -> &Mutex<TxnState> {
        &self.state
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.state.lock().finished {
            let _ = self.engine.finish(self.id, &self.state, false);
        }
    }
}
