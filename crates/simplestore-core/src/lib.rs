//! SimpleStore Core: embedded transactional key-value engine
//!
//! Named ordered tables live in RAM; every committed transaction is written
//! to a write-ahead log before it becomes visible, so a restart replays the
//! log and recovers exactly the committed state.
//!
//! # Architecture
//!
//! - **Tables**: ordered byte keys, one record per key or many (duplicates),
//!   optionally fixed-length records padded with spaces
//! - **Transactions**: buffered writes, per-key exclusive locks, all-or-nothing commit
//! - **Cursors**: positioned forward/backward iteration, with optional read-ahead
//! - **WAL**: checksummed batches, one per commit, rotated by size and
//!   compacted by checkpoint

pub mod config;
pub mod cursor;
pub mod engine;
pub mod error;
pub mod format;
mod lock;
mod lockfile;
pub mod table;
pub mod transaction;
pub mod wal;

// Re-export key types for convenience
pub use config::Config;
pub use cursor::{CursorOptions, Entry, RawCursor};
pub use engine::StoreEngine;
pub use error::{StoreError, StoreResult};
pub use format::Operation;
pub use table::{KeyGroup, TableHandle, TableOptions};
pub use transaction::Transaction;
pub use wal::{WalReader, WalWriter};
