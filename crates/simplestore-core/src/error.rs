//! Error types for SimpleStore engine operations
//!
//! All engine errors are represented by the StoreError enum, which carries
//! enough context (paths, offsets, table names) to diagnose a failure
//! without re-running it.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// SimpleStore engine error types with detailed context
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// I/O operation failed
    #[error("I/O error{}: {message} ({kind})", .path.as_ref().map(|p| format!(" in {}", p.display())).unwrap_or_default())]
    Io {
        /// The file path where the error occurred
        path: Option<PathBuf>,
        /// The underlying I/O error kind
        kind: std::io::ErrorKind,
        /// Human-readable description
        message: String,
    },

    /// WAL file is corrupted and cannot be recovered
    #[error("WAL corrupted in {} at offset {offset}: {reason}", .path.display())]
    WalCorrupted {
        path: PathBuf,
        offset: u64,
        reason: String,
    },

    /// Checksum verification failed
    #[error("Checksum mismatch in {} at offset {offset}: expected 0x{expected:08x}, got 0x{actual:08x}", .path.display())]
    ChecksumMismatch {
        path: PathBuf,
        expected: u32,
        actual: u32,
        offset: u64,
    },

    /// Torn write detected (partial batch at end of file)
    #[error("Torn write in {} at offset {offset}: expected {expected_size} bytes, only {available_bytes} available", .path.display())]
    TornWrite {
        path: PathBuf,
        expected_size: u32,
        available_bytes: u64,
        offset: u64,
    },

    /// Magic bytes not found at expected location
    #[error("Magic bytes not found in {} at offset {offset}: found {:02x}{:02x}{:02x}{:02x}", .path.display(), .found_bytes[0], .found_bytes[1], .found_bytes[2], .found_bytes[3])]
    NoMagicFound {
        path: PathBuf,
        offset: u64,
        found_bytes: [u8; 4],
    },

    /// Key, value or table name exceeds the configured maximum
    #[error("Entry {component} too large: {entry_size} bytes exceeds limit of {max_size} bytes")]
    OversizedEntry {
        entry_size: u64,
        max_size: u64,
        component: String,
    },

    /// Value longer than the fixed record length of its table
    #[error("Record for table '{table}' is {len} bytes, fixed record length is {record_len}")]
    RecordTooLong {
        table: String,
        len: usize,
        record_len: usize,
    },

    /// Table handle used after `close_table`
    #[error("Table '{0}' is closed")]
    TableClosed(String),

    /// Engine used after `close`
    #[error("Engine at {} is closed", .0.display())]
    EngineClosed(PathBuf),

    /// Another engine holds the directory lock
    #[error("Store at {} is already open", .0.display())]
    AlreadyOpen(PathBuf),

    /// Waiting for a key lock held by another transaction timed out
    #[error("Lock wait on table '{table}' timed out after {waited:?} (held by txn {holder})")]
    LockTimeout {
        table: String,
        holder: u64,
        waited: Duration,
    },

    /// Operation on a transaction that already committed or aborted
    #[error("Transaction {0} already finished")]
    TransactionFinished(u64),

    /// Cursor used after `close`
    #[error("Cursor on table '{0}' is closed")]
    CursorClosed(String),

    /// Configuration rejected by `Config::validate`
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Convert std::io::Error to StoreError::Io
impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io {
            path: None,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl StoreError {
    /// Wrap an I/O error with the path it happened on.
    pub(crate) fn io_at(path: impl Into<PathBuf>, err: std::io::Error, what: &str) -> Self {
        StoreError::Io {
            path: Some(path.into()),
            kind: err.kind(),
            message: format!("{}: {}", what, err),
        }
    }

    /// True for failures a caller may resolve by retrying the transaction.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::LockTimeout { .. })
    }
}

/// Result type alias for SimpleStore engine operations
pub type StoreResult<T> = Result<T, StoreError>;
