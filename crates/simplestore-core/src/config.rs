//! Configuration management for SimpleStore
//!
//! Provides durability presets and the knobs the engine exposes to the
//! object layer (lock wait bound, cursor prefetch size, entry limits).

use std::time::Duration;

use crate::error::{StoreError, StoreResult};

/// SimpleStore engine configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// WAL file rotation threshold (bytes)
    pub wal_rotation_size_bytes: u64,
    /// fsync the WAL on every commit; otherwise only on checkpoint/close
    pub sync_on_commit: bool,
    /// Longest a transaction waits for a key lock held by another one
    pub lock_timeout: Duration,
    /// Records fetched per engine read when a cursor runs in bulk mode
    pub bulk_prefetch: usize,
    /// Maximum key size in bytes
    pub max_key_size: usize,
    /// Maximum value size in bytes
    pub max_value_size: usize,
    /// Rewrite the WAL as a single batch when the engine closes
    pub checkpoint_on_close: bool,
}

impl Config {
    /// Every commit reaches persistent storage before it returns.
    pub fn durable() -> Self {
        Self {
            wal_rotation_size_bytes: 64 * 1024 * 1024,
            sync_on_commit: true,
            lock_timeout: Duration::from_secs(10),
            bulk_prefetch: 64,
            max_key_size: 1024,
            max_value_size: 32 * 1024 * 1024,
            checkpoint_on_close: true,
        }
    }

    /// Commits land in the OS page cache; one fsync at checkpoint or close.
    pub fn relaxed() -> Self {
        Self {
            sync_on_commit: false,
            lock_timeout: Duration::from_secs(2),
            bulk_prefetch: 256,
            ..Self::durable()
        }
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> StoreResult<()> {
        if self.wal_rotation_size_bytes < 1024 * 1024 {
            return Err(StoreError::InvalidConfig("wal_rotation_size_bytes must be >= 1MB".into()));
        }
        if self.lock_timeout.is_zero() {
            return Err(StoreError::InvalidConfig("lock_timeout must be > 0".into()));
        }
        if self.bulk_prefetch == 0 {
            return Err(StoreError::InvalidConfig("bulk_prefetch must be > 0".into()));
        }
        if self.max_key_size == 0 || self.max_key_size > u16::MAX as usize {
            return Err(StoreError::InvalidConfig("max_key_size must be in [1, 65535]".into()));
        }
        if self.max_value_size == 0 || self.max_value_size > 128 * 1024 * 1024 {
            return Err(StoreError::InvalidConfig("max_value_size must be in [1, 128MB]".into()));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self { Self::durable() }
}
