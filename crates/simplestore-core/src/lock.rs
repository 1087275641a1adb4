//! Per-key exclusive locks held by transactions until commit or abort.
//!
//! A key is locked by the first transaction that reads or writes it; other
//! transactions block on it until it is released or `lock_timeout` passes.
//! Deadlocks surface as lock timeouts.

use std::time::{Duration, Instant};

use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex};

use crate::error::{StoreError, StoreResult};

type LockKey = (String, Vec<u8>);

/// Lock table shared by every transaction of one engine.
#[derive(Default)]
pub struct LockManager {
    held: Mutex<HashMap<LockKey, u64>>,
    released: Condvar,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock on `(table, key)` for `txn_id`.
    ///
    /// Returns `true` when the lock was newly taken, `false` when `txn_id`
    /// already held it.
    pub fn acquire(&self, txn_id: u64, table: &str, key: &[u8], timeout: Duration) -> StoreResult<bool> {
        let lock_key: LockKey = (table.to_string(), key.to_vec());
        let deadline = Instant::now() + timeout;
        let mut held = self.held.lock();

        loop {
            let owner = held.get(&lock_key).copied();
            match owner {
                None => {
                    held.insert(lock_key, txn_id);
                    return Ok(true);
                }
                Some(owner) if owner == txn_id => return Ok(false),
                Some(owner) => {
                    if self.released.wait_until(&mut held, deadline).timed_out()
                        && held.get(&lock_key).map_or(false, |&o| o != txn_id)
                    {
                        return Err(StoreError::LockTimeout {
                            table: table.to_string(),
                            holder: owner,
                            waited: timeout,
                        });
                    }
                }
            }
        }
    }

    /// Release every lock in `keys` owned by `txn_id` and wake waiters.
    pub fn release_all(&self, txn_id: u64, keys: &[LockKey]) {
        if keys.is_empty() {
            return;
        }
        let mut held = self.held.lock();
        for key in keys {
            if held.get(key) == Some(&txn_id) {
                held.remove(key);
            }
        }
        drop(held);
        self.released.notify_all();
    }

    /// Number of keys currently locked.
    pub fn held_count(&self) -> usize {
        self.held.lock().len()
    }
}
