//! Core storage engine of SimpleStore.
//!
//! StoreEngine keeps every named table as an ordered map in RAM and makes
//! committed transactions durable through the WAL.
//!
//! **Read path**: RAM (RwLock read), merged with the caller's uncommitted
//! writes when a transaction is supplied
//! **Write path**: buffered in the transaction; on commit, WAL first, then RAM
//! **Isolation**: per-key exclusive locks held from first access to commit/abort

use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{StoreError, StoreResult};
use crate::format::{Operation, WalOp};
use crate::lock::LockManager;
use crate::lockfile::DirLock;
use crate::table::{KeyGroup, MergedRange, Records, TableHandle, TableOptions};
use crate::transaction::{Transaction, TxnState};
use crate::wal::{WalReader, WalWriter};

/// A buffered mutation, before it is turned into a WAL op.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Write<'a> {
    Put(&'a [u8]),
    Delete,
}

/// Embedded transactional engine: named ordered tables + WAL.
///
/// All public methods take `&self`; transactions and autocommit writes
/// serialize per key through the lock manager.
pub struct StoreEngine {
    /// Committed records, by table name
    tables: RwLock<HashMap<String, Records>>,
    /// Open table handles, by table name
    catalog: Mutex<HashMap<String, TableHandle>>,
    /// Write-ahead log, single writer
    wal: Mutex<WalWriter>,
    locks: LockManager,
    /// Exclusive hold on the data directory, released by `close`
    dir_lock: Mutex<Option<DirLock>>,
    next_txn_id: AtomicU64,
    closed: AtomicBool,
    path: PathBuf,
    config: Config,
}

fn apply_op(tables: &mut HashMap<String, Records>, op: &WalOp) {
    let records = tables.entry_ref(op.table.as_str()).or_default();
    match op.operation {
        Operation::Put => {
            records.insert(op.key.clone(), vec![op.value.clone()]);
        }
        Operation::PutDup => {
            records.entry(op.key.clone()).or_default().push(op.value.clone());
        }
        Operation::Delete => {
            records.remove(&op.key);
        }
    }
}

impl StoreEngine {
    /// Open or create a store at the given directory.
    ///
    /// Replays the WAL to rebuild every table that had committed data.
    /// Fails with `AlreadyOpen` while another engine has the directory.
    pub fn open<P: AsRef<Path>>(path: P, config: Config) -> StoreResult<Self> {
        config.validate()?;
        let path = path.as_ref().to_path_buf();
        let wal_dir = path.join("wal");

        std::fs::create_dir_all(&path)
            .map_err(|e| StoreError::io_at(&path, e, "Failed to create store directory"))?;
        let dir_lock = DirLock::acquire(&path)?;
        debug!(lock = %dir_lock.path().display(), "store directory locked");

        std::fs::create_dir_all(&wal_dir)
            .map_err(|e| StoreError::io_at(&wal_dir, e, "Failed to create WAL directory"))?;

        let mut tables: HashMap<String, Records> = HashMap::new();
        let batches = WalReader::new(&wal_dir).recover_batches()?;
        for batch in &batches {
            for op in &batch.ops {
                apply_op(&mut tables, op);
            }
        }

        let recovered: usize = tables.values().map(|t| t.len()).sum();
        if !batches.is_empty() {
            info!(
                batches = batches.len(),
                keys = recovered,
                tables = tables.len(),
                path = %wal_dir.display(),
                "recovered store from WAL"
            );
        }

        let wal = WalWriter::new(&wal_dir, config.wal_rotation_size_bytes)?;

        Ok(Self {
            tables: RwLock::new(tables),
            catalog: Mutex::new(HashMap::new()),
            wal: Mutex::new(wal),
            locks: LockManager::new(),
            dir_lock: Mutex::new(Some(dir_lock)),
            next_txn_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            path,
            config,
        })
    }

    /// Open (creating if absent) a named table.
    ///
    /// Opening a name that is already open returns the existing handle; its
    /// options were fixed by the first open.
    pub fn open_table(&self, name: &str, options: TableOptions) -> StoreResult<TableHandle> {
        self.ensure_open()?;
        if name.is_empty() || name.len() > crate::format::MAX_TABLE_NAME {
            return Err(StoreError::OversizedEntry {
                entry_size: name.len() as u64,
                max_size: crate::format::MAX_TABLE_NAME as u64,
                component: "table name".to_string(),
            });
        }

        let mut catalog = self.catalog.lock();
        if let Some(existing) = catalog.get(name) {
            if !existing.is_closed() {
                if existing.options() != &options {
                    warn!(table = name, "table already open with different options; keeping the first");
                }
                return Ok(existing.clone());
            }
        }

        let handle = TableHandle::new(name, options);
        self.tables.write().entry_ref(name).or_default();
        catalog.insert(name.to_string(), handle.clone());
        debug!(table = name, "table opened");
        Ok(handle)
    }

    /// Close a table handle. Later use of any clone fails with `TableClosed`.
    /// Committed data stays and is visible again after reopening.
    pub fn close_table(&self, table: &TableHandle) -> StoreResult<()> {
        if table.is_closed() {
            return Ok(());
        }
        table.mark_closed();
        let mut catalog = self.catalog.lock();
        if catalog.get(table.name()).map_or(false, |h| h.same_table(table)) {
            catalog.remove(table.name());
        }
        debug!(table = table.name(), "table closed");
        Ok(())
    }

    /// Handles of every table currently open.
    pub fn open_tables(&self) -> Vec<TableHandle> {
        self.catalog.lock().values().cloned().collect()
    }

    /// Begin a transaction.
    pub fn begin(self: &Arc<Self>) -> StoreResult<Transaction> {
        self.ensure_open()?;
        let id = self.next_txn_id.fetch_add(1, Ordering::Relaxed);
        debug!(txn = id, "transaction begin");
        Ok(Transaction::new(Arc::clone(self), id))
    }

    /// First record under `key`, inside `txn` when given.
    pub fn get(&self, table: &TableHandle, key: &[u8], txn: Option<&Transaction>) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.get_dups(table, key, txn)?.into_iter().next())
    }

    /// Every record under `key` (one for non-duplicate tables).
    pub fn get_dups(&self, table: &TableHandle, key: &[u8], txn: Option<&Transaction>) -> StoreResult<Vec<Vec<u8>>> {
        self.ensure_open()?;
        table.ensure_open()?;
        match txn {
            Some(txn) => {
                self.lock_key(txn.id(), txn.state(), table, key)?;
                Ok(self.view_key(table.name(), Some(txn.state()), key).unwrap_or_default())
            }
            None => Ok(self.view_key(table.name(), None, key).unwrap_or_default()),
        }
    }

    /// Whether `key` has at least one record.
    pub fn contains_key(&self, table: &TableHandle, key: &[u8], txn: Option<&Transaction>) -> StoreResult<bool> {
        Ok(!self.get_dups(table, key, txn)?.is_empty())
    }

    /// Store `value` under `key`. Duplicate tables append; others overwrite.
    /// Without `txn` the write commits on its own.
    pub fn put(&self, table: &TableHandle, key: &[u8], value: &[u8], txn: Option<&Transaction>) -> StoreResult<()> {
        match txn {
            Some(txn) => self.write(txn.id(), txn.state(), table, key, Write::Put(value)).map(|_| ()),
            None => self.autocommit(table, key, Write::Put(value)).map(|_| ()),
        }
    }

    /// Remove `key` and all of its records. Returns whether it existed.
    pub fn delete(&self, table: &TableHandle, key: &[u8], txn: Option<&Transaction>) -> StoreResult<bool> {
        match txn {
            Some(txn) => self.write(txn.id(), txn.state(), table, key, Write::Delete),
            None => self.autocommit(table, key, Write::Delete),
        }
    }

    /// Every key of the table in key order.
    pub fn keys(&self, table: &TableHandle, txn: Option<&Transaction>) -> StoreResult<Vec<Vec<u8>>> {
        self.ensure_open()?;
        table.ensure_open()?;
        let groups = self.view_groups(table.name(), txn.map(|t| t.state()), Bound::Unbounded, Bound::Unbounded, false, usize::MAX);
        Ok(groups.into_iter().map(|(k, _)| k).collect())
    }

    /// Number of committed keys in the table.
    pub fn len(&self, table: &TableHandle) -> usize {
        self.tables.read().get(table.name()).map_or(0, |t| t.len())
    }

    /// Returns true if the table has no committed keys.
    pub fn is_empty(&self, table: &TableHandle) -> bool {
        self.len(table) == 0
    }

    /// Rewrite the WAL as one batch holding the committed state.
    pub fn checkpoint(&self) -> StoreResult<()> {
        self.ensure_open()?;
        let mut wal = self.wal.lock();
        let tables = self.tables.read();

        let mut names: Vec<&String> = tables.keys().collect();
        names.sort();
        let mut live = Vec::new();
        for name in names {
            for (key, records) in &tables[name] {
                for (i, record) in records.iter().enumerate() {
                    live.push(if i == 0 {
                        WalOp::put(name, key, record)
                    } else {
                        WalOp::put_dup(name, key, record)
                    });
                }
            }
        }
        wal.checkpoint(&live)
    }

    /// Close every open table, sync (or checkpoint) the WAL, release the
    /// directory and refuse further work. Idempotent.
    pub fn close(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        let result = if self.config.checkpoint_on_close {
            self.checkpoint()
        } else {
            self.wal.lock().sync()
        };
        for handle in self.catalog.lock().drain().map(|(_, h)| h) {
            handle.mark_closed();
        }
        self.closed.store(true, Ordering::Release);
        self.dir_lock.lock().take();
        info!(path = %self.path.display(), "store closed");
        result
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Data directory path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Keys currently locked by live transactions.
    pub fn locked_keys(&self) -> usize {
        self.locks.held_count()
    }

    fn ensure_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(StoreError::EngineClosed(self.path.clone()))
        } else {
            Ok(())
        }
    }

    fn lock_key(&self, txn_id: u64, state: &Mutex<TxnState>, table: &TableHandle, key: &[u8]) -> StoreResult<()> {
        if state.lock().finished {
            return Err(StoreError::TransactionFinished(txn_id));
        }
        if self.locks.acquire(txn_id, table.name(), key, self.config.lock_timeout)? {
            state.lock().locks.push((table.name().to_string(), key.to_vec()));
        }
        Ok(())
    }

    fn autocommit(&self, table: &TableHandle, key: &[u8], write: Write<'_>) -> StoreResult<bool> {
        let id = self.next_txn_id.fetch_add(1, Ordering::Relaxed);
        let state = Mutex::new(TxnState::default());
        match self.write(id, &state, table, key, write) {
            Ok(existed) => self.finish(id, &state, true).map(|_| existed),
            Err(e) => {
                let _ = self.finish(id, &state, false);
                Err(e)
            }
        }
    }

    /// Buffer a write in the transaction state. For deletes, returns whether
    /// the key existed in the transaction's view.
    pub(crate) fn write(
        &self,
        txn_id: u64,
        state: &Mutex<TxnState>,
        table: &TableHandle,
        key: &[u8],
        write: Write<'_>,
    ) -> StoreResult<bool> {
        self.ensure_open()?;
        table.ensure_open()?;
        if key.len() > self.config.max_key_size {
            return Err(StoreError::OversizedEntry {
                entry_size: key.len() as u64,
                max_size: self.config.max_key_size as u64,
                component: "key".to_string(),
            });
        }
        let record = match write {
            Write::Put(value) => {
                if value.len() > self.config.max_value_size {
                    return Err(StoreError::OversizedEntry {
                        entry_size: value.len() as u64,
                        max_size: self.config.max_value_size as u64,
                        component: "value".to_string(),
                    });
                }
                Some(table.options().shape_record(table.name(), value)?)
            }
            Write::Delete => None,
        };

        self.lock_key(txn_id, state, table, key)?;

        // Lock order: tables before transaction state
        let tables = self.tables.read();
        let mut state = state.lock();
        if state.finished {
            return Err(StoreError::TransactionFinished(txn_id));
        }
        let name = table.name();
        let current = match state.overlay.get(name).and_then(|o| o.get(key)) {
            Some(pending) => pending.clone().unwrap_or_default(),
            None => tables.get(name).and_then(|t| t.get(key)).cloned().unwrap_or_default(),
        };
        drop(tables);

        let existed = !current.is_empty();
        let (next, op) = match record {
            Some(record) if table.options().duplicates => {
                let mut next = current;
                next.push(record.clone());
                (Some(next), WalOp::put_dup(name, key, &record))
            }
            Some(record) => {
                let op = WalOp::put(name, key, &record);
                (Some(vec![record]), op)
            }
            None if existed => (None, WalOp::delete(name, key)),
            None => return Ok(false),
        };

        state.overlay.entry_ref(name).or_default().insert(key.to_vec(), next);
        state.log.push(op);
        state.write_seq += 1;
        Ok(existed)
    }

    /// Commit or abort: WAL first, then RAM, then release locks.
    pub(crate) fn finish(&self, txn_id: u64, state: &Mutex<TxnState>, commit: bool) -> StoreResult<()> {
        let (log, locks) = {
            let mut state = state.lock();
            if state.finished {
                return Err(StoreError::TransactionFinished(txn_id));
            }
            state.finished = true;
            state.overlay.clear();
            (std::mem::take(&mut state.log), std::mem::take(&mut state.locks))
        };

        let result = if commit && !log.is_empty() {
            self.ensure_open().and_then(|_| {
                let mut wal = self.wal.lock();
                wal.append_batch(&log, self.config.sync_on_commit)?;
                let mut tables = self.tables.write();
                for op in &log {
                    apply_op(&mut tables, op);
                }
                Ok(())
            })
        } else {
            Ok(())
        };

        self.locks.release_all(txn_id, &locks);
        debug!(txn = txn_id, commit, ops = log.len(), ok = result.is_ok(), "transaction finished");
        result
    }

    /// Records under `key` in the view of `state` (committed data when None).
    pub(crate) fn view_key(&self, table: &str, state: Option<&Mutex<TxnState>>, key: &[u8]) -> Option<Vec<Vec<u8>>> {
        let tables = self.tables.read();
        if let Some(state) = state {
            let state = state.lock();
            if let Some(pending) = state.overlay.get(table).and_then(|o| o.get(key)) {
                return pending.clone().filter(|r| !r.is_empty());
            }
        }
        tables.get(table).and_then(|t| t.get(key)).filter(|r| !r.is_empty()).cloned()
    }

    /// Up to `limit` key groups within bounds, in key (or reverse key) order.
    pub(crate) fn view_groups(
        &self,
        table: &str,
        state: Option<&Mutex<TxnState>>,
        lower: Bound<&[u8]>,
        upper: Bound<&[u8]>,
        reverse: bool,
        limit: usize,
    ) -> Vec<KeyGroup> {
        let tables = self.tables.read();
        let guard = state.map(|s| s.lock());
        let overlay = guard.as_ref().and_then(|s| s.overlay.get(table));
        MergedRange::new(tables.get(table), overlay, lower, upper, reverse)
            .take(limit)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

impl std::fmt::Debug for StoreEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreEngine")
            .field("path", &self.path)
            .field("tables", &self.tables.read().len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for StoreEngine {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            if let Err(e) = self.wal.lock().sync() {
                warn!(error = %e, "WAL sync on drop failed");
            }
        }
    }
}
