//! Write-Ahead Log implementation for SimpleStore
//!
//! The WAL is the only persistent structure: tables live in RAM and are
//! rebuilt by replaying committed batches on open.
//!
//! Write ordering on commit:
//! 1. Serialize the transaction's ops into one batch (CRC32C over payload)
//! 2. Append the batch to the current WAL file
//! 3. durable_sync() when the engine is configured to sync on commit
//! 4. Return success (the caller applies the ops to RAM AFTER this returns)

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};
use crate::format::{deserialize_batch, serialize_batch, WalBatch, WalOp, HEADER_SIZE, MAGIC_ARRAY};

const WAL_PREFIX: &str = "wal-";
const WAL_SUFFIX: &str = ".sstw";

/// Ensures data is durably written to persistent storage before returning.
///
/// Linux uses fdatasync(), Apple platforms need F_FULLFSYNC to get past the
/// drive's volatile cache, everything else falls back to sync_data().
fn durable_sync(file: &File) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::io::AsRawFd;
        // SAFETY: the fd comes from a live File reference.
        let result = unsafe { libc::fdatasync(file.as_raw_fd()) };
        if result == 0 { Ok(()) } else { Err(io::Error::last_os_error()) }
    }

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    {
        use std::os::unix::io::AsRawFd;
        // SAFETY: the fd comes from a live File reference.
        let result = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_FULLFSYNC) };
        if result == 0 { Ok(()) } else { Err(io::Error::last_os_error()) }
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "ios")))]
    {
        file.sync_data()
    }
}

fn wal_file_name(sequence: u64) -> String {
    format!("{}{:016x}{}", WAL_PREFIX, sequence, WAL_SUFFIX)
}

fn parse_sequence(name: &str) -> Option<u64> {
    let hex = name.strip_prefix(WAL_PREFIX)?.strip_suffix(WAL_SUFFIX)?;
    u64::from_str_radix(hex, 16).ok()
}

/// All WAL files in `wal_dir`, sorted by sequence number.
fn list_wal_files(wal_dir: &Path) -> StoreResult<Vec<(u64, PathBuf)>> {
    let dir_entries = std::fs::read_dir(wal_dir)
        .map_err(|e| StoreError::io_at(wal_dir, e, "Failed to read WAL directory"))?;

    let mut files = Vec::new();
    for entry in dir_entries {
        let entry = entry.map_err(|e| StoreError::io_at(wal_dir, e, "Failed to read directory entry"))?;
        let path = entry.path();
        if let Some(seq) = path.file_name().and_then(|n| n.to_str()).and_then(parse_sequence) {
            files.push((seq, path));
        }
    }
    files.sort_by_key(|(seq, _)| *seq);
    Ok(files)
}

fn open_append(path: &Path) -> StoreResult<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| StoreError::io_at(path, e, "Failed to open WAL file"))
}

/// WAL writer: appends one batch per committed transaction.
pub struct WalWriter {
    file: File,
    path: PathBuf,
    size: u64,
    wal_dir: PathBuf,
    sequence: u64,
    rotation_size: u64,
}

impl WalWriter {
    /// Open the WAL in `wal_dir`, resuming the highest-numbered file.
    pub fn new<P: AsRef<Path>>(wal_dir: P, rotation_size: u64) -> StoreResult<Self> {
        let wal_dir = wal_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&wal_dir)
            .map_err(|e| StoreError::io_at(&wal_dir, e, "Failed to create WAL directory"))?;

        let sequence = list_wal_files(&wal_dir)?.last().map_or(0, |(seq, _)| *seq);
        let path = wal_dir.join(wal_file_name(sequence));
        let file = open_append(&path)?;
        let size = file
            .metadata()
            .map_err(|e| StoreError::io_at(&path, e, "Failed to stat WAL file"))?
            .len();

        Ok(Self { file, path, size, wal_dir, sequence, rotation_size })
    }

    /// Append a batch. With `durable` the call returns only after the bytes
    /// reached persistent storage.
    pub fn append_batch(&mut self, ops: &[WalOp], durable: bool) -> StoreResult<()> {
        let bytes = serialize_batch(ops)?;

        if self.size > 0 && self.size + bytes.len() as u64 > self.rotation_size {
            self.rotate()?;
        }

        self.file
            .write_all(&bytes)
            .map_err(|e| StoreError::io_at(&self.path, e, "WAL write failed"))?;

        if durable {
            durable_sync(&self.file)
                .map_err(|e| StoreError::io_at(&self.path, e, "WAL durable_sync failed"))?;
        }

        self.size += bytes.len() as u64;
        Ok(())
    }

    /// Sync the current WAL file without writing anything.
    pub fn sync(&self) -> StoreResult<()> {
        durable_sync(&self.file).map_err(|e| StoreError::io_at(&self.path, e, "WAL sync failed"))
    }

    /// Replace the whole log with a single batch holding `live` ops.
    ///
    /// The snapshot is written and synced into a fresh file before older
    /// files are removed, so a crash in between replays to the same state.
    pub fn checkpoint(&mut self, live: &[WalOp]) -> StoreResult<()> {
        self.sync()?;
        let bytes = serialize_batch(live)?;

        let sequence = self.sequence + 1;
        let path = self.wal_dir.join(wal_file_name(sequence));
        let mut file = open_append(&path)?;
        file.write_all(&bytes)
            .map_err(|e| StoreError::io_at(&path, e, "Checkpoint write failed"))?;
        durable_sync(&file).map_err(|e| StoreError::io_at(&path, e, "Checkpoint sync failed"))?;

        for (seq, old) in list_wal_files(&self.wal_dir)? {
            if seq < sequence {
                std::fs::remove_file(&old)
                    .map_err(|e| StoreError::io_at(&old, e, "Failed to remove old WAL file"))?;
            }
        }

        debug!(ops = live.len(), path = %path.display(), "WAL checkpoint written");
        self.file = file;
        self.path = path;
        self.size = bytes.len() as u64;
        self.sequence = sequence;
        Ok(())
    }

    fn rotate(&mut self) -> StoreResult<()> {
        durable_sync(&self.file)
            .map_err(|e| StoreError::io_at(&self.path, e, "WAL sync before rotation failed"))?;

        self.sequence += 1;
        let new_path = self.wal_dir.join(wal_file_name(self.sequence));
        self.file = open_append(&new_path)?;
        self.path = new_path;
        self.size = 0;
        Ok(())
    }

    /// Current WAL file path (for diagnostics)
    pub fn current_path(&self) -> &Path {
        &self.path
    }

    /// Current WAL file size in bytes
    pub fn current_size(&self) -> u64 {
        self.size
    }
}

/// WAL reader: replays committed batches on open.
pub struct WalReader {
    wal_dir: PathBuf,
}

impl WalReader {
    pub fn new<P: AsRef<Path>>(wal_dir: P) -> Self {
        Self { wal_dir: wal_dir.as_ref().to_path_buf() }
    }

    /// Recover all intact batches from every WAL file in sequence order.
    ///
    /// A corrupt batch is skipped by scanning for the next magic; a torn
    /// batch at the end of a file is the crash point and ends that file.
    pub fn recover_batches(&self) -> StoreResult<Vec<WalBatch>> {
        if !self.wal_dir.exists() {
            return Ok(Vec::new());
        }
        let mut batches = Vec::new();
        for (_, path) in list_wal_files(&self.wal_dir)? {
            batches.extend(self.recover_from_file(&path)?);
        }
        Ok(batches)
    }

    fn recover_from_file(&self, path: &Path) -> StoreResult<Vec<WalBatch>> {
        let mut buffer = Vec::new();
        File::open(path)
            .and_then(|mut f| f.read_to_end(&mut buffer))
            .map_err(|e| StoreError::io_at(path, e, "Failed to read WAL file"))?;

        let mut batches = Vec::new();
        let mut offset = 0;

        while offset + HEADER_SIZE <= buffer.len() {
            if buffer[offset..offset + 4] != MAGIC_ARRAY {
                warn!(offset, path = %path.display(), "bad WAL magic, scanning for next batch");
                match find_next_magic(&buffer, offset + 1) {
                    Some(next) => { offset = next; continue; }
                    None => break,
                }
            }

            let length = u32::from_le_bytes([
                buffer[offset + 4], buffer[offset + 5],
                buffer[offset + 6], buffer[offset + 7],
            ]) as usize;
            let total = HEADER_SIZE + length;

            if offset + total > buffer.len() {
                warn!(offset, need = total, have = buffer.len() - offset, "torn WAL batch, stopping replay of file");
                break;
            }

            match deserialize_batch(&buffer[offset..offset + total]) {
                Ok(batch) => {
                    batches.push(batch);
                    offset += total;
                }
                Err(e) => {
                    warn!(offset, error = %e, "corrupt WAL batch skipped");
                    match find_next_magic(&buffer, offset + 1) {
                        Some(next) => { offset = next; continue; }
                        None => break,
                    }
                }
            }
        }

        Ok(batches)
    }
}

/// Scan forward for the next occurrence of the batch magic.
fn find_next_magic(buffer: &[u8], start: usize) -> Option<usize> {
    (start..buffer.len().saturating_sub(3)).find(|&i| buffer[i..i + 4] == MAGIC_ARRAY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const ROTATE: u64 = 64 * 1024 * 1024;

    #[test]
    fn test_wal_write_read_roundtrip() {
        let temp = TempDir::new().unwrap();

        let mut writer = WalWriter::new(temp.path(), ROTATE).unwrap();
        writer.append_batch(&[WalOp::put("t", b"key1", b"value1"), WalOp::put("t", b"key2", b"value2")], true).unwrap();
        writer.append_batch(&[WalOp::delete("t", b"key1")], false).unwrap();
        drop(writer);

        let batches = WalReader::new(temp.path()).recover_batches().unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].ops.len(), 2);
        assert_eq!(batches[0].ops[0].key, b"key1");
        assert_eq!(batches[1].ops[0], WalOp::delete("t", b"key1"));
    }

    #[test]
    fn test_corrupt_batch_is_skipped_whole() {
        let temp = TempDir::new().unwrap();

        let mut writer = WalWriter::new(temp.path(), ROTATE).unwrap();
        writer.append_batch(&[WalOp::put("t", b"good1", b"val1")], true).unwrap();
        let first_len = writer.current_size() as usize;
        writer.append_batch(&[WalOp::put("t", b"bad", b"val2"), WalOp::put("t", b"bad2", b"val2")], true).unwrap();
        writer.append_batch(&[WalOp::put("t", b"good3", b"val3")], true).unwrap();
        let wal_path = writer.current_path().to_path_buf();
        drop(writer);

        let mut data = std::fs::read(&wal_path).unwrap();
        data[first_len + HEADER_SIZE + 6] ^= 0xFF;
        std::fs::write(&wal_path, data).unwrap();

        let batches = WalReader::new(temp.path()).recover_batches().unwrap();
        let keys: Vec<&[u8]> = batches.iter().flat_map(|b| b.ops.iter().map(|o| o.key.as_slice())).collect();
        assert_eq!(keys, vec![b"good1".as_slice(), b"good3".as_slice()]);
    }

    #[test]
    fn test_torn_write_stops_cleanly() {
        let temp = TempDir::new().unwrap();

        let mut writer = WalWriter::new(temp.path(), ROTATE).unwrap();
        writer.append_batch(&[WalOp::put("t", b"complete", b"entry")], true).unwrap();
        let wal_path = writer.current_path().to_path_buf();
        drop(writer);

        let mut data = std::fs::read(&wal_path).unwrap();
        data.extend_from_slice(&MAGIC_ARRAY);
        data.extend_from_slice(&[0xFF, 0x00, 0x00, 0x00]);
        data.extend_from_slice(&[0u8; 8]);
        std::fs::write(&wal_path, data).unwrap();

        let batches = WalReader::new(temp.path()).recover_batches().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].ops[0].key, b"complete");
    }

    #[test]
    fn test_rotation_creates_new_file() {
        let temp = TempDir::new().unwrap();
        let mut writer = WalWriter::new(temp.path(), 64).unwrap();
        let first = writer.current_path().to_path_buf();
        writer.append_batch(&[WalOp::put("t", b"k1", &[7u8; 48])], false).unwrap();
        writer.append_batch(&[WalOp::put("t", b"k2", &[8u8; 48])], false).unwrap();
        assert_ne!(writer.current_path(), first.as_path());
        drop(writer);

        let batches = WalReader::new(temp.path()).recover_batches().unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[1].ops[0].key, b"k2");
    }

    #[test]
    fn test_checkpoint_replaces_older_files() {
        let temp = TempDir::new().unwrap();
        let mut writer = WalWriter::new(temp.path(), ROTATE).unwrap();
        for i in 0..10u8 {
            writer.append_batch(&[WalOp::put("t", &[i], b"v")], false).unwrap();
        }
        writer.checkpoint(&[WalOp::put("t", b"only", b"state")]).unwrap();
        writer.append_batch(&[WalOp::put("t", b"after", b"v")], true).unwrap();
        drop(writer);

        assert_eq!(list_wal_files(temp.path()).unwrap().len(), 1);
        let batches = WalReader::new(temp.path()).recover_batches().unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].ops[0].key, b"only");
        assert_eq!(batches[1].ops[0].key, b"after");
    }

    #[test]
    fn test_missing_directory_recovers_nothing() {
        let temp = TempDir::new().unwrap();
        let batches = WalReader::new(temp.path().join("absent")).recover_batches().unwrap();
        assert!(batches.is_empty());
    }

    #[test]
    fn test_wal_file_naming() {
        let temp = TempDir::new().unwrap();
        let writer = WalWriter::new(temp.path(), ROTATE).unwrap();
        let name = writer.current_path().file_name().unwrap().to_str().unwrap().to_string();
        assert!(name.starts_with(WAL_PREFIX));
        assert_eq!(parse_sequence(&name), Some(0));
    }
}
