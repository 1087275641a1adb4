//! Exclusive ownership of a store directory.
//!
//! The engine holds an advisory `flock` on `<dir>/LOCK` for as long as it is
//! open, so a second engine on the same directory fails instead of sharing
//! the WAL. The lock belongs to the open file, so it is released when the
//! file is closed, including when the process dies.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use crate::error::{StoreError, StoreResult};

pub(crate) const LOCK_FILE: &str = "LOCK";

#[derive(Debug)]
pub(crate) struct DirLock {
    _file: File,
    path: PathBuf,
}

impl DirLock {
    /// Take the lock on `dir`, failing with `AlreadyOpen` when it is held.
    pub(crate) fn acquire(dir: &Path) -> StoreResult<Self> {
        let path = dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| StoreError::io_at(&path, e, "Failed to open lock file"))?;

        match try_lock_exclusive(&file) {
            Ok(()) => Ok(Self { _file: file, path }),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(StoreError::AlreadyOpen(dir.to_path_buf())),
            Err(e) => Err(StoreError::io_at(&path, e, "Failed to lock store directory")),
        }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(unix)]
fn try_lock_exclusive(file: &File) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;
    // SAFETY: the fd comes from a live File reference.
    let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if result == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        Err(io::Error::new(io::ErrorKind::WouldBlock, err))
    } else {
        Err(err)
    }
}

#[cfg(not(unix))]
fn try_lock_exclusive(_file: &File) -> io::Result<()> {
    Ok(())
}
