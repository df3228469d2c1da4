//! Exclusive advisory lock on a data directory.

use crate::StoreError;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "rollcall.lock";

/// Held for as long as a process writes to a data directory.
///
/// Uses `flock(2)`, so the lock belongs to the open file description and
/// is released when this value is dropped or the process exits.
#[derive(Debug)]
pub struct StoreLock {
    _file: File,
    path: PathBuf,
}

impl StoreLock {
    /// Take the lock without blocking. Fails with [`StoreError::Locked`]
    /// if another holder exists.
    pub fn acquire(data_dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(data_dir).map_err(|e| StoreError::io(data_dir, e))?;
        let path = data_dir.join(LOCK_FILE);
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| StoreError::io(&path, e))?;

        // SAFETY: the fd is valid for the lifetime of `file`.
        let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            return Err(if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
                StoreError::Locked(data_dir.to_path_buf())
            } else {
                StoreError::io(&path, err)
            });
        }

        // Record the holder's pid for diagnostics.
        file.set_len(0)
            .and_then(|_| writeln!(file, "{}", std::process::id()))
            .map_err(|e| StoreError::io(&path, e))?;

        tracing::debug!(path = %path.display(), "store lock acquired");
        Ok(Self { _file: file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
