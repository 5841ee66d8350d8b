use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::PathBuf;

use fs4::FileExt;

use crate::{FsError, InstallLayout};

/// Exclusive advisory lock held for the whole of one poll. The OS drops it
/// if the process dies.
#[derive(Debug)]
pub struct TransactionLock {
    _file: File,
    path: PathBuf,
}

impl TransactionLock {
    /// Returns `Ok(None)` when another poll of the same transaction holds the lock.
    pub fn try_acquire(layout: &InstallLayout, txid: &str) -> Result<Option<Self>, FsError> {
        let path = layout.lock_path(txid);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| FsError::CreateDirectoryFailed {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|source| FsError::io("open lock", &path, source))?;

        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(None),
            #[cfg(windows)]
            Err(err) if matches!(err.raw_os_error(), Some(32 | 33)) => return Ok(None),
            Err(err) => return Err(FsError::io("lock", path, err)),
        }

        file.set_len(0)
            .and_then(|()| writeln!(file, "{}", std::process::id()))
            .map_err(|source| FsError::io("write lock owner", &path, source))?;
        Ok(Some(Self { _file: file, path }))
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}
