use std::path::{Path, PathBuf};

use tracing::debug;

use crate::{CommandLog, FsError, FsGateway, InstallLayout, JournalOp};

/// Moves destinations aside before they are overwritten or removed.
///
/// A backup exists for a destination exactly when that destination existed
/// before the current attempt touched it. Each transaction owns its own
/// subtree of the backup directory.
#[derive(Debug, Clone)]
pub struct BackupManager {
    fs: FsGateway,
    layout: InstallLayout,
    txid: String,
}

impl BackupManager {
    pub fn new(fs: FsGateway, layout: InstallLayout, txid: &str) -> Self {
        Self {
            fs,
            layout,
            txid: txid.to_string(),
        }
    }

    pub fn backup_path(&self, destination: &Path) -> PathBuf {
        self.layout.backup_path(&self.txid, destination)
    }

    /// True while any backup of this transaction is still on disk.
    pub fn has_any(&self) -> bool {
        self.fs.exists(&self.layout.transaction_backup_dir(&self.txid))
    }

    pub fn has_backup(&self, destination: &Path) -> bool {
        self.fs.exists(&self.backup_path(destination))
    }

    /// Moves every existing destination into the backup tree and returns the
    /// ones moved by this call. Missing destinations and destinations that are
    /// already quarantined are skipped.
    pub fn quarantine(
        &self,
        destinations: &[PathBuf],
        mut journal: Option<&mut CommandLog>,
    ) -> Result<Vec<PathBuf>, FsError> {
        let mut moved = Vec::new();
        for destination in destinations {
            let target = self.fs.resolve(destination)?;
            if self.has_backup(destination) {
                debug!(path = %destination.display(), "already quarantined");
                continue;
            }
            if !self.fs.exists(&target) {
                continue;
            }

            if let Some(log) = journal.as_deref_mut() {
                log.append(JournalOp::Quarantine, destination)?;
            }
            self.fs.move_path(&target, &self.backup_path(destination))?;
            debug!(path = %destination.display(), "quarantined");
            moved.push(destination.clone());
        }
        Ok(moved)
    }

    /// Moves backups back over their destinations. A destination without a
    /// backup is left untouched.
    pub fn restore(&self, destinations: &[PathBuf]) -> Result<Vec<PathBuf>, FsError> {
        let mut restored = Vec::new();
        for destination in destinations {
            let backup = self.backup_path(destination);
            if !self.fs.exists(&backup) {
                continue;
            }

            let target = self.fs.resolve(destination)?;
            if self.fs.exists(&target) && !self.fs.remove_recursive(&target) {
                return Err(FsError::MoveFailed {
                    from: backup,
                    to: target,
                    source: std::io::Error::new(
                        std::io::ErrorKind::Other,
                        "existing destination could not be removed",
                    ),
                });
            }
            self.fs.move_path(&backup, &target)?;
            self.prune_backup_parents(&backup);
            debug!(path = %destination.display(), "restored from backup");
            restored.push(destination.clone());
        }
        Ok(restored)
    }

    pub fn diff_missing_backups(&self, destinations: &[PathBuf]) -> Vec<PathBuf> {
        destinations
            .iter()
            .filter(|destination| !self.has_backup(destination))
            .cloned()
            .collect()
    }

    /// Permanently deletes the backups of `destinations`.
    pub fn discard(&self, destinations: &[PathBuf]) -> Result<usize, FsError> {
        let mut discarded = 0;
        for destination in destinations {
            let backup = self.backup_path(destination);
            if !self.fs.exists(&backup) {
                continue;
            }
            if !self.fs.remove_recursive(&backup) {
                return Err(FsError::io(
                    "discard backup",
                    backup,
                    std::io::Error::new(std::io::ErrorKind::Other, "backup could not be removed"),
                ));
            }
            self.prune_backup_parents(&backup);
            discarded += 1;
        }
        Ok(discarded)
    }

    fn prune_backup_parents(&self, backup: &Path) {
        if let Some(parent) = backup.parent() {
            self.fs.prune_empty_dirs(parent, &self.layout.backup_dir());
        }
    }
}
