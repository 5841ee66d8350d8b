use std::path::{Path, PathBuf};

use shoppack_core::{Operation, ProgressRecord};
use tracing::{debug, warn};

use crate::{
    BackupManager, CommandLog, FsError, FsGateway, InstallError, InstallLayout, JournalOp,
    ProgressStore, StageError, StoreError, TransactionLock,
};

/// What the progress store holds for a transaction.
#[derive(Debug)]
pub(crate) enum LoadedRecord {
    Missing,
    Present(ProgressRecord),
    Corrupt(String),
}

pub(crate) fn load_record<P: ProgressStore>(
    store: &P,
    txid: &str,
) -> Result<LoadedRecord, InstallError> {
    match store.get(txid) {
        Ok(Some(record)) => Ok(LoadedRecord::Present(record)),
        Ok(None) => Ok(LoadedRecord::Missing),
        Err(StoreError::Decode { source, .. }) => Ok(LoadedRecord::Corrupt(format!(
            "progress record cannot be decoded: {source}"
        ))),
        Err(source) => Err(InstallError::StoreUnavailable {
            txid: txid.to_string(),
            source,
        }),
    }
}

pub(crate) fn store_unavailable(txid: &str) -> impl FnOnce(StoreError) -> InstallError + '_ {
    move |source| InstallError::StoreUnavailable {
        txid: txid.to_string(),
        source,
    }
}

/// The installer-owned files behind one transaction: lock, command log,
/// staging tree and backups.
#[derive(Debug, Clone)]
pub struct TransactionScope {
    layout: InstallLayout,
    fs: FsGateway,
}

impl TransactionScope {
    pub fn new(layout: InstallLayout) -> Self {
        let fs = FsGateway::new(layout.root());
        Self { layout, fs }
    }

    pub fn layout(&self) -> &InstallLayout {
        &self.layout
    }

    pub fn fs(&self) -> &FsGateway {
        &self.fs
    }

    pub fn backups(&self, txid: &str) -> BackupManager {
        BackupManager::new(self.fs.clone(), self.layout.clone(), txid)
    }

    pub fn staging_path(&self, txid: &str) -> PathBuf {
        self.layout.transaction_staging_path(txid)
    }

    pub(crate) fn lock(&self, txid: &str) -> Result<TransactionLock, InstallError> {
        match TransactionLock::try_acquire(&self.layout, txid) {
            Ok(Some(lock)) => Ok(lock),
            Ok(None) => Err(InstallError::Busy {
                txid: txid.to_string(),
            }),
            Err(source) => Err(InstallError::Lock {
                txid: txid.to_string(),
                source,
            }),
        }
    }

    pub fn journal(&self, txid: &str) -> Result<CommandLog, FsError> {
        CommandLog::open(self.layout.journal_path(txid))
    }

    pub fn has_artifacts(&self, txid: &str) -> bool {
        self.fs.exists(&self.layout.journal_path(txid))
            || self.fs.exists(&self.staging_path(txid))
            || self.backups(txid).has_any()
    }

    /// Creates the missing parents of `destination`, logging each one before
    /// it is created.
    pub(crate) fn create_parents(
        &self,
        journal: &mut CommandLog,
        destination: &Path,
    ) -> Result<(), FsError> {
        let Some(parent) = destination.parent().filter(|p| !p.as_os_str().is_empty()) else {
            return Ok(());
        };
        for dir in self.fs.missing_directories(parent)? {
            if let Some(relative) = self.fs.relative(&dir) {
                journal.append(JournalOp::CreateDir, &relative)?;
            }
        }
        self.fs.create_directory(parent)?;
        Ok(())
    }

    /// Best-effort compensation. Every failure is logged and skipped so the
    /// caller's original error stays the one reported.
    pub(crate) fn rollback(&self, txid: &str, destinations: &[PathBuf]) {
        debug!(txid, files = destinations.len(), "rolling back");
        let backups = self.backups(txid);
        let installed = match self.journal(txid) {
            Ok(journal) => {
                for err in journal.replay_inverse(&self.fs, &backups) {
                    warn!(txid, error = %err, "journal replay step failed");
                }
                journal.installed_paths()
            }
            Err(err) => {
                warn!(txid, error = %err, "command log unreadable; restoring backups only");
                Vec::new()
            }
        };

        if let Err(err) = backups.restore(destinations) {
            warn!(txid, error = %err, "failed to restore backups");
        }

        for path in backups.diff_missing_backups(destinations) {
            if !installed.contains(&path) {
                continue;
            }
            match self.fs.remove_file_if_exists(&path) {
                Ok(true) => debug!(txid, path = %path.display(), "removed file created by this attempt"),
                Ok(false) => {}
                Err(err) => warn!(txid, path = %path.display(), error = %err, "failed to remove new file"),
            }
        }

        self.cleanup(txid);
    }

    /// Removes the staging tree and the command log.
    pub(crate) fn cleanup(&self, txid: &str) {
        let staging = self.staging_path(txid);
        if self.fs.exists(&staging) && !self.fs.remove_recursive(&staging) {
            warn!(txid, path = %staging.display(), "failed to remove staging tree");
        }
        let journal = self.layout.journal_path(txid);
        match self.fs.remove_file_if_exists(&journal) {
            Ok(_) => {}
            Err(err) => warn!(txid, error = %err, "failed to delete command log"),
        }
    }

    /// Deletes the lock file of a transaction that has ended. Callers still
    /// hold the lock, so no other poll can be mid-stage.
    pub(crate) fn release_lock(&self, txid: &str) {
        let path = self.layout.lock_path(txid);
        if let Err(err) = self.fs.remove_file_if_exists(&path) {
            debug!(txid, error = %err, "lock file kept");
        }
    }

    /// Clears what a previous, already-abandoned attempt left behind before a
    /// new attempt starts.
    pub(crate) fn recover_stale(&self, txid: &str, destinations: &[PathBuf]) {
        if self.has_artifacts(txid) {
            warn!(txid, "leftovers from an earlier attempt found; rolling them back");
            self.rollback(txid, destinations);
        }
    }
}

pub(crate) fn delete_record<P: ProgressStore>(store: &P, txid: &str) {
    if let Err(err) = store.delete(txid) {
        warn!(txid, error = %err, "failed to delete progress record");
    }
}

pub(crate) fn check_operation(
    txid: &str,
    record: &ProgressRecord,
    requested: Operation,
) -> Result<(), InstallError> {
    if record.operation == requested {
        return Ok(());
    }
    Err(InstallError::OperationConflict {
        txid: txid.to_string(),
        active: record.operation,
        requested,
    })
}

pub(crate) fn failed(txid: &str, operation: Operation, source: StageError) -> InstallError {
    InstallError::InstallationFailed {
        txid: txid.to_string(),
        operation,
        source,
    }
}
