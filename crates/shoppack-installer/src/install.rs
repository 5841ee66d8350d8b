use std::path::{Path, PathBuf};

use shoppack_core::{InstallStage, Operation, PackageManifest, PollResponse, ProgressRecord};
use tracing::{debug, error, info, warn};

use crate::transaction::{
    check_operation, delete_record, failed, load_record, store_unavailable, LoadedRecord,
};
use crate::{
    DownloadManager, FsError, InstallError, InstallLayout, InstallerConfig, JournalOp,
    MigrationExecutor, MigrationRunner, PackageSource, ProgressStore, StageError,
    TransactionScope,
};

/// Drives one package installation, one checkpoint per poll.
pub struct Installer<P, S, E> {
    scope: TransactionScope,
    config: InstallerConfig,
    store: P,
    downloads: DownloadManager<S>,
    executor: E,
    update_marker: PathBuf,
}

impl<P, S, E> Installer<P, S, E>
where
    P: ProgressStore,
    S: PackageSource,
    E: MigrationExecutor,
{
    pub fn new(
        config: &InstallerConfig,
        layout: InstallLayout,
        store: P,
        source: S,
        executor: E,
    ) -> Self {
        let scope = TransactionScope::new(layout);
        let downloads =
            DownloadManager::new(source, scope.fs().clone(), config.archive_extraction);
        let update_marker = shoppack_core::validate_relative_path(
            &config.update_marker.to_string_lossy(),
        )
        .unwrap_or_else(|_| config.update_marker.clone());
        Self {
            scope,
            config: config.clone(),
            store,
            downloads,
            executor,
            update_marker,
        }
    }

    pub fn scope(&self) -> &TransactionScope {
        &self.scope
    }

    pub fn store(&self) -> &P {
        &self.store
    }

    /// Advances the transaction named by `manifest` by exactly one checkpoint.
    pub fn poll(
        &self,
        manifest: &PackageManifest,
        access_token: Option<&str>,
    ) -> Result<PollResponse, InstallError> {
        let txid = manifest.txid();
        manifest
            .validate()
            .map_err(|err| failed(txid, Operation::Install, err.into()))?;
        let _lock = self.scope.lock(txid)?;

        let record = match load_record(&self.store, txid)? {
            LoadedRecord::Missing => return self.start(manifest),
            LoadedRecord::Corrupt(detail) => return Err(self.fail_corrupted(manifest, detail)),
            LoadedRecord::Present(record) => record,
        };
        check_operation(txid, &record, Operation::Install)?;

        let Some(stage) = record.install_stage() else {
            let detail = format!("unknown checkpoint {}", record.progress);
            return Err(self.fail_corrupted(manifest, detail));
        };
        let Some(next) = stage.next() else {
            debug!(txid, "final cleanup was interrupted; finishing it");
            return self.finish(manifest, &record);
        };

        let advanced = match self.advance(manifest, &record, next, access_token) {
            Ok(advanced) => advanced,
            Err(err) => {
                error!(txid, stage = next.label(), error = %err, "installation stage failed");
                self.scope.rollback(txid, &manifest.destinations());
                delete_record(&self.store, txid);
                self.scope.release_lock(txid);
                return Err(failed(txid, Operation::Install, err));
            }
        };

        self.store
            .set(txid, &advanced)
            .map_err(store_unavailable(txid))?;
        info!(txid, stage = next.label(), progress = next.percent(), "installation advanced");

        if advanced.is_complete() {
            return self.finish(manifest, &advanced);
        }
        Ok(advanced.response())
    }

    /// Read-only view of the stored record.
    pub fn status(&self, txid: &str) -> Result<Option<ProgressRecord>, InstallError> {
        match load_record(&self.store, txid)? {
            LoadedRecord::Missing => Ok(None),
            LoadedRecord::Present(record) => Ok(Some(record)),
            LoadedRecord::Corrupt(detail) => Err(failed(
                txid,
                Operation::Install,
                StageError::CorruptedProgressState { detail },
            )),
        }
    }

    /// Rolls back an in-flight installation and forgets it. Returns false when
    /// nothing was in flight.
    pub fn abandon(&self, manifest: &PackageManifest) -> Result<bool, InstallError> {
        let txid = manifest.txid();
        let _lock = self.scope.lock(txid)?;

        let in_flight = match load_record(&self.store, txid)? {
            LoadedRecord::Present(record) => {
                check_operation(txid, &record, Operation::Install)?;
                true
            }
            LoadedRecord::Corrupt(_) => true,
            LoadedRecord::Missing => self.scope.has_artifacts(txid),
        };
        if !in_flight {
            self.scope.release_lock(txid);
            return Ok(false);
        }

        warn!(txid, "abandoning installation");
        self.scope.rollback(txid, &manifest.destinations());
        self.store.delete(txid).map_err(store_unavailable(txid))?;
        self.scope.release_lock(txid);
        Ok(true)
    }

    fn start(&self, manifest: &PackageManifest) -> Result<PollResponse, InstallError> {
        let txid = manifest.txid();
        self.scope.recover_stale(txid, &manifest.destinations());
        let record = ProgressRecord::started(Operation::Install);
        self.store
            .set(txid, &record)
            .map_err(store_unavailable(txid))?;
        info!(txid, title = %manifest.details.title, "installation started");
        Ok(record.response())
    }

    fn advance(
        &self,
        manifest: &PackageManifest,
        record: &ProgressRecord,
        next: InstallStage,
        access_token: Option<&str>,
    ) -> Result<ProgressRecord, StageError> {
        let txid = manifest.txid();
        let mut advanced = record.at_install_stage(next);
        match next {
            InstallStage::Started => {}
            InstallStage::BackedUp => {
                let mut journal = self.scope.journal(txid)?;
                let moved = self
                    .scope
                    .backups(txid)
                    .quarantine(&manifest.destinations(), Some(&mut journal))?;
                debug!(txid, quarantined = moved.len(), "destinations quarantined");
            }
            InstallStage::Downloaded => {
                let staging = self.scope.staging_path(txid);
                let strategy = self.downloads.download(manifest, &staging, access_token)?;
                debug!(txid, strategy = strategy.as_str(), "package downloaded");
            }
            InstallStage::Installed => {
                advanced.update_needed |= self.install_files(manifest)?;
            }
            InstallStage::Migrated => {
                let context = self.config.migration_context(self.scope.layout(), txid);
                MigrationRunner::new(&self.executor, context).run_up(&manifest.migrations.up)?;
                advanced.clear_cache = advanced.update_needed;
            }
        }
        Ok(advanced)
    }

    /// Moves every staged file onto its destination. Returns true when the
    /// package carried the update marker.
    fn install_files(&self, manifest: &PackageManifest) -> Result<bool, StageError> {
        let txid = manifest.txid();
        let fs = self.scope.fs();
        let staging = self.scope.staging_path(txid);
        let mut journal = self.scope.journal(txid)?;
        let mut update_needed = false;

        for file in &manifest.file_list.included_files {
            let destination = file.destination_path();
            if destination == self.update_marker {
                debug!(txid, path = %destination.display(), "update marker diverted");
                update_needed = true;
                continue;
            }

            let staged = staging.join(&destination);
            let target = fs.resolve(&destination)?;
            if !fs.exists(&staged) {
                if journal.contains(JournalOp::Install, &destination) && fs.exists(&target) {
                    continue;
                }
                return Err(FsError::NotFound { path: staged }.into());
            }
            if fs.exists(&target) {
                self.clear_target(txid, &mut journal, &destination)?;
            }

            self.scope.create_parents(&mut journal, &destination)?;
            journal.append(JournalOp::Install, &destination)?;
            fs.move_path(&staged, &target)?;
            debug!(txid, path = %destination.display(), "file installed");
        }
        Ok(update_needed)
    }

    /// A destination that reappeared after quarantine is quarantined now,
    /// unless it still holds an earlier backup.
    fn clear_target(
        &self,
        txid: &str,
        journal: &mut crate::CommandLog,
        destination: &Path,
    ) -> Result<(), StageError> {
        let backups = self.scope.backups(txid);
        if backups.has_backup(destination) {
            return Err(FsError::AlreadyExists {
                path: self.scope.fs().resolve(destination)?,
            }
            .into());
        }
        backups.quarantine(&[destination.to_path_buf()], Some(journal))?;
        Ok(())
    }

    /// Completes a transaction whose record is at 100: writes the marker,
    /// drops backups and scratch files, then deletes the record.
    fn finish(
        &self,
        manifest: &PackageManifest,
        record: &ProgressRecord,
    ) -> Result<PollResponse, InstallError> {
        let txid = manifest.txid();
        if record.update_needed {
            if let Err(err) = self.scope.fs().write_marker(&self.update_marker) {
                warn!(txid, error = %err, "failed to write update marker");
            }
        }
        match self.scope.backups(txid).discard(&manifest.destinations()) {
            Ok(discarded) => debug!(txid, discarded, "backups discarded"),
            Err(err) => warn!(txid, error = %err, "failed to discard backups"),
        }
        self.scope.cleanup(txid);
        self.store.delete(txid).map_err(store_unavailable(txid))?;
        self.scope.release_lock(txid);
        info!(txid, "installation complete");
        Ok(record.response())
    }

    fn fail_corrupted(&self, manifest: &PackageManifest, detail: String) -> InstallError {
        let txid = manifest.txid();
        error!(txid, detail = %detail, "corrupted progress state");
        self.scope.rollback(txid, &manifest.destinations());
        delete_record(&self.store, txid);
        self.scope.release_lock(txid);
        failed(
            txid,
            Operation::Install,
            StageError::CorruptedProgressState { detail },
        )
    }
}
