use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use shoppack_core::{
    validate_relative_path, validate_txid, ManifestError, Operation, PackageManifest,
    PollResponse, ProgressRecord, RemovalStage,
};
use tracing::{debug, error, info, warn};

use crate::transaction::{
    check_operation, delete_record, failed, load_record, store_unavailable, LoadedRecord,
};
use crate::{
    FsError, FsGateway, InstallError, InstallLayout, InstallerConfig, MigrationExecutor,
    MigrationRunner, ProgressStore, ShopConfig, StageError, TransactionScope,
};

/// The resolved set of files a removal takes away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovalRequest {
    pub txid: String,
    pub files: Vec<PathBuf>,
    pub down_migrations: Vec<String>,
    /// Emptied directories are pruned up to, but not including, this one.
    pub prune_stop: Option<PathBuf>,
}

impl RemovalRequest {
    pub fn new<I, T>(
        txid: &str,
        files: I,
        down_migrations: Vec<String>,
    ) -> Result<Self, ManifestError>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        validate_txid(txid)?;
        let files = files
            .into_iter()
            .map(|file| validate_relative_path(file.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        for script in &down_migrations {
            validate_relative_path(script)?;
        }
        Ok(Self {
            txid: txid.to_string(),
            files,
            down_migrations,
            prune_stop: None,
        })
    }

    /// Every file below `dir`, which is itself removed once empty. A missing
    /// directory yields an empty list, as when a removal that already pruned
    /// it is polled again.
    pub fn for_directory(
        fs: &FsGateway,
        txid: &str,
        dir: &str,
        down_migrations: Vec<String>,
    ) -> Result<Self, StageError> {
        let dir = validate_relative_path(dir)?;
        let files = match fs.files_under(&dir) {
            Ok(files) => files,
            Err(FsError::NotFound { .. }) => Vec::new(),
            Err(err) => return Err(err.into()),
        };
        let mut request = Self::new(
            txid,
            files.iter().map(|file| file.to_string_lossy().into_owned()),
            down_migrations,
        )?;
        request.prune_stop = Some(dir.parent().map(Path::to_path_buf).unwrap_or_default());
        Ok(request)
    }

    /// Undoes a previously installed manifest.
    pub fn from_manifest(manifest: &PackageManifest) -> Self {
        Self {
            txid: manifest.txid().to_string(),
            files: manifest.destinations(),
            down_migrations: manifest.migrations.down.clone(),
            prune_stop: None,
        }
    }

    /// Where pruning of `file`'s emptied parents stops.
    fn prune_stop_for(&self, file: &Path) -> PathBuf {
        if let Some(stop) = &self.prune_stop {
            return stop.clone();
        }
        match file.components().next() {
            Some(Component::Normal(top)) => PathBuf::from(top),
            _ => PathBuf::new(),
        }
    }
}

/// Uninstalls one package, one checkpoint per poll, holding the shop in
/// maintenance mode from the first mutating stage until the end.
pub struct Remover<P, C, E> {
    scope: TransactionScope,
    config: InstallerConfig,
    store: P,
    shop: C,
    executor: E,
}

impl<P, C, E> Remover<P, C, E>
where
    P: ProgressStore,
    C: ShopConfig,
    E: MigrationExecutor,
{
    pub fn new(
        config: &InstallerConfig,
        layout: InstallLayout,
        store: P,
        shop: C,
        executor: E,
    ) -> Self {
        Self {
            scope: TransactionScope::new(layout),
            config: config.clone(),
            store,
            shop,
            executor,
        }
    }

    pub fn scope(&self) -> &TransactionScope {
        &self.scope
    }

    pub fn shop(&self) -> &C {
        &self.shop
    }

    pub fn poll(&self, request: &RemovalRequest) -> Result<PollResponse, InstallError> {
        let txid = request.txid.as_str();
        let _lock = self.scope.lock(txid)?;

        let record = match load_record(&self.store, txid)? {
            LoadedRecord::Missing => {
                self.scope.recover_stale(txid, &request.files);
                let mut record = ProgressRecord::started(Operation::Remove);
                record.targets.clone_from(&request.files);
                self.store
                    .set(txid, &record)
                    .map_err(store_unavailable(txid))?;
                info!(txid, files = request.files.len(), "removal started");
                return Ok(record.response());
            }
            LoadedRecord::Corrupt(detail) => {
                return Err(self.fail(
                    request,
                    &request.files,
                    None,
                    StageError::CorruptedProgressState { detail },
                ))
            }
            LoadedRecord::Present(record) => record,
        };
        check_operation(txid, &record, Operation::Remove)?;
        let targets = recorded_targets(request, &record);

        let Some(stage) = record.removal_stage() else {
            let detail = format!("unknown checkpoint {}", record.progress);
            return Err(self.fail(
                request,
                targets,
                record.maintenance_restore,
                StageError::CorruptedProgressState { detail },
            ));
        };
        let Some(next) = stage.next() else {
            debug!(txid, "final cleanup was interrupted; finishing it");
            return self.finish(request, targets, &record);
        };

        let advanced = match self.advance(request, targets, &record, next) {
            Ok(advanced) => advanced,
            Err((prior, err)) => {
                error!(txid, stage = next.label(), error = %err, "removal stage failed");
                return Err(self.fail(request, targets, prior, err));
            }
        };

        self.store
            .set(txid, &advanced)
            .map_err(store_unavailable(txid))?;
        info!(txid, stage = next.label(), progress = next.percent(), "removal advanced");

        if advanced.is_complete() {
            return self.finish(request, targets, &advanced);
        }
        Ok(advanced.response())
    }

    /// Restores whatever an in-flight removal took away. Returns false when
    /// nothing was in flight.
    pub fn abandon(&self, request: &RemovalRequest) -> Result<bool, InstallError> {
        let txid = request.txid.as_str();
        let _lock = self.scope.lock(txid)?;

        let (targets, prior) = match load_record(&self.store, txid)? {
            LoadedRecord::Present(record) => {
                check_operation(txid, &record, Operation::Remove)?;
                let targets = recorded_targets(request, &record).to_vec();
                (targets, record.maintenance_restore)
            }
            LoadedRecord::Corrupt(_) => (request.files.clone(), None),
            LoadedRecord::Missing if self.scope.has_artifacts(txid) => {
                (request.files.clone(), None)
            }
            LoadedRecord::Missing => {
                self.scope.release_lock(txid);
                return Ok(false);
            }
        };

        warn!(txid, "abandoning removal");
        self.compensate(txid, &targets, prior);
        self.store.delete(txid).map_err(store_unavailable(txid))?;
        self.scope.release_lock(txid);
        Ok(true)
    }

    /// On failure also returns the maintenance flag to restore, which may have
    /// been captured by this very stage.
    fn advance(
        &self,
        request: &RemovalRequest,
        targets: &[PathBuf],
        record: &ProgressRecord,
        next: RemovalStage,
    ) -> Result<ProgressRecord, (Option<bool>, StageError)> {
        let txid = request.txid.as_str();
        let prior = record.maintenance_restore;
        let mut advanced = record.at_removal_stage(next);
        match next {
            RemovalStage::Started | RemovalStage::Complete => {}
            RemovalStage::Prepared => {
                self.check_writable(targets).map_err(|err| (prior, err))?;
                let prior = self.enter_maintenance(txid, record).map_err(|err| (prior, err))?;
                advanced.maintenance_restore = Some(prior);
            }
            RemovalStage::MigratedDown => {
                let context = self.config.migration_context(self.scope.layout(), txid);
                MigrationRunner::new(&self.executor, context)
                    .run_down(&request.down_migrations)
                    .map_err(|err| (prior, err.into()))?;
            }
            RemovalStage::Removed => {
                let quarantined = self
                    .scope
                    .journal(txid)
                    .and_then(|mut journal| {
                        self.scope
                            .backups(txid)
                            .quarantine(targets, Some(&mut journal))
                    })
                    .map_err(|err| (prior, err.into()))?;
                debug!(txid, removed = quarantined.len(), "files quarantined");
            }
        }
        Ok(advanced)
    }

    /// Captures the current flag into the record before switching
    /// maintenance on, so a crash after the switch can still restore it. A
    /// flag captured by an earlier try of this stage is reused.
    fn enter_maintenance(&self, txid: &str, record: &ProgressRecord) -> Result<bool, StageError> {
        let prior = match record.maintenance_restore {
            Some(prior) => prior,
            None => {
                let prior = self.shop.maintenance_enabled()?;
                let mut captured = record.clone();
                captured.maintenance_restore = Some(prior);
                self.store.set(txid, &captured)?;
                prior
            }
        };
        self.shop.set_maintenance(true)?;
        debug!(txid, prior, "maintenance mode enabled");
        Ok(prior)
    }

    /// Mode bits catch files marked read-only for everyone. Opening each file
    /// for writing and creating a scratch file in each parent catch what the
    /// current user in particular may not touch.
    fn check_writable(&self, targets: &[PathBuf]) -> Result<(), StageError> {
        let fs = self.scope.fs();
        let mut parents: Vec<PathBuf> = Vec::new();
        for file in targets {
            let target = fs.resolve(file)?;
            let metadata = match fs::symlink_metadata(&target) {
                Ok(metadata) => metadata,
                Err(_) => continue,
            };
            if metadata.permissions().readonly() {
                return Err(StageError::PermissionDenied { path: target });
            }
            if metadata.is_file() {
                if let Err(err) = OpenOptions::new().write(true).open(&target) {
                    return Err(access_error(target, err));
                }
            }
            if let Some(parent) = target.parent() {
                if !parents.iter().any(|seen| seen == parent) {
                    parents.push(parent.to_path_buf());
                }
            }
        }

        for parent in parents {
            let parent_readonly = fs::metadata(&parent)
                .map(|metadata| metadata.permissions().readonly())
                .map_err(|source| FsError::io("stat", &parent, source))?;
            if parent_readonly {
                return Err(StageError::PermissionDenied { path: parent });
            }
            if let Err(err) = tempfile::Builder::new()
                .prefix(".shoppack-")
                .tempfile_in(&parent)
            {
                return Err(access_error(parent, err));
            }
        }
        Ok(())
    }

    fn finish(
        &self,
        request: &RemovalRequest,
        targets: &[PathBuf],
        record: &ProgressRecord,
    ) -> Result<PollResponse, InstallError> {
        let txid = request.txid.as_str();
        let fs = self.scope.fs();
        match self.scope.backups(txid).discard(targets) {
            Ok(discarded) => debug!(txid, discarded, "backups discarded"),
            Err(err) => warn!(txid, error = %err, "failed to discard backups"),
        }
        for file in targets {
            if let Some(parent) = file.parent() {
                fs.prune_empty_dirs(parent, &request.prune_stop_for(file));
            }
        }

        if let Some(prior) = record.maintenance_restore {
            self.shop
                .set_maintenance(prior)
                .map_err(store_unavailable(txid))?;
        }
        self.scope.cleanup(txid);
        self.store.delete(txid).map_err(store_unavailable(txid))?;
        self.scope.release_lock(txid);
        info!(txid, "removal complete");
        Ok(record.response())
    }

    fn compensate(&self, txid: &str, targets: &[PathBuf], prior: Option<bool>) {
        self.scope.rollback(txid, targets);
        if let Some(prior) = prior {
            match self.shop.set_maintenance(prior) {
                Ok(()) => debug!(txid, prior, "maintenance flag restored"),
                Err(err) => warn!(txid, error = %err, "failed to restore maintenance flag"),
            }
        }
    }

    fn fail(
        &self,
        request: &RemovalRequest,
        targets: &[PathBuf],
        prior: Option<bool>,
        err: StageError,
    ) -> InstallError {
        let txid = request.txid.as_str();
        self.compensate(txid, targets, prior);
        delete_record(&self.store, txid);
        self.scope.release_lock(txid);
        failed(txid, Operation::Remove, err)
    }
}

/// The file list resolved when the removal started. Later polls may be
/// handed a request rebuilt from a tree that is already partly quarantined.
fn recorded_targets<'a>(
    request: &'a RemovalRequest,
    record: &'a ProgressRecord,
) -> &'a [PathBuf] {
    if record.targets.is_empty() {
        &request.files
    } else {
        &record.targets
    }
}

pub(crate) fn access_error(path: PathBuf, err: std::io::Error) -> StageError {
    if err.kind() == ErrorKind::PermissionDenied {
        StageError::PermissionDenied { path }
    } else {
        FsError::io("check access", path, err).into()
    }
}
