use std::io;
use std::path::PathBuf;

use shoppack_core::{ManifestError, Operation};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum FsError {
    #[error("path not found: {}", path.display())]
    NotFound { path: PathBuf },
    #[error("destination already exists: {}", path.display())]
    AlreadyExists { path: PathBuf },
    #[error("failed to create directory {}: {source}", path.display())]
    CreateDirectoryFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to move {} to {}: {source}", from.display(), to.display())]
    MoveFailed {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to copy {} to {}: {source}", from.display(), to.display())]
    CopyFailed {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("path escapes the installation root: {}", path.display())]
    PathEscapesRoot { path: PathBuf },
    #[error("command log {} is corrupt at line {line}", path.display())]
    CorruptJournal { path: PathBuf, line: usize },
    #[error("failed to {action} {}: {source}", path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl FsError {
    pub(crate) fn io(action: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            action,
            path: path.into(),
            source,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("progress store unavailable ({context}): {source}")]
    Unavailable {
        context: String,
        #[source]
        source: BoxError,
    },
    #[error("stored value under '{key}' cannot be decoded: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    pub(crate) fn unavailable(
        context: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Unavailable {
            context: context.into(),
            source: Box::new(source),
        }
    }
}

/// A network-level failure reaching the package source. Authorization
/// failures are reported the same way.
#[derive(Debug, Clone, thiserror::Error)]
#[error("failed to fetch {url} (status={}): {message}", display_status(.status))]
pub struct TransportError {
    pub url: String,
    pub status: Option<u16>,
    pub message: String,
}

fn display_status(status: &Option<u16>) -> String {
    status.map_or_else(|| "none".to_string(), |code| code.to_string())
}

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("hash mismatch for {path} (expected {expected}, got {actual})")]
    HashMismatch {
        path: String,
        expected: String,
        actual: String,
    },
    #[error("failed to extract package archive {url}: {source}")]
    Archive {
        url: String,
        #[source]
        source: zip::result::ZipError,
    },
    #[error("package archive {url} does not contain {}", path.display())]
    ArchiveIncomplete { url: String, path: PathBuf },
    #[error(transparent)]
    Fs(#[from] FsError),
}

#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("migration script path is invalid: {script}")]
    InvalidPath { script: String },
    #[error("migration script not found: {}", script.display())]
    NotFound { script: PathBuf },
    #[error("failed to launch migration script {}: {source}", script.display())]
    Launch {
        script: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("migration script {} failed: {reason}", script.display())]
    Failed { script: PathBuf, reason: String },
}

impl MigrationError {
    pub fn script(&self) -> String {
        match self {
            Self::InvalidPath { script } => script.clone(),
            Self::NotFound { script } | Self::Launch { script, .. } | Self::Failed { script, .. } => {
                script.display().to_string()
            }
        }
    }
}

/// Failure of a single stage transition. Any of these triggers rollback.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error(transparent)]
    Fs(#[from] FsError),
    #[error(transparent)]
    Download(#[from] DownloadError),
    #[error(transparent)]
    Migration(#[from] MigrationError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error("corrupted progress state: {detail}")]
    CorruptedProgressState { detail: String },
    #[error("no write permission for {}", path.display())]
    PermissionDenied { path: PathBuf },
}

/// Everything an orchestrator returns to its caller.
#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    #[error("progress store unavailable for transaction {txid}: {source}")]
    StoreUnavailable {
        txid: String,
        #[source]
        source: StoreError,
    },
    #[error("transaction {txid} is already being advanced by another poll")]
    Busy { txid: String },
    #[error("failed to lock transaction {txid}: {source}")]
    Lock {
        txid: String,
        #[source]
        source: FsError,
    },
    #[error("transaction {txid} is an in-flight {active} operation, not {requested}")]
    OperationConflict {
        txid: String,
        active: Operation,
        requested: Operation,
    },
    #[error("{operation} of {txid} failed: {source}")]
    InstallationFailed {
        txid: String,
        operation: Operation,
        #[source]
        source: StageError,
    },
}

impl InstallError {
    pub fn txid(&self) -> &str {
        match self {
            Self::StoreUnavailable { txid, .. }
            | Self::Busy { txid }
            | Self::Lock { txid, .. }
            | Self::OperationConflict { txid, .. }
            | Self::InstallationFailed { txid, .. } => txid,
        }
    }

    /// True when nothing was rolled back and the same poll may simply be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable { .. } | Self::Busy { .. })
    }
}
