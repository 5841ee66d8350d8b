mod manifest;
mod progress;

pub use manifest::{
    validate_relative_path, validate_txid, ArchiveSource, FileList, IncludedFile, ManifestError,
    Migrations, PackageDetails, PackageManifest,
};
pub use progress::{
    InstallStage, Operation, PollResponse, ProgressRecord, RemovalStage, CHECKPOINTS,
};
