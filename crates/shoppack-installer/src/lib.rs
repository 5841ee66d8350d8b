mod backup;
mod config;
mod download;
mod error;
mod fs_gateway;
mod install;
mod journal;
mod layout;
mod lock;
mod migration;
mod removal;
mod store;
mod transaction;

pub use backup::BackupManager;
pub use config::{InstallerConfig, DEFAULT_HTTP_TIMEOUT_SECS, DEFAULT_UPDATE_MARKER};
pub use download::{extract_zip, DownloadManager, DownloadStrategy, HttpSource, PackageSource};
pub use error::{
    DownloadError, FsError, InstallError, MigrationError, StageError, StoreError, TransportError,
};
pub use fs_gateway::FsGateway;
pub use install::Installer;
pub use journal::{CommandLog, JournalEntry, JournalOp};
pub use layout::{default_install_root, InstallLayout, BACKUP_SUFFIX};
pub use lock::TransactionLock;
pub use migration::{
    CommandExecutor, MigrationContext, MigrationDirection, MigrationExecutor, MigrationRunner,
    MIGRATING_ENV,
};
pub use removal::{RemovalRequest, Remover};
pub use store::{
    KeyValueStore, ProgressStore, ShopConfig, SqliteStore, StoreShopConfig, StoredValue,
};
pub use transaction::TransactionScope;
