use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

pub const BACKUP_SUFFIX: &str = ".shoppack-backup";

/// Every installer-owned path, derived from the installation root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallLayout {
    root: PathBuf,
}

impl InstallLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn var_dir(&self) -> PathBuf {
        self.root.join("var")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.var_dir().join("cache").join("shoppack")
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.cache_dir().join("backup")
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.cache_dir().join("staging")
    }

    pub fn journals_dir(&self) -> PathBuf {
        self.cache_dir().join("journal")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.cache_dir().join("locks")
    }

    pub fn default_store_path(&self) -> PathBuf {
        self.var_dir().join("shoppack.sqlite")
    }

    pub fn default_config_path(&self) -> PathBuf {
        self.root.join("shoppack.toml")
    }

    pub fn transaction_staging_path(&self, txid: &str) -> PathBuf {
        self.staging_dir().join(txid)
    }

    pub fn journal_path(&self, txid: &str) -> PathBuf {
        self.journals_dir().join(format!("{txid}.journal"))
    }

    pub fn lock_path(&self, txid: &str) -> PathBuf {
        self.locks_dir().join(format!("{txid}.lock"))
    }

    pub fn transaction_backup_dir(&self, txid: &str) -> PathBuf {
        self.backup_dir().join(txid)
    }

    /// Quarantine location of a root-relative destination within one transaction.
    pub fn backup_path(&self, txid: &str, relative: &Path) -> PathBuf {
        let mut path = self.transaction_backup_dir(txid).join(relative).into_os_string();
        path.push(BACKUP_SUFFIX);
        PathBuf::from(path)
    }
}

pub fn default_install_root() -> Result<PathBuf> {
    if let Some(root) = std::env::var_os("SHOPPACK_ROOT") {
        return Ok(PathBuf::from(root));
    }
    std::env::current_dir().context("failed to resolve the current directory as install root")
}
