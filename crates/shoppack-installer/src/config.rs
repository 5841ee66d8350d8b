use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::{default_install_root, InstallLayout, MigrationContext};

pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_UPDATE_MARKER: &str = "var/cache/shoppack/update_needed";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InstallerConfig {
    pub root: Option<PathBuf>,
    pub store_path: Option<PathBuf>,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub archive_extraction: bool,
    /// Root-relative path of the follow-on update marker.
    pub update_marker: PathBuf,
    pub log_filter: String,
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            root: None,
            store_path: None,
            http_timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
            user_agent: concat!("shoppack/", env!("CARGO_PKG_VERSION")).to_string(),
            archive_extraction: true,
            update_marker: PathBuf::from(DEFAULT_UPDATE_MARKER),
            log_filter: "info".to_string(),
        }
    }
}

impl InstallerConfig {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: Self = toml::from_str(input).context("failed to parse shoppack config")?;
        config.validate()?;
        Ok(config)
    }

    /// Reads `explicit` when given (it must exist), otherwise `shoppack.toml`
    /// under `root` when present, otherwise defaults.
    pub fn load(explicit: Option<&Path>, root: &Path) -> Result<Self> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => {
                let candidate = InstallLayout::new(root).default_config_path();
                if !candidate.exists() {
                    return Ok(Self::default());
                }
                candidate
            }
        };
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_toml_str(&raw).with_context(|| format!("invalid config {}", path.display()))
    }

    /// Applies `SHOPPACK_ROOT`, `SHOPPACK_STORE` and `SHOPPACK_HTTP_TIMEOUT`
    /// from `lookup` over the file values.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(root) = lookup("SHOPPACK_ROOT").filter(|value| !value.is_empty()) {
            self.root = Some(PathBuf::from(root));
        }
        if let Some(store) = lookup("SHOPPACK_STORE").filter(|value| !value.is_empty()) {
            self.store_path = Some(PathBuf::from(store));
        }
        if let Some(timeout) = lookup("SHOPPACK_HTTP_TIMEOUT") {
            self.http_timeout_secs = timeout.trim().parse().with_context(|| {
                format!("SHOPPACK_HTTP_TIMEOUT must be a number of seconds (got '{timeout}')")
            })?;
        }
        self.validate()
    }

    fn validate(&self) -> Result<()> {
        if self.http_timeout_secs == 0 {
            anyhow::bail!("http_timeout_secs must be greater than zero");
        }
        shoppack_core::validate_relative_path(&self.update_marker.to_string_lossy())
            .context("update_marker must be relative to the installation root")?;
        Ok(())
    }

    pub fn install_root(&self) -> Result<PathBuf> {
        match &self.root {
            Some(root) => Ok(root.clone()),
            None => default_install_root(),
        }
    }

    pub fn layout(&self) -> Result<InstallLayout> {
        Ok(InstallLayout::new(self.install_root()?))
    }

    /// Relative store paths are taken from the installation root.
    pub fn store_path(&self, layout: &InstallLayout) -> PathBuf {
        match &self.store_path {
            Some(path) if path.is_absolute() => path.clone(),
            Some(path) => layout.root().join(path),
            None => layout.default_store_path(),
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn migration_context(&self, layout: &InstallLayout, txid: &str) -> MigrationContext {
        MigrationContext {
            root: layout.root().to_path_buf(),
            store_path: self.store_path(layout),
            cache_dir: layout.cache_dir(),
            log_filter: self.log_filter.clone(),
            txid: txid.to_string(),
        }
    }
}
