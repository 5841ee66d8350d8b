use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;

use shoppack_core::validate_relative_path;
use tracing::{debug, info, warn};

use crate::MigrationError;

/// Environment variable set while a migration script runs. Host code checks
/// it to avoid loading its own copies of the installer collaborators.
pub const MIGRATING_ENV: &str = "SHOPPACK_MIGRATING";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationDirection {
    Up,
    Down,
}

impl MigrationDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Down => "down",
        }
    }
}

impl fmt::Display for MigrationDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The collaborator set a script is handed, frozen when the runner is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationContext {
    pub root: PathBuf,
    pub store_path: PathBuf,
    pub cache_dir: PathBuf,
    pub log_filter: String,
    pub txid: String,
}

impl MigrationContext {
    pub fn env(&self, direction: MigrationDirection) -> Vec<(&'static str, String)> {
        vec![
            ("SHOPPACK_ROOT", self.root.display().to_string()),
            ("SHOPPACK_STORE", self.store_path.display().to_string()),
            ("SHOPPACK_CACHE_DIR", self.cache_dir.display().to_string()),
            ("SHOPPACK_LOG", self.log_filter.clone()),
            ("SHOPPACK_TXID", self.txid.clone()),
            ("SHOPPACK_DIRECTION", direction.as_str().to_string()),
            (MIGRATING_ENV, "1".to_string()),
        ]
    }
}

pub trait MigrationExecutor {
    fn execute(
        &self,
        script: &Path,
        direction: MigrationDirection,
        context: &MigrationContext,
    ) -> Result<(), MigrationError>;
}

/// Runs each script as its own process, so the script always sees the code
/// currently on disk rather than anything loaded by this installer.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandExecutor;

impl MigrationExecutor for CommandExecutor {
    fn execute(
        &self,
        script: &Path,
        direction: MigrationDirection,
        context: &MigrationContext,
    ) -> Result<(), MigrationError> {
        let mut command = if script.extension().is_some_and(|ext| ext == "sh") {
            let mut command = Command::new("sh");
            command.arg(script);
            command
        } else {
            Command::new(script)
        };
        command.current_dir(&context.root);
        for (key, value) in context.env(direction) {
            command.env(key, value);
        }

        let output = command.output().map_err(|source| MigrationError::Launch {
            script: script.to_path_buf(),
            source,
        })?;
        if output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            if !stdout.trim().is_empty() {
                debug!(script = %script.display(), output = %stdout.trim(), "migration output");
            }
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let reason = match stderr.trim() {
            "" => format!("exited with {}", output.status),
            detail => format!("exited with {}: {detail}", output.status),
        };
        Err(MigrationError::Failed {
            script: script.to_path_buf(),
            reason,
        })
    }
}

pub struct MigrationRunner<E> {
    executor: E,
    context: MigrationContext,
}

impl<E: MigrationExecutor> MigrationRunner<E> {
    pub fn new(executor: E, context: MigrationContext) -> Self {
        Self { executor, context }
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub fn context(&self) -> &MigrationContext {
        &self.context
    }

    pub fn run_up(&self, scripts: &[String]) -> Result<usize, MigrationError> {
        self.run(scripts, MigrationDirection::Up)
    }

    pub fn run_down(&self, scripts: &[String]) -> Result<usize, MigrationError> {
        self.run(scripts, MigrationDirection::Down)
    }

    /// Runs `scripts` in order and stops at the first failure.
    fn run(&self, scripts: &[String], direction: MigrationDirection) -> Result<usize, MigrationError> {
        for (index, script) in scripts.iter().enumerate() {
            let path = self.resolve(script)?;
            info!(
                txid = %self.context.txid,
                script = %script,
                direction = %direction,
                position = index + 1,
                total = scripts.len(),
                "running migration"
            );
            if let Err(err) = self.executor.execute(&path, direction, &self.context) {
                warn!(txid = %self.context.txid, script = %script, error = %err, "migration failed");
                return Err(err);
            }
        }
        Ok(scripts.len())
    }

    fn resolve(&self, script: &str) -> Result<PathBuf, MigrationError> {
        let relative = validate_relative_path(script).map_err(|_| MigrationError::InvalidPath {
            script: script.to_string(),
        })?;
        let path = self.context.root.join(relative);
        if !path.is_file() {
            return Err(MigrationError::NotFound { script: path });
        }
        Ok(path)
    }
}

impl<E> fmt::Debug for MigrationRunner<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationRunner")
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

impl<E: MigrationExecutor + ?Sized> MigrationExecutor for &E {
    fn execute(
        &self,
        script: &Path,
        direction: MigrationDirection,
        context: &MigrationContext,
    ) -> Result<(), MigrationError> {
        (**self).execute(script, direction, context)
    }
}
