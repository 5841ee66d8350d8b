use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// The only progress values a record may ever hold.
pub const CHECKPOINTS: [u8; 5] = [0, 20, 50, 80, 100];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    #[default]
    Install,
    Remove,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Install => "install",
            Self::Remove => "remove",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Installation checkpoints. Each poll performs exactly the transition from
/// the stored stage to `next()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum InstallStage {
    Started,
    BackedUp,
    Downloaded,
    Installed,
    Migrated,
}

impl InstallStage {
    pub fn percent(self) -> u8 {
        match self {
            Self::Started => 0,
            Self::BackedUp => 20,
            Self::Downloaded => 50,
            Self::Installed => 80,
            Self::Migrated => 100,
        }
    }

    pub fn from_percent(percent: u8) -> Option<Self> {
        match percent {
            0 => Some(Self::Started),
            20 => Some(Self::BackedUp),
            50 => Some(Self::Downloaded),
            80 => Some(Self::Installed),
            100 => Some(Self::Migrated),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::BackedUp => "backed-up",
            Self::Downloaded => "downloaded",
            Self::Installed => "installed",
            Self::Migrated => "migrated",
        }
    }

    pub fn next(self) -> Option<Self> {
        match self {
            Self::Started => Some(Self::BackedUp),
            Self::BackedUp => Some(Self::Downloaded),
            Self::Downloaded => Some(Self::Installed),
            Self::Installed => Some(Self::Migrated),
            Self::Migrated => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RemovalStage {
    Started,
    Prepared,
    MigratedDown,
    Removed,
    Complete,
}

impl RemovalStage {
    pub fn percent(self) -> u8 {
        match self {
            Self::Started => 0,
            Self::Prepared => 20,
            Self::MigratedDown => 50,
            Self::Removed => 80,
            Self::Complete => 100,
        }
    }

    pub fn from_percent(percent: u8) -> Option<Self> {
        match percent {
            0 => Some(Self::Started),
            20 => Some(Self::Prepared),
            50 => Some(Self::MigratedDown),
            80 => Some(Self::Removed),
            100 => Some(Self::Complete),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Prepared => "prepared",
            Self::MigratedDown => "migrated-down",
            Self::Removed => "removed",
            Self::Complete => "complete",
        }
    }

    pub fn next(self) -> Option<Self> {
        match self {
            Self::Started => Some(Self::Prepared),
            Self::Prepared => Some(Self::MigratedDown),
            Self::MigratedDown => Some(Self::Removed),
            Self::Removed => Some(Self::Complete),
            Self::Complete => None,
        }
    }
}

/// Durable per-transaction state. This is everything that survives between
/// two polls of the same transaction id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressRecord {
    #[serde(default)]
    pub operation: Operation,
    pub success: bool,
    pub stage: String,
    pub progress: u8,
    #[serde(default)]
    pub clear_cache: bool,
    #[serde(default)]
    pub update_needed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maintenance_restore: Option<bool>,
    /// Root-relative files a removal takes away, resolved once at the first poll.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<PathBuf>,
}

impl ProgressRecord {
    pub fn started(operation: Operation) -> Self {
        Self {
            operation,
            success: true,
            stage: "started".to_string(),
            progress: 0,
            clear_cache: false,
            update_needed: false,
            maintenance_restore: None,
            targets: Vec::new(),
        }
    }

    pub fn install_stage(&self) -> Option<InstallStage> {
        InstallStage::from_percent(self.progress)
    }

    pub fn removal_stage(&self) -> Option<RemovalStage> {
        RemovalStage::from_percent(self.progress)
    }

    /// Copy of this record moved to `stage`, keeping the carried flags.
    pub fn at_install_stage(&self, stage: InstallStage) -> Self {
        Self {
            stage: stage.label().to_string(),
            progress: stage.percent(),
            ..self.clone()
        }
    }

    pub fn at_removal_stage(&self, stage: RemovalStage) -> Self {
        Self {
            stage: stage.label().to_string(),
            progress: stage.percent(),
            ..self.clone()
        }
    }

    pub fn is_complete(&self) -> bool {
        self.progress == 100
    }

    pub fn response(&self) -> PollResponse {
        PollResponse {
            success: self.success,
            state: self.stage.clone(),
            progress: self.progress,
            clear_cache: self.clear_cache,
        }
    }
}

/// What a caller sees after each poll: `{success, state, progress, clearCache?}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollResponse {
    pub success: bool,
    pub state: String,
    pub progress: u8,
    #[serde(default, skip_serializing_if = "is_false")]
    pub clear_cache: bool,
}

impl PollResponse {
    pub fn is_complete(&self) -> bool {
        self.progress == 100
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}
