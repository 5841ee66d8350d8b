use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("failed to parse package manifest: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("package id must be non-empty and use only [A-Za-z0-9._-] (got '{id}')")]
    InvalidId { id: String },
    #[error("invalid package path '{path}': {reason}")]
    InvalidPath { path: String, reason: &'static str },
    #[error("destination '{path}' is declared more than once")]
    DuplicateDestination { path: String },
    #[error("hash for '{path}' must be 64 hex characters (got '{hash}')")]
    InvalidHash { path: String, hash: String },
    #[error("source for '{path}' must not be empty")]
    MissingSource { path: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PackageManifest {
    pub details: PackageDetails,
    pub file_list: FileList,
    #[serde(default)]
    pub migrations: Migrations,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PackageDetails {
    pub id: String,
    #[serde(default)]
    pub title: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileList {
    #[serde(default)]
    pub included_files: Vec<IncludedFile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zip: Option<ArchiveSource>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IncludedFile {
    pub source: String,
    pub destination: String,
    pub hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArchiveSource {
    pub source: String,
    pub hash: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Migrations {
    #[serde(default)]
    pub up: Vec<String>,
    #[serde(default)]
    pub down: Vec<String>,
}

impl PackageManifest {
    pub fn from_json_str(input: &str) -> Result<Self, ManifestError> {
        let manifest: Self = serde_json::from_str(input)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Checks the invariants every later stage relies on: a usable transaction
    /// id, root-relative destinations without duplicates, and well-formed hashes.
    pub fn validate(&self) -> Result<(), ManifestError> {
        validate_txid(&self.details.id)?;

        let mut seen = HashSet::new();
        for file in &self.file_list.included_files {
            let destination = validate_relative_path(&file.destination)?;
            if !seen.insert(destination) {
                return Err(ManifestError::DuplicateDestination {
                    path: file.destination.clone(),
                });
            }
            if file.source.trim().is_empty() {
                return Err(ManifestError::MissingSource {
                    path: file.destination.clone(),
                });
            }
            validate_hash(&file.destination, &file.hash)?;
        }

        if let Some(archive) = &self.file_list.zip {
            if archive.source.trim().is_empty() {
                return Err(ManifestError::MissingSource {
                    path: "zip".to_string(),
                });
            }
            validate_hash("zip", &archive.hash)?;
        }

        for script in self.migrations.up.iter().chain(&self.migrations.down) {
            validate_relative_path(script)?;
        }

        Ok(())
    }

    pub fn txid(&self) -> &str {
        &self.details.id
    }

    pub fn destinations(&self) -> Vec<PathBuf> {
        self.file_list
            .included_files
            .iter()
            .map(IncludedFile::destination_path)
            .collect()
    }
}

impl IncludedFile {
    /// Normalized root-relative destination. Manifests are validated on parse,
    /// so the raw value is only used verbatim for hand-built manifests.
    pub fn destination_path(&self) -> PathBuf {
        validate_relative_path(&self.destination)
            .unwrap_or_else(|_| PathBuf::from(&self.destination))
    }
}

pub fn validate_txid(id: &str) -> Result<(), ManifestError> {
    let valid = !id.is_empty()
        && id != "."
        && id != ".."
        && id
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(ManifestError::InvalidId { id: id.to_string() })
    }
}

/// Parses a path that must stay inside the installation root.
pub fn validate_relative_path(value: &str) -> Result<PathBuf, ManifestError> {
    let invalid = |reason| ManifestError::InvalidPath {
        path: value.to_string(),
        reason,
    };

    if value.trim().is_empty() {
        return Err(invalid("path must not be empty"));
    }

    let path = Path::new(value);
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            Component::ParentDir => return Err(invalid("path must not contain '..'")),
            Component::RootDir | Component::Prefix(_) => {
                return Err(invalid("path must be relative to the installation root"))
            }
        }
    }

    if normalized.as_os_str().is_empty() {
        return Err(invalid("path must name a file"));
    }
    Ok(normalized)
}

fn validate_hash(path: &str, hash: &str) -> Result<(), ManifestError> {
    if hash.len() == 64 && hash.chars().all(|ch| ch.is_ascii_hexdigit()) {
        return Ok(());
    }
    Err(ManifestError::InvalidHash {
        path: path.to_string(),
        hash: hash.to_string(),
    })
}
