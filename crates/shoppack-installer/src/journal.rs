use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{BackupManager, FsError, FsGateway};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalOp {
    /// A destination moved into the backup tree.
    Quarantine,
    /// A directory created under the root.
    CreateDir,
    /// A staged file moved onto its destination.
    Install,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub seq: u64,
    pub op: JournalOp,
    pub path: PathBuf,
}

/// Append-only record of every mutation made on behalf of one transaction.
///
/// Entries are written before the mutation they describe, so a crash between
/// the append and the mutation leaves an entry whose inverse is a no-op.
#[derive(Debug)]
pub struct CommandLog {
    path: PathBuf,
    entries: Vec<JournalEntry>,
}

impl CommandLog {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, FsError> {
        let path = path.into();
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => String::new(),
            Err(err) => return Err(FsError::io("read command log", path, err)),
        };

        let mut entries = Vec::new();
        for (index, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let entry: JournalEntry =
                serde_json::from_str(line).map_err(|_| FsError::CorruptJournal {
                    path: path.clone(),
                    line: index + 1,
                })?;
            entries.push(entry);
        }
        entries.sort_by_key(|entry| entry.seq);

        Ok(Self { path, entries })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entries(&self) -> &[JournalEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn append(&mut self, op: JournalOp, path: &Path) -> Result<(), FsError> {
        let seq = self.entries.last().map_or(1, |entry| entry.seq + 1);
        let entry = JournalEntry {
            seq,
            op,
            path: path.to_path_buf(),
        };

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|source| FsError::CreateDirectoryFailed {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let mut line = serde_json::to_string(&entry).map_err(|err| {
            FsError::io("encode command log entry", &self.path, err.into())
        })?;
        line.push('\n');

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|source| FsError::io("open command log", &self.path, source))?;
        file.write_all(line.as_bytes())
            .map_err(|source| FsError::io("append command log", &self.path, source))?;
        file.flush()
            .map_err(|source| FsError::io("flush command log", &self.path, source))?;

        self.entries.push(entry);
        Ok(())
    }

    pub fn contains(&self, op: JournalOp, path: &Path) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.op == op && entry.path == path)
    }

    /// Destinations this transaction has written a staged file onto.
    pub fn installed_paths(&self) -> Vec<PathBuf> {
        self.entries
            .iter()
            .filter(|entry| entry.op == JournalOp::Install)
            .map(|entry| entry.path.clone())
            .collect()
    }

    /// Undoes every recorded mutation, newest first. Each failure is collected
    /// and the walk continues.
    pub fn replay_inverse(&self, fs: &FsGateway, backups: &BackupManager) -> Vec<FsError> {
        let mut failures = Vec::new();
        let mut created_dirs = Vec::new();

        for entry in self.entries.iter().rev() {
            debug!(seq = entry.seq, op = ?entry.op, path = %entry.path.display(), "undoing journal entry");
            let outcome = match entry.op {
                JournalOp::Install => {
                    if backups.has_backup(&entry.path) {
                        backups.restore(&[entry.path.clone()]).map(|_| ())
                    } else {
                        fs.remove_file_if_exists(&entry.path).map(|_| ())
                    }
                }
                JournalOp::Quarantine => backups.restore(&[entry.path.clone()]).map(|_| ()),
                JournalOp::CreateDir => {
                    created_dirs.push(entry.path.clone());
                    Ok(())
                }
            };
            if let Err(err) = outcome {
                failures.push(err);
            }
        }

        created_dirs.sort_by_key(|dir| std::cmp::Reverse(dir.components().count()));
        for dir in created_dirs {
            if !fs.remove_dir_if_empty(&dir) {
                debug!(path = %dir.display(), "created directory kept");
            }
        }

        failures
    }

    pub fn delete(self) -> Result<(), FsError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(FsError::io("delete command log", self.path, err)),
        }
    }
}
