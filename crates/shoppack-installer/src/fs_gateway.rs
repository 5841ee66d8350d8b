use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use tracing::debug;

use crate::FsError;

/// File primitives scoped to one installation root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsGateway {
    root: PathBuf,
}

impl FsGateway {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Joins a root-relative path, or checks that an absolute one lies under the root.
    pub fn resolve(&self, path: &Path) -> Result<PathBuf, FsError> {
        let escapes = path
            .components()
            .any(|component| matches!(component, Component::ParentDir));
        if escapes {
            return Err(FsError::PathEscapesRoot {
                path: path.to_path_buf(),
            });
        }

        if path.is_absolute() {
            if path.starts_with(&self.root) {
                return Ok(path.to_path_buf());
            }
            return Err(FsError::PathEscapesRoot {
                path: path.to_path_buf(),
            });
        }

        if path.has_root()
            || path
                .components()
                .any(|component| matches!(component, Component::Prefix(_)))
        {
            return Err(FsError::PathEscapesRoot {
                path: path.to_path_buf(),
            });
        }
        Ok(self.root.join(path))
    }

    pub fn relative(&self, path: &Path) -> Option<PathBuf> {
        path.strip_prefix(&self.root).ok().map(Path::to_path_buf)
    }

    pub fn exists(&self, path: &Path) -> bool {
        fs::symlink_metadata(path).is_ok()
    }

    /// Creates `path` and any missing ancestors, returning the directories that
    /// did not exist before, shallowest first.
    pub fn create_directory(&self, path: &Path) -> Result<Vec<PathBuf>, FsError> {
        let missing = self.missing_directories(path)?;
        let path = self.resolve(path)?;
        if !missing.is_empty() {
            fs::create_dir_all(&path).map_err(|source| FsError::CreateDirectoryFailed {
                path: path.clone(),
                source,
            })?;
        }
        Ok(missing)
    }

    /// Ancestors of `path` (itself included) that `create_directory` would
    /// create, shallowest first.
    pub fn missing_directories(&self, path: &Path) -> Result<Vec<PathBuf>, FsError> {
        let path = self.resolve(path)?;
        let mut missing = Vec::new();
        let mut current = Some(path.as_path());
        while let Some(dir) = current {
            if dir == self.root || dir.is_dir() {
                break;
            }
            missing.push(dir.to_path_buf());
            current = dir.parent();
        }
        missing.reverse();
        Ok(missing)
    }

    /// Moves a file or directory. Parent directories of `dst` are created as
    /// needed and returned; an existing `dst` is never overwritten.
    pub fn move_path(&self, src: &Path, dst: &Path) -> Result<Vec<PathBuf>, FsError> {
        let src = self.resolve(src)?;
        let dst = self.resolve(dst)?;
        if !self.exists(&src) {
            return Err(FsError::NotFound { path: src });
        }
        if self.exists(&dst) {
            return Err(FsError::AlreadyExists { path: dst });
        }

        let created = match dst.parent() {
            Some(parent) => self.create_directory(parent)?,
            None => Vec::new(),
        };

        match fs::rename(&src, &dst) {
            Ok(()) => Ok(created),
            Err(rename_err) => {
                debug!(
                    from = %src.display(),
                    to = %dst.display(),
                    error = %rename_err,
                    "rename failed; falling back to copy"
                );
                copy_recursive(&src, &dst).map_err(|source| FsError::MoveFailed {
                    from: src.clone(),
                    to: dst.clone(),
                    source,
                })?;
                remove_any(&src).map_err(|source| FsError::MoveFailed {
                    from: src.clone(),
                    to: dst.clone(),
                    source,
                })?;
                Ok(created)
            }
        }
    }

    pub fn copy(&self, src: &Path, dst: &Path) -> Result<(), FsError> {
        let src = self.resolve(src)?;
        let dst = self.resolve(dst)?;
        if !self.exists(&src) {
            return Err(FsError::NotFound { path: src });
        }
        if let Some(parent) = dst.parent() {
            self.create_directory(parent)?;
        }
        copy_recursive(&src, &dst).map_err(|source| FsError::CopyFailed {
            from: src,
            to: dst,
            source,
        })
    }

    /// Best-effort recursive delete. Returns true when nothing is left at `path`.
    pub fn remove_recursive(&self, path: &Path) -> bool {
        let Ok(path) = self.resolve(path) else {
            return false;
        };
        match remove_any(&path) {
            Ok(()) => true,
            Err(err) if err.kind() == io::ErrorKind::NotFound => true,
            Err(err) => {
                debug!(path = %path.display(), error = %err, "recursive remove incomplete");
                !self.exists(&path)
            }
        }
    }

    pub fn remove_file_if_exists(&self, path: &Path) -> Result<bool, FsError> {
        let path = self.resolve(path)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(FsError::io("remove", path, err)),
        }
    }

    /// Removes empty directories from `start` upward, stopping at `stop` or
    /// the first non-empty directory.
    pub fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let (Ok(start), Ok(stop)) = (self.resolve(start), self.resolve(stop)) else {
            return;
        };
        let mut current = Some(start.as_path());
        while let Some(dir) = current {
            if dir == stop || dir == self.root || !dir.starts_with(&stop) {
                break;
            }
            if fs::remove_dir(dir).is_err() {
                break;
            }
            current = dir.parent();
        }
    }

    pub fn remove_dir_if_empty(&self, path: &Path) -> bool {
        match self.resolve(path) {
            Ok(path) => fs::remove_dir(path).is_ok(),
            Err(_) => false,
        }
    }

    pub fn write_marker(&self, path: &Path) -> Result<(), FsError> {
        let path = self.resolve(path)?;
        if let Some(parent) = path.parent() {
            self.create_directory(parent)?;
        }
        fs::write(&path, b"").map_err(|source| FsError::io("write marker", path, source))
    }

    /// Root-relative paths of every file below `dir`, sorted.
    pub fn files_under(&self, dir: &Path) -> Result<Vec<PathBuf>, FsError> {
        let dir = self.resolve(dir)?;
        if !dir.is_dir() {
            return Err(FsError::NotFound { path: dir });
        }
        let mut files = Vec::new();
        collect_files(&dir, &mut files)?;
        let mut relative = files
            .into_iter()
            .filter_map(|path| self.relative(&path))
            .collect::<Vec<_>>();
        relative.sort();
        Ok(relative)
    }
}

fn collect_files(dir: &Path, files: &mut Vec<PathBuf>) -> Result<(), FsError> {
    let entries = fs::read_dir(dir).map_err(|source| FsError::io("read directory", dir, source))?;
    for entry in entries {
        let entry = entry.map_err(|source| FsError::io("read directory", dir, source))?;
        let path = entry.path();
        let metadata = fs::symlink_metadata(&path)
            .map_err(|source| FsError::io("stat", path.clone(), source))?;
        if metadata.is_dir() {
            collect_files(&path, files)?;
        } else {
            files.push(path);
        }
    }
    Ok(())
}

fn remove_any(path: &Path) -> io::Result<()> {
    let metadata = fs::symlink_metadata(path)?;
    if metadata.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

fn copy_recursive(src: &Path, dst: &Path) -> io::Result<()> {
    let metadata = fs::symlink_metadata(src)?;
    if !metadata.is_dir() {
        return copy_entry(src, dst, &metadata);
    }

    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        let metadata = fs::symlink_metadata(&src_path)?;
        if metadata.is_dir() {
            copy_recursive(&src_path, &dst_path)?;
        } else {
            copy_entry(&src_path, &dst_path, &metadata)?;
        }
    }
    Ok(())
}

fn copy_entry(src: &Path, dst: &Path, metadata: &fs::Metadata) -> io::Result<()> {
    #[cfg(unix)]
    if metadata.file_type().is_symlink() {
        let target = fs::read_link(src)?;
        return std::os::unix::fs::symlink(&target, dst);
    }
    #[cfg(not(unix))]
    let _ = metadata;

    fs::copy(src, dst).map(|_| ())
}
