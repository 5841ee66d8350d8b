use std::fs::File;
use std::io::{self, Write};
use std::path::Path;
use std::time::Duration;

use reqwest::blocking::Client;
use shoppack_core::{ArchiveSource, PackageManifest};
use shoppack_security::{digest_matches, sha256_file_hex};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};
use zip::result::ZipError;
use zip::ZipArchive;

use crate::{DownloadError, FsError, FsGateway, TransportError};

/// Where package bytes come from. Authorization failures are plain
/// transport errors at this layer.
pub trait PackageSource {
    /// Streams the body at `url` into `sink` and returns the byte count.
    fn fetch(
        &self,
        url: &str,
        access_token: Option<&str>,
        sink: &mut dyn Write,
    ) -> Result<u64, TransportError>;
}

#[derive(Debug, Clone)]
pub struct HttpSource {
    client: Client,
}

impl HttpSource {
    pub fn new(user_agent: &str, timeout: Duration) -> reqwest::Result<Self> {
        let client = Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }
}

impl PackageSource for HttpSource {
    fn fetch(
        &self,
        url: &str,
        access_token: Option<&str>,
        sink: &mut dyn Write,
    ) -> Result<u64, TransportError> {
        let transport = |status: Option<u16>, message: String| TransportError {
            url: url.to_string(),
            status,
            message,
        };

        let mut request = self.client.get(url);
        if let Some(token) = access_token {
            request = request.bearer_auth(token);
        }
        let mut response = request
            .send()
            .map_err(|err| transport(err.status().map(|s| s.as_u16()), err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(transport(
                Some(status.as_u16()),
                format!("unexpected response {status}"),
            ));
        }

        io::copy(&mut response, sink)
            .map_err(|err| transport(Some(status.as_u16()), format!("stream error: {err}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStrategy {
    Archive,
    PerFile,
}

impl DownloadStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Archive => "archive",
            Self::PerFile => "per-file",
        }
    }
}

/// Fills a staging tree with the verified contents of a manifest.
#[derive(Debug)]
pub struct DownloadManager<S> {
    source: S,
    fs: FsGateway,
    allow_archive: bool,
}

impl<S: PackageSource> DownloadManager<S> {
    pub fn new(source: S, fs: FsGateway, allow_archive: bool) -> Self {
        Self {
            source,
            fs,
            allow_archive,
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Downloads into `staging`, trying the declared archive first. Any
    /// archive failure clears staging and falls back to per-file downloads.
    pub fn download(
        &self,
        manifest: &PackageManifest,
        staging: &Path,
        access_token: Option<&str>,
    ) -> Result<DownloadStrategy, DownloadError> {
        let txid = manifest.txid();
        self.reset_staging(staging)?;

        if let Some(archive) = manifest.file_list.zip.as_ref().filter(|_| self.allow_archive) {
            match self.download_archive(manifest, archive, staging, access_token) {
                Ok(()) => {
                    info!(txid, url = %archive.source, "package archive staged");
                    return Ok(DownloadStrategy::Archive);
                }
                Err(err) => {
                    warn!(txid, url = %archive.source, error = %err, "archive download failed; falling back to per-file");
                    self.reset_staging(staging)?;
                }
            }
        }

        for file in &manifest.file_list.included_files {
            let destination = file.destination_path();
            let target = staging.join(&destination);
            self.fetch_verified(&file.source, &file.hash, &destination, &target, access_token)?;
            debug!(txid, url = %file.source, path = %destination.display(), "file staged");
        }
        info!(txid, files = manifest.file_list.included_files.len(), "package files staged");
        Ok(DownloadStrategy::PerFile)
    }

    fn reset_staging(&self, staging: &Path) -> Result<(), FsError> {
        if self.fs.exists(staging) && !self.fs.remove_recursive(staging) {
            return Err(FsError::io(
                "clear staging",
                staging,
                io::Error::new(io::ErrorKind::Other, "staging tree could not be removed"),
            ));
        }
        self.fs.create_directory(staging)?;
        Ok(())
    }

    fn download_archive(
        &self,
        manifest: &PackageManifest,
        archive: &ArchiveSource,
        staging: &Path,
        access_token: Option<&str>,
    ) -> Result<(), DownloadError> {
        let scratch = staging.parent().unwrap_or(staging);
        let mut tmp = NamedTempFile::new_in(scratch)
            .map_err(|source| FsError::io("create temp file", scratch, source))?;
        self.source.fetch(&archive.source, access_token, &mut tmp)?;
        tmp.flush()
            .map_err(|source| FsError::io("flush", tmp.path(), source))?;

        let actual = sha256_file_hex(tmp.path())
            .map_err(|source| FsError::io("hash", tmp.path(), source))?;
        if !digest_matches(&actual, &archive.hash) {
            return Err(DownloadError::HashMismatch {
                path: archive.source.clone(),
                expected: archive.hash.clone(),
                actual,
            });
        }

        let file = File::open(tmp.path())
            .map_err(|source| FsError::io("open archive", tmp.path(), source))?;
        extract_zip(file, staging).map_err(|source| DownloadError::Archive {
            url: archive.source.clone(),
            source,
        })?;

        for included in &manifest.file_list.included_files {
            let destination = included.destination_path();
            let staged = staging.join(&destination);
            if !staged.is_file() {
                return Err(DownloadError::ArchiveIncomplete {
                    url: archive.source.clone(),
                    path: destination,
                });
            }
            let actual = sha256_file_hex(&staged)
                .map_err(|source| FsError::io("hash", &staged, source))?;
            if !digest_matches(&actual, &included.hash) {
                return Err(DownloadError::HashMismatch {
                    path: included.destination.clone(),
                    expected: included.hash.clone(),
                    actual,
                });
            }
        }
        Ok(())
    }

    /// Writes through a temp file in the target's directory so an interrupted
    /// download never leaves a partial file under its final name.
    fn fetch_verified(
        &self,
        url: &str,
        expected: &str,
        destination: &Path,
        target: &Path,
        access_token: Option<&str>,
    ) -> Result<(), DownloadError> {
        let parent = target.parent().unwrap_or(target);
        self.fs.create_directory(parent)?;

        let mut tmp = NamedTempFile::new_in(parent)
            .map_err(|source| FsError::io("create temp file", parent, source))?;
        self.source.fetch(url, access_token, &mut tmp)?;
        tmp.flush()
            .map_err(|source| FsError::io("flush", tmp.path(), source))?;

        let actual = sha256_file_hex(tmp.path())
            .map_err(|source| FsError::io("hash", tmp.path(), source))?;
        if !digest_matches(&actual, expected) {
            return Err(DownloadError::HashMismatch {
                path: destination.display().to_string(),
                expected: expected.to_string(),
                actual,
            });
        }

        tmp.persist(target)
            .map_err(|err| FsError::io("persist", target, err.error))?;
        Ok(())
    }
}

/// Unpacks every entry that stays inside `dest`; entries that would escape are skipped.
pub fn extract_zip(file: File, dest: &Path) -> Result<usize, ZipError> {
    let mut archive = ZipArchive::new(file)?;
    let mut extracted = 0;
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        let Some(enclosed) = entry.enclosed_name().map(|path| dest.join(path)) else {
            continue;
        };
        if entry.name().ends_with('/') || entry.is_dir() {
            std::fs::create_dir_all(&enclosed)?;
            continue;
        }
        if let Some(parent) = enclosed.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut outfile = File::create(&enclosed)?;
        io::copy(&mut entry, &mut outfile)?;
        extracted += 1;
    }
    Ok(extracted)
}
