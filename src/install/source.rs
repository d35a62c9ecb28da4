//! Where server packages come from
//!
//! Fetching and unpacking are abstracted behind [`PackageSource`] and
//! [`PackageExtractor`]. The bundled implementations work on a local mirror
//! directory; network sources plug in behind the same traits.

use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::install::error::InstallError;
use crate::install::platform::PlatformInformation;

/// File in a mirror root naming the newest published version
pub const LATEST_VERSION_FILE: &str = "latest-version.txt";

/// Result of a download into the staging directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedPackage {
    pub payload: PathBuf,
    /// Expected SHA-256 of the payload as published by the source
    pub sha256: Option<String>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PackageSource: Send + Sync {
    /// Newest published server version
    async fn latest_version(&self) -> Result<String, InstallError>;

    /// Fetch the package for `version` and `platform` into `staging`
    async fn download(
        &self,
        version: &str,
        platform: &PlatformInformation,
        staging: &Path,
    ) -> Result<DownloadedPackage, InstallError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PackageExtractor: Send + Sync {
    /// Unpack `payload` into `destination`, which already exists
    async fn extract(&self, payload: &Path, destination: &Path) -> Result<(), InstallError>;
}

// ============================================================================
// Local mirror
// ============================================================================

/// Mirror directory layout:
///
/// ```text
/// {root}/latest-version.txt
/// {root}/{version}/{package_id}/...        payload
/// {root}/{version}/{package_id}.sha256     optional digest
/// ```
#[derive(Debug, Clone)]
pub struct MirrorPackageSource {
    root: PathBuf,
}

impl MirrorPackageSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl PackageSource for MirrorPackageSource {
    async fn latest_version(&self) -> Result<String, InstallError> {
        let path = self.root.join(LATEST_VERSION_FILE);
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| InstallError::download("latest", format!("{}: {}", path.display(), e)))?;

        let version = contents.trim();
        if version.is_empty() {
            return Err(InstallError::download(
                "latest",
                format!("{} is empty", path.display()),
            ));
        }
        Ok(version.to_string())
    }

    async fn download(
        &self,
        version: &str,
        platform: &PlatformInformation,
        staging: &Path,
    ) -> Result<DownloadedPackage, InstallError> {
        let package_id = platform.package_id()?;
        let source = self.root.join(version).join(&package_id);
        if !source.exists() {
            return Err(InstallError::download(
                version,
                format!("package not found at {}", source.display()),
            ));
        }

        info!("Fetching server {} ({}) from {}", version, package_id, self.root.display());

        let payload = staging.join(&package_id);
        let (from, to) = (source.clone(), payload.clone());
        let copied = tokio::task::spawn_blocking(move || copy_payload(&from, &to))
            .await
            .map_err(|e| InstallError::download(version, e))?
            .map_err(|e| InstallError::download(version, e))?;
        debug!("Fetched {} files into {}", copied, payload.display());

        let digest_file = self.root.join(version).join(format!("{package_id}.sha256"));
        let sha256 = match tokio::fs::read_to_string(&digest_file).await {
            Ok(contents) => contents.split_whitespace().next().map(str::to_string),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(InstallError::download(version, e)),
        };

        Ok(DownloadedPackage { payload, sha256 })
    }
}

/// Source used when no update source is configured
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineSource;

#[async_trait]
impl PackageSource for OfflineSource {
    async fn latest_version(&self) -> Result<String, InstallError> {
        Err(InstallError::download("latest", "no update source configured"))
    }

    async fn download(
        &self,
        version: &str,
        _platform: &PlatformInformation,
        _staging: &Path,
    ) -> Result<DownloadedPackage, InstallError> {
        Err(InstallError::download(version, "no update source configured"))
    }
}

// ============================================================================
// Extraction
// ============================================================================

/// Installs an already unpacked payload by copying it
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectoryExtractor;

#[async_trait]
impl PackageExtractor for DirectoryExtractor {
    async fn extract(&self, payload: &Path, destination: &Path) -> Result<(), InstallError> {
        let (from, to) = (payload.to_path_buf(), destination.to_path_buf());
        let result = tokio::task::spawn_blocking(move || {
            if from.is_dir() {
                copy_payload(&from, &to)
            } else {
                let name = from.file_name().ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidInput, "payload has no file name")
                })?;
                std::fs::copy(&from, to.join(name)).map(|_| 1)
            }
        })
        .await;

        match result {
            Ok(Ok(files)) => {
                debug!("Extracted {} files into {}", files, destination.display());
                Ok(())
            }
            Ok(Err(e)) => Err(InstallError::Extraction {
                payload: payload.to_path_buf(),
                reason: e.to_string(),
            }),
            Err(e) => {
                warn!("Extraction task failed: {}", e);
                Err(InstallError::Extraction {
                    payload: payload.to_path_buf(),
                    reason: e.to_string(),
                })
            }
        }
    }
}

/// Copy a file or directory tree to `destination`; returns the file count
fn copy_payload(source: &Path, destination: &Path) -> io::Result<usize> {
    if source.is_file() {
        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(source, destination)?;
        return Ok(1);
    }

    let mut files = 0;
    for entry in WalkDir::new(source) {
        let entry = entry.map_err(io::Error::other)?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(io::Error::other)?;
        let target = destination.join(relative);

        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
            files += 1;
        }
    }
    Ok(files)
}
