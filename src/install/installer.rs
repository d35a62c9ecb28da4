//! Server package installation
//!
//! An install directory is complete only when it holds `install.Lock`.
//! `install.Begin` is written first, so a directory holding the begin
//! marker but no lock is the leftover of an interrupted install and is
//! removed before the next attempt.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{Level, debug, info, warn};
use uuid::Uuid;

use crate::install::error::InstallError;
use crate::install::integrity;
use crate::install::platform::PlatformInformation;
use crate::install::source::{PackageExtractor, PackageSource};

pub const INSTALL_LOCK: &str = "install.Lock";
pub const INSTALL_BEGIN: &str = "install.Begin";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum InstallOutcome {
    AlreadyInstalled,
    #[serde(rename_all = "camelCase")]
    Installed {
        version: String,
        install_dir: PathBuf,
    },
}

pub struct DependencyInstaller {
    source: Arc<dyn PackageSource>,
    extractor: Arc<dyn PackageExtractor>,
}

impl DependencyInstaller {
    pub fn new(source: Arc<dyn PackageSource>, extractor: Arc<dyn PackageExtractor>) -> Self {
        Self { source, extractor }
    }

    pub fn source(&self) -> &dyn PackageSource {
        self.source.as_ref()
    }

    pub fn is_installed(install_dir: &Path) -> bool {
        install_dir.join(INSTALL_LOCK).is_file()
    }

    /// Install `version` into `install_dir` unless already complete
    pub async fn ensure_installed(
        &self,
        version: &str,
        platform: &PlatformInformation,
        install_dir: &Path,
    ) -> Result<InstallOutcome, InstallError> {
        if Self::is_installed(install_dir) {
            debug!("Server {} already installed at {}", version, install_dir.display());
            return Ok(InstallOutcome::AlreadyInstalled);
        }

        let package_id = platform.package_id()?;

        if install_dir.exists() {
            warn!(
                "Removing incomplete server install at {}",
                install_dir.display()
            );
            tokio::fs::remove_dir_all(install_dir).await?;
        }
        tokio::fs::create_dir_all(install_dir).await?;
        tokio::fs::write(install_dir.join(INSTALL_BEGIN), b"").await?;

        info!(
            "Installing server {} ({}) into {}",
            version,
            package_id,
            install_dir.display()
        );
        let start = Instant::now();

        match self.install_into(version, platform, install_dir).await {
            Ok(()) => {
                crate::log_timing!(Level::INFO, "server install", start.elapsed());
                Ok(InstallOutcome::Installed {
                    version: version.to_string(),
                    install_dir: install_dir.to_path_buf(),
                })
            }
            Err(e) => {
                warn!("Server install failed: {}", e);
                if let Err(cleanup) = tokio::fs::remove_dir_all(install_dir).await {
                    warn!(
                        "Failed to remove partial install {}: {}",
                        install_dir.display(),
                        cleanup
                    );
                }
                Err(e)
            }
        }
    }

    /// Delete any existing install of `version` and install it again
    pub async fn force_reinstall(
        &self,
        version: &str,
        platform: &PlatformInformation,
        install_dir: &Path,
    ) -> Result<InstallOutcome, InstallError> {
        if install_dir.exists() {
            info!("Removing server install at {} for re-download", install_dir.display());
            tokio::fs::remove_dir_all(install_dir).await?;
        }
        self.ensure_installed(version, platform, install_dir).await
    }

    async fn install_into(
        &self,
        version: &str,
        platform: &PlatformInformation,
        install_dir: &Path,
    ) -> Result<(), InstallError> {
        let staging = staging_dir(install_dir);
        tokio::fs::create_dir_all(&staging).await?;

        let result = self.stage_and_extract(version, platform, &staging, install_dir).await;

        if let Err(e) = tokio::fs::remove_dir_all(&staging).await {
            debug!("Failed to remove staging dir {}: {}", staging.display(), e);
        }
        result?;

        let lock = install_dir.join(INSTALL_LOCK);
        let lock_tmp = install_dir.join(format!("{INSTALL_LOCK}.tmp"));
        tokio::fs::write(&lock_tmp, b"").await?;
        tokio::fs::rename(&lock_tmp, &lock).await?;
        tokio::fs::remove_file(install_dir.join(INSTALL_BEGIN)).await?;
        Ok(())
    }

    async fn stage_and_extract(
        &self,
        version: &str,
        platform: &PlatformInformation,
        staging: &Path,
        install_dir: &Path,
    ) -> Result<(), InstallError> {
        let package = self.source.download(version, platform, staging).await?;

        match package.sha256 {
            Some(expected) => {
                let payload = package.payload.clone();
                tokio::task::spawn_blocking(move || integrity::verify(&payload, &expected))
                    .await
                    .map_err(std::io::Error::other)??;
                debug!("Integrity check passed for {}", package.payload.display());
            }
            None => warn!(
                "No digest published for server {}; skipping integrity check",
                version
            ),
        }

        self.extractor.extract(&package.payload, install_dir).await
    }
}

/// Unique sibling of the install directory
fn staging_dir(install_dir: &Path) -> PathBuf {
    let name = format!(".staging-{}", Uuid::new_v4());
    match install_dir.parent() {
        Some(parent) => parent.join(name),
        None => std::env::temp_dir().join(name),
    }
}
