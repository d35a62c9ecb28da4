//! Resolve-then-install orchestration run before each launch

use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::ClientOptions;
use crate::install::error::InstallError;
use crate::install::installer::{DependencyInstaller, InstallOutcome};
use crate::install::platform::PlatformInformation;
use crate::install::resolver::{ResolvedServer, VersionResolver};
use crate::install::source::{DirectoryExtractor, MirrorPackageSource, OfflineSource, PackageSource};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Provisioned {
    pub server: ResolvedServer,
    /// `None` when the server needed no install step
    pub install: Option<InstallOutcome>,
}

pub struct Provisioner {
    resolver: VersionResolver,
    installer: DependencyInstaller,
    platform: PlatformInformation,
}

impl Provisioner {
    pub fn new(
        resolver: VersionResolver,
        installer: DependencyInstaller,
        platform: PlatformInformation,
    ) -> Self {
        Self {
            resolver,
            installer,
            platform,
        }
    }

    /// Provisioner for this host, fetching from `updateSource` when set
    pub fn from_options(options: &ClientOptions) -> Self {
        let platform = PlatformInformation::current();
        let source: Arc<dyn PackageSource> = match &options.update_source {
            Some(root) => Arc::new(MirrorPackageSource::new(root)),
            None => Arc::new(OfflineSource),
        };

        Self::new(
            VersionResolver::new(options, &platform),
            DependencyInstaller::new(source, Arc::new(DirectoryExtractor)),
            platform,
        )
    }

    pub fn platform(&self) -> &PlatformInformation {
        &self.platform
    }

    /// Resolve `spec` without installing anything
    pub async fn resolve(&self, spec: &str) -> Result<ResolvedServer, InstallError> {
        self.resolver.resolve(spec, self.installer.source()).await
    }

    /// Resolve `spec` and install the resulting version if needed
    ///
    /// `force` deletes an existing install first.
    pub async fn provision(&self, spec: &str, force: bool) -> Result<Provisioned, InstallError> {
        let server = self.resolve(spec).await?;

        let (Some(version), Some(install_dir)) =
            (server.version.as_ref().map(ToString::to_string), server.install_dir.clone())
        else {
            return Ok(Provisioned {
                server,
                install: None,
            });
        };

        let outcome = if force {
            self.installer
                .force_reinstall(&version, &self.platform, &install_dir)
                .await
        } else {
            self.installer
                .ensure_installed(&version, &self.platform, &install_dir)
                .await
        };

        match outcome {
            Ok(outcome) => {
                info!("Server {} ready at {}", version, install_dir.display());
                Ok(Provisioned {
                    install: Some(outcome),
                    server,
                })
            }
            Err(e) if e.is_recoverable() => {
                warn!("Server {} could not be installed and will be retried: {}", version, e);
                if e.suggests_force_reinstall() {
                    warn!("Run `install --force` to download server {} again", version);
                }
                Err(e)
            }
            Err(e) => Err(e),
        }
    }
}
