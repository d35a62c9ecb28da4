//! Server version specifier resolution
//!
//! A specifier is empty (bundled default), an absolute path to an
//! executable, `latest`, or a semantic version.

use semver::Version;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::config::ClientOptions;
use crate::install::error::InstallError;
use crate::install::platform::PlatformInformation;
use crate::install::source::PackageSource;

pub const LATEST: &str = "latest";

/// How the server binary is started
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum LaunchDescriptor {
    /// Platform executable or launcher script
    #[serde(rename_all = "camelCase")]
    Native {
        executable: PathBuf,
        /// Framework build run under mono when the launcher is missing
        mono_fallback: Option<PathBuf>,
    },
    /// Assembly run by the dotnet host
    RuntimeHosted { dll: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedServer {
    pub version: Option<Version>,
    /// Set when the version must be provisioned before launch
    pub install_dir: Option<PathBuf>,
    pub launch: LaunchDescriptor,
}

impl ResolvedServer {
    pub fn requires_install(&self) -> bool {
        self.install_dir.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct VersionResolver {
    default_version: String,
    install_root: PathBuf,
    bundled_root: PathBuf,
    runtime_suffix: Option<String>,
    windows: bool,
}

impl VersionResolver {
    pub fn new(options: &ClientOptions, platform: &PlatformInformation) -> Self {
        Self {
            default_version: options.default_version.clone(),
            install_root: options.install_root.clone(),
            bundled_root: options.bundled_root.clone(),
            runtime_suffix: options
                .use_modern_net
                .then(|| options.runtime_suffix.clone()),
            windows: platform.is_windows(),
        }
    }

    pub async fn resolve(
        &self,
        spec: &str,
        source: &dyn PackageSource,
    ) -> Result<ResolvedServer, InstallError> {
        let spec = spec.trim();

        if spec.is_empty() {
            let base = self.version_dir(&self.bundled_root, &self.default_version);
            debug!("Using bundled server at {}", base.display());
            return Ok(ResolvedServer {
                version: Version::parse(&self.default_version).ok(),
                install_dir: None,
                launch: self.launch_for(&base),
            });
        }

        let path = Path::new(spec);
        if path.is_absolute() {
            if !path.exists() {
                return Err(InstallError::PathNotFound(path.to_path_buf()));
            }
            return Ok(ResolvedServer {
                version: None,
                install_dir: None,
                launch: LaunchDescriptor::Native {
                    executable: path.to_path_buf(),
                    mono_fallback: None,
                },
            });
        }

        if spec == LATEST {
            let latest = source.latest_version().await?;
            info!("Latest published server version is {}", latest.trim());
            return self.resolve_version(latest.trim());
        }

        self.resolve_version(spec)
    }

    fn resolve_version(&self, version: &str) -> Result<ResolvedServer, InstallError> {
        let parsed =
            Version::parse(version).map_err(|_| InstallError::InvalidVersion(version.to_string()))?;
        let install_dir = self.version_dir(&self.install_root, &parsed.to_string());

        Ok(ResolvedServer {
            version: Some(parsed),
            launch: self.launch_for(&install_dir),
            install_dir: Some(install_dir),
        })
    }

    /// `{root}/{version}`, with `-{suffix}` in runtime-hosted mode
    pub fn version_dir(&self, root: &Path, version: &str) -> PathBuf {
        match &self.runtime_suffix {
            Some(suffix) => root.join(format!("{version}-{suffix}")),
            None => root.join(version),
        }
    }

    pub fn launch_for(&self, base: &Path) -> LaunchDescriptor {
        if self.runtime_suffix.is_some() {
            LaunchDescriptor::RuntimeHosted {
                dll: base.join("OmniSharp.dll"),
            }
        } else if self.windows {
            LaunchDescriptor::Native {
                executable: base.join("OmniSharp.exe"),
                mono_fallback: None,
            }
        } else {
            LaunchDescriptor::Native {
                executable: base.join("run"),
                mono_fallback: Some(base.join("omnisharp").join("OmniSharp.exe")),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::install::platform::{Architecture, OperatingSystem};
    use crate::install::source::{MockPackageSource, OfflineSource};
    use tempfile::TempDir;

    fn linux() -> PlatformInformation {
        PlatformInformation::new(OperatingSystem::Linux, Architecture::X86_64)
    }

    fn options(modern: bool) -> ClientOptions {
        ClientOptions {
            install_root: PathBuf::from("/data/.omnisharp"),
            bundled_root: PathBuf::from("/ext/.omnisharp"),
            use_modern_net: modern,
            ..ClientOptions::default()
        }
    }

    #[tokio::test]
    async fn test_empty_spec_uses_bundled_default() {
        let resolver = VersionResolver::new(&options(false), &linux());
        let resolved = resolver.resolve("", &OfflineSource).await.unwrap();

        let base = PathBuf::from("/ext/.omnisharp").join(crate::config::DEFAULT_SERVER_VERSION);
        assert!(!resolved.requires_install());
        assert_eq!(
            resolved.launch,
            LaunchDescriptor::Native {
                executable: base.join("run"),
                mono_fallback: Some(base.join("omnisharp/OmniSharp.exe")),
            }
        );
    }

    #[tokio::test]
    async fn test_modern_mode_appends_runtime_suffix() {
        let resolver = VersionResolver::new(&options(true), &linux());
        let resolved = resolver.resolve("1.39.11", &OfflineSource).await.unwrap();

        let dir = PathBuf::from("/data/.omnisharp/1.39.11-net6.0");
        assert_eq!(resolved.install_dir.as_deref(), Some(dir.as_path()));
        assert_eq!(
            resolved.launch,
            LaunchDescriptor::RuntimeHosted {
                dll: dir.join("OmniSharp.dll")
            }
        );
    }

    #[tokio::test]
    async fn test_windows_framework_launch() {
        let windows = PlatformInformation::new(OperatingSystem::Windows, Architecture::X86_64);
        let resolver = VersionResolver::new(&options(false), &windows);
        let resolved = resolver.resolve("1.39.11", &OfflineSource).await.unwrap();

        assert!(matches!(
            resolved.launch,
            LaunchDescriptor::Native { ref executable, mono_fallback: None }
                if executable.ends_with("1.39.11/OmniSharp.exe")
        ));
    }

    #[tokio::test]
    async fn test_absolute_path() {
        let dir = TempDir::new().unwrap();
        let server = dir.path().join("OmniSharp");
        std::fs::write(&server, b"").unwrap();

        let resolver = VersionResolver::new(&options(false), &linux());
        let resolved = resolver
            .resolve(server.to_str().unwrap(), &OfflineSource)
            .await
            .unwrap();

        assert!(!resolved.requires_install());
        assert_eq!(resolved.version, None);
        assert_eq!(
            resolved.launch,
            LaunchDescriptor::Native {
                executable: server,
                mono_fallback: None
            }
        );
    }

    #[tokio::test]
    async fn test_missing_absolute_path() {
        let resolver = VersionResolver::new(&options(false), &linux());
        assert!(matches!(
            resolver.resolve("/nonexistent/OmniSharp", &OfflineSource).await,
            Err(InstallError::PathNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_latest_asks_source() {
        let mut source = MockPackageSource::new();
        source
            .expect_latest_version()
            .times(1)
            .returning(|| Ok("1.40.0\n".to_string()));

        let resolver = VersionResolver::new(&options(false), &linux());
        let resolved = resolver.resolve(LATEST, &source).await.unwrap();

        assert_eq!(resolved.version, Some(Version::new(1, 40, 0)));
        assert_eq!(
            resolved.install_dir,
            Some(PathBuf::from("/data/.omnisharp/1.40.0"))
        );
    }

    #[tokio::test]
    async fn test_invalid_version() {
        let resolver = VersionResolver::new(&options(false), &linux());
        assert!(matches!(
            resolver.resolve("not-a-version", &OfflineSource).await,
            Err(InstallError::InvalidVersion(v)) if v == "not-a-version"
        ));
    }

    #[tokio::test]
    async fn test_latest_with_bad_published_version() {
        let mut source = MockPackageSource::new();
        source
            .expect_latest_version()
            .returning(|| Ok("garbage".to_string()));

        let resolver = VersionResolver::new(&options(false), &linux());
        assert!(matches!(
            resolver.resolve(LATEST, &source).await,
            Err(InstallError::InvalidVersion(_))
        ));
    }
}
