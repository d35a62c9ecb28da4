//! Host platform detection
//!
//! The server ships one package per operating system and architecture;
//! [`PlatformInformation::package_id`] names the package for this host.

use regex::Regex;
use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::sync::LazyLock;
use tracing::debug;

use crate::install::error::InstallError;

const UNKNOWN: &str = "unknown";

/// `KEY=value` or `KEY="value"`
static RELEASE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^([A-Za-z0-9_]+)=(?:"(.*)"|(.*))$"#).expect("Failed to compile os-release pattern")
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperatingSystem {
    Windows,
    MacOs,
    Linux,
    /// Linux with a musl libc
    LinuxMusl,
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Architecture {
    X86,
    X86_64,
    Arm64,
    Other(String),
}

impl Architecture {
    fn from_target(arch: &str) -> Self {
        match arch {
            "x86" | "i686" | "i386" => Architecture::X86,
            "x86_64" => Architecture::X86_64,
            "aarch64" | "arm64" => Architecture::Arm64,
            other => Architecture::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinuxDistribution {
    pub id: String,
    pub version: String,
    pub id_like: Vec<String>,
}

impl LinuxDistribution {
    /// Parse the contents of an os-release file
    pub fn from_release_info(release_info: &str) -> Self {
        let mut id = None;
        let mut version = None;
        let mut id_like = Vec::new();

        for line in release_info.lines() {
            let Some(captures) = RELEASE_LINE.captures(line.trim()) else {
                continue;
            };
            let value = captures
                .get(2)
                .or_else(|| captures.get(3))
                .map_or("", |m| m.as_str());

            match &captures[1] {
                "ID" => id = Some(value.to_string()),
                "VERSION_ID" => version = Some(value.to_string()),
                "ID_LIKE" => id_like = value.split_whitespace().map(str::to_string).collect(),
                _ => {}
            }
        }

        Self {
            id: id.unwrap_or_else(|| UNKNOWN.to_string()),
            version: version.unwrap_or_else(|| UNKNOWN.to_string()),
            id_like,
        }
    }

    /// Read `/etc/os-release`, falling back to `/usr/lib/os-release`
    pub fn current() -> Option<Self> {
        ["/etc/os-release", "/usr/lib/os-release"]
            .iter()
            .find_map(|path| std::fs::read_to_string(Path::new(path)).ok())
            .map(|contents| Self::from_release_info(&contents))
    }
}

impl fmt::Display for LinuxDistribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.id, self.version)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlatformInformation {
    pub os: OperatingSystem,
    pub architecture: Architecture,
    pub distribution: Option<LinuxDistribution>,
}

impl PlatformInformation {
    pub fn new(os: OperatingSystem, architecture: Architecture) -> Self {
        Self {
            os,
            architecture,
            distribution: None,
        }
    }

    /// Detect the running host
    pub fn current() -> Self {
        let os = match std::env::consts::OS {
            "windows" => OperatingSystem::Windows,
            "macos" => OperatingSystem::MacOs,
            "linux" if cfg!(target_env = "musl") => OperatingSystem::LinuxMusl,
            "linux" => OperatingSystem::Linux,
            other => OperatingSystem::Other(other.to_string()),
        };
        let distribution = match os {
            OperatingSystem::Linux | OperatingSystem::LinuxMusl => LinuxDistribution::current(),
            _ => None,
        };

        let platform = Self {
            os,
            architecture: Architecture::from_target(std::env::consts::ARCH),
            distribution,
        };
        debug!("Detected platform: {}", platform);
        platform
    }

    pub fn is_windows(&self) -> bool {
        self.os == OperatingSystem::Windows
    }

    pub fn is_macos(&self) -> bool {
        self.os == OperatingSystem::MacOs
    }

    pub fn is_linux(&self) -> bool {
        matches!(self.os, OperatingSystem::Linux | OperatingSystem::LinuxMusl)
    }

    pub fn is_supported(&self) -> bool {
        self.package_id().is_ok()
    }

    /// Runtime identifier of the server package for this platform
    pub fn package_id(&self) -> Result<String, InstallError> {
        use Architecture::*;

        let id = match (&self.os, &self.architecture) {
            (OperatingSystem::Windows, X86) => "win-x86",
            (OperatingSystem::Windows, X86_64) => "win-x64",
            (OperatingSystem::Windows, Arm64) => "win-arm64",
            (OperatingSystem::MacOs, _) => "osx",
            (OperatingSystem::Linux, X86) => "linux-x86",
            (OperatingSystem::Linux, X86_64) => "linux-x64",
            (OperatingSystem::Linux, Arm64) => "linux-arm64",
            (OperatingSystem::LinuxMusl, X86) => "linux-musl-x86",
            (OperatingSystem::LinuxMusl, X86_64) => "linux-musl-x64",
            (OperatingSystem::LinuxMusl, Arm64) => "linux-musl-arm64",
            _ => return Err(InstallError::UnsupportedPlatform(self.to_string())),
        };
        Ok(id.to_string())
    }
}

impl fmt::Display for PlatformInformation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let os = match &self.os {
            OperatingSystem::Windows => "win32",
            OperatingSystem::MacOs => "darwin",
            OperatingSystem::Linux => "linux",
            OperatingSystem::LinuxMusl => "linux-musl",
            OperatingSystem::Other(name) => name.as_str(),
        };
        let arch = match &self.architecture {
            Architecture::X86 => "x86",
            Architecture::X86_64 => "x86_64",
            Architecture::Arm64 => "arm64",
            Architecture::Other(name) => name.as_str(),
        };

        write!(f, "{os}, {arch}")?;
        if let Some(distribution) = &self.distribution {
            write!(f, ", {distribution}")?;
        }
        Ok(())
    }
}
