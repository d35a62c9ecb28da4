//! Client configuration
//!
//! Options are read from an optional camelCase JSON file; every field has
//! a default so a partial file (or none at all) is valid.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ============================================================================
// Defaults
// ============================================================================

/// Server version used when no specifier is configured
pub const DEFAULT_SERVER_VERSION: &str = "1.39.11";

/// Runtime folder suffix for runtime-hosted builds
pub const DEFAULT_RUNTIME_SUFFIX: &str = "net6.0";

/// Above this many tracked source files only open documents are analyzed
pub const DEFAULT_MAX_PROJECT_FILE_COUNT: i64 = 1000;

pub const DEFAULT_DOCUMENT_DEBOUNCE_MS: u64 = 750;
pub const DEFAULT_WORKSPACE_DEBOUNCE_MS: u64 = 3000;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

/// Large solutions can take a while before the server announces itself
pub const DEFAULT_STARTUP_TIMEOUT_MS: u64 = 60_000;

/// Grace period between SIGTERM and SIGKILL
pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 2_000;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read configuration {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration file {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field,
            reason: reason.into(),
        }
    }
}

// ============================================================================
// Options
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientOptions {
    /// Server specifier: empty, an absolute path, "latest" or a version
    pub path: String,
    pub default_version: String,
    /// Versions installed on demand live here
    pub install_root: PathBuf,
    /// The default version ships here
    pub bundled_root: PathBuf,
    /// Launch the runtime-hosted build through `dotnet`
    pub use_modern_net: bool,
    pub runtime_suffix: String,
    pub dotnet_path: PathBuf,
    pub mono_path: PathBuf,
    /// Local package mirror used to provision versions
    pub update_source: Option<PathBuf>,

    /// `<= 0` disables the limit
    pub max_project_file_count_for_diagnostic_analysis: i64,
    pub enable_roslyn_analyzers: bool,
    pub suppress_hidden_diagnostics: bool,

    pub document_debounce_ms: u64,
    pub workspace_debounce_ms: u64,
    /// 0 disables the per-request timeout
    pub request_timeout_ms: u64,
    pub startup_timeout_ms: u64,
    pub shutdown_timeout_ms: u64,

    /// Server-side log level passed on the command line
    pub logging_level: String,
    pub extra_args: Vec<String>,
    /// Server stderr is appended here when set
    pub server_log_file: Option<PathBuf>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            path: String::new(),
            default_version: DEFAULT_SERVER_VERSION.to_string(),
            install_root: PathBuf::from(".omnisharp"),
            bundled_root: PathBuf::from(".omnisharp"),
            use_modern_net: false,
            runtime_suffix: DEFAULT_RUNTIME_SUFFIX.to_string(),
            dotnet_path: PathBuf::from("dotnet"),
            mono_path: PathBuf::from("mono"),
            update_source: None,
            max_project_file_count_for_diagnostic_analysis: DEFAULT_MAX_PROJECT_FILE_COUNT,
            enable_roslyn_analyzers: false,
            suppress_hidden_diagnostics: true,
            document_debounce_ms: DEFAULT_DOCUMENT_DEBOUNCE_MS,
            workspace_debounce_ms: DEFAULT_WORKSPACE_DEBOUNCE_MS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            startup_timeout_ms: DEFAULT_STARTUP_TIMEOUT_MS,
            shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT_MS,
            logging_level: "information".to_string(),
            extra_args: Vec::new(),
            server_log_file: None,
        }
    }
}

impl ClientOptions {
    /// Load options from `path`, or defaults when no file is given
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let options: Self = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        options.validate()?;
        Ok(options)
    }

    /// Command-line values win over the file
    pub fn with_overrides(mut self, server_path: Option<String>) -> Self {
        if let Some(server_path) = server_path {
            self.path = server_path;
        }
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_version.trim().is_empty() {
            return Err(ConfigError::invalid("defaultVersion", "must not be empty"));
        }
        if self.document_debounce_ms == 0 {
            return Err(ConfigError::invalid(
                "documentDebounceMs",
                "must be greater than zero",
            ));
        }
        if self.workspace_debounce_ms == 0 {
            return Err(ConfigError::invalid(
                "workspaceDebounceMs",
                "must be greater than zero",
            ));
        }
        if self.startup_timeout_ms == 0 {
            return Err(ConfigError::invalid(
                "startupTimeoutMs",
                "must be greater than zero",
            ));
        }
        if self.use_modern_net && self.runtime_suffix.trim().is_empty() {
            return Err(ConfigError::invalid(
                "runtimeSuffix",
                "required when useModernNet is set",
            ));
        }
        Ok(())
    }

    pub fn document_debounce(&self) -> Duration {
        Duration::from_millis(self.document_debounce_ms)
    }

    pub fn workspace_debounce(&self) -> Duration {
        Duration::from_millis(self.workspace_debounce_ms)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_ms > 0).then(|| Duration::from_millis(self.request_timeout_ms))
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}
