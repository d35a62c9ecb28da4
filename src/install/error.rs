//! Provisioning errors

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    #[error("The system could not find the specified path: {0}")]
    PathNotFound(PathBuf),

    #[error("Invalid server version - {0}")]
    InvalidVersion(String),

    #[error("Failed to download server {version}: {reason}")]
    DownloadFailure { version: String, reason: String },

    #[error("Integrity check failed for {path}: expected {expected}, got {actual}")]
    IntegrityCheckFailure {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("Unsupported platform: {0}")]
    UnsupportedPlatform(String),

    #[error("Failed to extract {payload}: {reason}")]
    Extraction { payload: PathBuf, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl InstallError {
    /// Download and integrity failures may succeed on a later attempt
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            InstallError::DownloadFailure { .. } | InstallError::IntegrityCheckFailure { .. }
        )
    }

    /// A fresh download replacing the existing install may fix this
    pub fn suggests_force_reinstall(&self) -> bool {
        matches!(self, InstallError::IntegrityCheckFailure { .. })
    }

    pub(crate) fn download(version: &str, reason: impl ToString) -> Self {
        InstallError::DownloadFailure {
            version: version.to_string(),
            reason: reason.to_string(),
        }
    }
}
