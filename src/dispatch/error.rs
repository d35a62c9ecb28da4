//! Request dispatch errors

/// Outcome of a request that did not produce a response body
#[derive(Debug, Clone, thiserror::Error)]
pub enum DispatchError {
    #[error("Server disconnected")]
    ServerDisconnected,

    #[error("Request cancelled")]
    Cancelled,

    #[error("Request {command} timed out after {timeout_ms} ms")]
    Timeout { command: String, timeout_ms: u128 },

    #[error("Server rejected {command}: {message}")]
    Server { command: String, message: String },

    #[error("Failed to serialize {command} arguments: {message}")]
    Serialization { command: String, message: String },

    #[error("Failed to deserialize {command} response: {message}")]
    Deserialization { command: String, message: String },
}

impl DispatchError {
    /// Cancellation is an expected outcome, not a failure to report
    pub fn is_cancelled(&self) -> bool {
        matches!(self, DispatchError::Cancelled)
    }

    /// Worth retrying on the same connection
    pub fn is_recoverable(&self) -> bool {
        matches!(self, DispatchError::Timeout { .. })
    }

    pub(crate) fn serialization(command: &str, err: serde_json::Error) -> Self {
        DispatchError::Serialization {
            command: command.to_string(),
            message: err.to_string(),
        }
    }

    pub(crate) fn deserialization(command: &str, err: serde_json::Error) -> Self {
        DispatchError::Deserialization {
            command: command.to_string(),
            message: err.to_string(),
        }
    }
}
