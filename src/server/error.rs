//! Server lifecycle errors

use std::time::Duration;

use crate::dispatch::DispatchError;
use crate::io::ProcessError;
use crate::server::state::ServerState;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Operation not allowed in the current lifecycle state
    #[error("Cannot {operation} while server is {current}")]
    InvalidState {
        operation: &'static str,
        current: ServerState,
    },

    #[error("Server exited before it was ready (exit code {code:?})")]
    ExitedBeforeReady { code: Option<i32> },

    #[error("Server did not become ready within {0:?}")]
    StartupTimeout(Duration),

    #[error("Server connection lost")]
    ConnectionLost,

    #[error("Process error: {0}")]
    Process(#[from] ProcessError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    /// Restart without a target before any start
    #[error("No launch target available")]
    NoLaunchTarget,

    #[error("Server executable not found: {0}")]
    ExecutableNotFound(String),
}

impl ServerError {
    pub(crate) fn invalid_state(operation: &'static str, current: ServerState) -> Self {
        ServerError::InvalidState { operation, current }
    }
}
