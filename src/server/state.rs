//! Server lifecycle states

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerState {
    Stopped,
    /// Process spawned, waiting for the server to signal readiness
    Starting,
    Started,
    Restarting,
    Stopping,
    /// Exited unexpectedly or never became ready; left by stop or restart
    Crashed,
}

impl ServerState {
    /// Whether the lifecycle permits moving from `self` to `next`
    ///
    /// `Stopping` is reachable from everywhere. A failed spawn returns
    /// `Starting` to `Stopped` since nothing ran.
    pub fn can_transition_to(self, next: ServerState) -> bool {
        use ServerState::*;

        match (self, next) {
            (_, Stopping) => true,
            (Stopped, Starting) => true,
            (Starting, Started | Crashed | Stopped | Restarting) => true,
            (Started, Restarting | Crashed) => true,
            (Crashed, Restarting | Stopped) => true,
            (Restarting, Starting) => true,
            (Stopping, Stopped) => true,
            _ => false,
        }
    }

    pub fn is_running(self) -> bool {
        self == ServerState::Started
    }

    /// A process may exist in this state
    pub fn has_connection(self) -> bool {
        matches!(self, ServerState::Starting | ServerState::Started)
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServerState::Stopped => "stopped",
            ServerState::Starting => "starting",
            ServerState::Started => "started",
            ServerState::Restarting => "restarting",
            ServerState::Stopping => "stopping",
            ServerState::Crashed => "crashed",
        };
        f.write_str(name)
    }
}
