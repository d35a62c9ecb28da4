//! Analysis server lifecycle
//!
//! Launch command construction, process supervision and the lifecycle
//! state machine.

pub mod error;
pub mod launch;
pub mod state;
pub mod stderr_log;
pub mod supervisor;

pub use error::ServerError;
pub use launch::LaunchTarget;
pub use state::ServerState;
pub use supervisor::{ServerSupervisor, SupervisorConfig};
