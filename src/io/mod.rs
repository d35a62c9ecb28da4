//! I/O layer - process management and raw transport
//!
//! - **Transport**: bidirectional text exchange, no framing
//! - **Process**: server process lifecycle with stdio hand-off
//!
//! Nothing here knows the wire protocol; see `protocol` for that.

pub mod process;
pub mod transport;

pub use process::{
    ProcessError, ProcessExitEvent, ProcessExitHandler, ProcessState, ServerProcess,
    StderrMonitor, StopMode,
};
pub use transport::{ChannelPeer, ChannelTransport, StdioTransport, Transport, TransportError};

#[cfg(test)]
pub use transport::MockTransport;
