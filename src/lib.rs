//! Editor-side client for OmniSharp-style analysis servers
//!
//! - **install**: resolve a version specifier and provision the package
//! - **server**: spawn, supervise and restart the server process
//! - **dispatch**: correlate requests with responses and fan out events
//! - **diagnostics**: decide when to validate and publish the results
//! - **session**: ties the above to editor document notifications

pub mod config;
pub mod diagnostics;
pub mod dispatch;
pub mod install;
pub mod io;
pub mod logging;
pub mod protocol;
pub mod server;
pub mod session;

#[cfg(test)]
mod test_utils;

pub use config::ClientOptions;
pub use session::{ClientSession, SessionError};
