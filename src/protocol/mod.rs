//! Wire protocol: line framing, envelopes, events and request payloads

pub mod envelope;
pub mod events;
pub mod framing;
pub mod requests;

pub use envelope::{CancelEnvelope, Envelope, EventEnvelope, RequestEnvelope, ResponseEnvelope};
pub use events::{
    BackgroundDiagnosticStatus, BackgroundDiagnosticStatusKind, EventKind, LogMessage,
    ProjectInformation, ServerEvent, UnresolvedDependencies,
};
pub use framing::{FramingError, LineFraming};
pub use requests::{CodeCheckRequest, QuickFix, QuickFixResponse, ServerRequest};
