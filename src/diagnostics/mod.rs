//! Diagnostics scheduling and publication

pub mod advisor;
pub mod convert;
pub mod debounce;
pub mod scheduler;
pub mod store;

pub use advisor::{AdvisorPolicy, ServerReadiness};
pub use debounce::{DebounceHandler, DebounceQueue};
pub use scheduler::{
    DiagnosticSource, DiagnosticsScheduler, SchedulerConfig, WorkItem, WorkspaceTrigger,
};
pub use store::{DiagnosticStore, DiagnosticUpdate};
