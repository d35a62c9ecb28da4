//! Request dispatch: sequence-number correlation, cancellation and the
//! event registry

pub mod dispatcher;
pub mod error;
pub mod event_bus;

pub use dispatcher::{ConnectionStatus, DEFAULT_REQUEST_TIMEOUT, RequestDispatcher};
pub use error::DispatchError;
pub use event_bus::{EventBus, Subscription};
