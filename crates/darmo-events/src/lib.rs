//! In-process, synchronous event bus.
//!
//! Subscribers declare handler operations per event variant; publishers hand
//! an event to [`EventBus::dispatch`] and inspect its cancellation state once
//! every matching handler has run.

mod bus;
mod config;
mod error;
mod event;
mod registry;
mod subscriber;

pub use bus::{BusStats, Delivery, EventBus};
pub use config::{BusConfig, FailurePolicy};
pub use error::{
    CancellationError, ConfigurationError, ConfigurationIssue, DispatchError, InvocationError,
};
pub use event::{CancelState, Cancellation, Event, EventKind};
pub use registry::SubscriberId;
pub use subscriber::{discover, HandlerDescriptor, HandlerResult, HandlerSet, Subscriber};
