use std::fmt;

/// Why a subscriber's handler set was rejected at registration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigurationIssue {
    EmptyName,
    DuplicateOperation,
}

impl fmt::Display for ConfigurationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyName => f.write_str("operation name is empty"),
            Self::DuplicateOperation => f.write_str("operation is declared more than once"),
        }
    }
}

/// A subscriber declared a handler that cannot be registered.
///
/// Registration is all-or-nothing: when this error is returned, nothing from
/// the offending subscriber was stored.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid handler '{operation}' on {subscriber}: {reason}")]
pub struct ConfigurationError {
    pub subscriber: &'static str,
    pub operation: String,
    pub reason: ConfigurationIssue,
}

/// `cancel()` was called on an event that was not constructed as cancellable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot cancel non-cancellable event {event}")]
pub struct CancellationError {
    pub event: &'static str,
}

/// A handler returned an error while an event was being delivered to it.
#[derive(Debug, thiserror::Error)]
#[error("handler '{operation}' on {subscriber} failed while handling {event}")]
pub struct InvocationError {
    pub subscriber: &'static str,
    pub operation: String,
    pub event: &'static str,
    #[source]
    pub source: anyhow::Error,
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Delivery stopped at the first failing handler.
    #[error("dispatch aborted: {0}")]
    Aborted(#[from] InvocationError),

    /// Every matching handler ran; these are the ones that failed, in call order.
    #[error("{} handler(s) failed during dispatch", .0.len())]
    Failed(Vec<InvocationError>),
}

impl DispatchError {
    pub fn failures(&self) -> &[InvocationError] {
        match self {
            Self::Aborted(err) => std::slice::from_ref(err),
            Self::Failed(errs) => errs,
        }
    }
}
