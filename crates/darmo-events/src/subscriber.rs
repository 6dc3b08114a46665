use crate::error::{ConfigurationError, ConfigurationIssue};
use crate::event::{short_type_name, Event, EventKind};
use std::any::Any;
use std::collections::HashSet;
use std::marker::PhantomData;

/// What a handler returns. Errors are surfaced to the publisher as
/// [`InvocationError`](crate::InvocationError).
pub type HandlerResult = anyhow::Result<()>;

type ErasedHandler = Box<dyn Fn(&dyn Any, &mut dyn Any) -> HandlerResult + Send + Sync>;

/// An object that handles events.
///
/// `subscriptions` lists the handler operations; it is called once per
/// registration.
///
/// ```
/// use darmo_events::{impl_event, Cancellation, HandlerResult, HandlerSet, Subscriber};
///
/// struct Saved {
///     state: Cancellation,
/// }
/// impl_event!(Saved, state = state);
///
/// struct Autosave;
///
/// impl Autosave {
///     fn on_saved(&self, _event: &mut Saved) -> HandlerResult {
///         Ok(())
///     }
/// }
///
/// impl Subscriber for Autosave {
///     fn subscriptions(&self, handlers: &mut HandlerSet<Self>) {
///         handlers.on("on_saved", Self::on_saved);
///     }
/// }
/// ```
pub trait Subscriber: Send + Sync + 'static {
    fn subscriptions(&self, handlers: &mut HandlerSet<Self>);
}

/// A handler bound to one subscriber type, tagged with the event variant it
/// accepts.
pub struct HandlerDescriptor {
    operation: String,
    accepts: EventKind,
    invoke: ErasedHandler,
}

impl HandlerDescriptor {
    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn accepts(&self) -> EventKind {
        self.accepts
    }

    /// Runs the handler. `event` must already be viewed as `self.accepts()`.
    pub(crate) fn call(&self, subscriber: &dyn Any, event: &mut dyn Any) -> HandlerResult {
        (self.invoke)(subscriber, event)
    }
}

impl std::fmt::Debug for HandlerDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerDescriptor")
            .field("operation", &self.operation)
            .field("accepts", &self.accepts.name())
            .finish()
    }
}

/// Collects the handler operations of one subscriber.
///
/// Problems are recorded rather than reported immediately so that
/// [`HandlerSet::finish`] can reject the whole set at once.
pub struct HandlerSet<S: ?Sized> {
    subscriber: &'static str,
    descriptors: Vec<HandlerDescriptor>,
    seen: HashSet<String>,
    error: Option<ConfigurationError>,
    _subscriber: PhantomData<fn(&S)>,
}

impl<S: Send + Sync + 'static> HandlerSet<S> {
    pub fn new() -> Self {
        Self {
            subscriber: short_type_name(std::any::type_name::<S>()),
            descriptors: Vec::new(),
            seen: HashSet::new(),
            error: None,
            _subscriber: PhantomData,
        }
    }

    /// Marks `handler` as the operation `operation`, receiving events of
    /// variant `V` and every variant that extends it.
    pub fn on<V, F>(&mut self, operation: impl Into<String>, handler: F) -> &mut Self
    where
        V: Event,
        F: Fn(&S, &mut V) -> HandlerResult + Send + Sync + 'static,
    {
        let operation = operation.into();
        if self.error.is_some() {
            return self;
        }

        let issue = if operation.trim().is_empty() {
            Some(ConfigurationIssue::EmptyName)
        } else if !self.seen.insert(operation.clone()) {
            Some(ConfigurationIssue::DuplicateOperation)
        } else {
            None
        };
        if let Some(reason) = issue {
            self.error = Some(ConfigurationError {
                subscriber: self.subscriber,
                operation,
                reason,
            });
            return self;
        }

        let accepts = EventKind::of::<V>();
        let invoke: ErasedHandler = Box::new(move |subscriber, event| {
            let subscriber = subscriber.downcast_ref::<S>().ok_or_else(|| {
                anyhow::anyhow!("handler bound to a different subscriber type")
            })?;
            let event = event
                .downcast_mut::<V>()
                .ok_or_else(|| anyhow::anyhow!("handler received a non-{} event", accepts.name()))?;
            handler(subscriber, event)
        });

        self.descriptors.push(HandlerDescriptor {
            operation,
            accepts,
            invoke,
        });
        self
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Returns the descriptors in declaration order, or the first problem found.
    pub fn finish(self) -> Result<Vec<HandlerDescriptor>, ConfigurationError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.descriptors),
        }
    }
}

impl<S: Send + Sync + 'static> Default for HandlerSet<S> {
    fn default() -> Self {
        Self::new()
    }
}

/// Extracts the handler descriptors of `candidate`. Has no side effects.
pub fn discover<S: Subscriber>(candidate: &S) -> Result<Vec<HandlerDescriptor>, ConfigurationError> {
    let mut handlers = HandlerSet::new();
    candidate.subscriptions(&mut handlers);
    handlers.finish()
}
