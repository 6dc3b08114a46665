use crate::error::CancellationError;
use serde::{Deserialize, Serialize};
use std::any::{Any, TypeId};

/// Where an event is in its cancellation lifecycle.
///
/// A non-cancellable event can never reach `Cancelled`, so the combination
/// "cancelled but not cancellable" has no representation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelState {
    #[default]
    NonCancellable,
    Active,
    Cancelled,
}

/// Cancellation state carried by every event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cancellation {
    state: CancelState,
    /// Runtime variant of the event being dispatched, set by the bus so that
    /// errors raised through a base-variant view name the real event.
    origin: Option<&'static str>,
}

impl Cancellation {
    pub fn new(cancellable: bool) -> Self {
        if cancellable {
            Self::cancellable()
        } else {
            Self::non_cancellable()
        }
    }

    pub fn cancellable() -> Self {
        Self {
            state: CancelState::Active,
            origin: None,
        }
    }

    pub fn non_cancellable() -> Self {
        Self::default()
    }

    pub fn state(&self) -> CancelState {
        self.state
    }

    pub fn is_cancellable(&self) -> bool {
        self.state != CancelState::NonCancellable
    }

    pub fn is_cancelled(&self) -> bool {
        self.state == CancelState::Cancelled
    }

    /// Moves `Active` to `Cancelled`. Cancelling twice is a no-op.
    ///
    /// `event` names the error unless the bus recorded the runtime variant.
    pub fn cancel(&mut self, event: &'static str) -> Result<(), CancellationError> {
        match self.state {
            CancelState::NonCancellable => Err(CancellationError {
                event: self.origin.unwrap_or(event),
            }),
            CancelState::Active | CancelState::Cancelled => {
                self.state = CancelState::Cancelled;
                Ok(())
            }
        }
    }

    pub(crate) fn set_origin(&mut self, event: &'static str) {
        self.origin = Some(event);
    }
}

/// The tag a handler accepts: one concrete event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventKind {
    type_id: TypeId,
    name: &'static str,
}

impl EventKind {
    pub fn of<E: Event>() -> Self {
        Self {
            type_id: TypeId::of::<E>(),
            name: short_type_name(std::any::type_name::<E>()),
        }
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// A notification that can be published on an [`EventBus`](crate::EventBus).
///
/// Variant hierarchies are built by composition: a derived event embeds its
/// base event and forwards [`Event::view_mut`] to it, so handlers written for
/// the base also receive the derived event. [`impl_event!`](crate::impl_event)
/// writes these impls.
pub trait Event: Any {
    fn cancellation(&self) -> &Cancellation;

    fn cancellation_mut(&mut self) -> &mut Cancellation;

    /// Returns this event as the variant identified by `kind`, if it is that
    /// variant or extends it.
    fn view_mut(&mut self, kind: TypeId) -> Option<&mut dyn Any>;

    fn event_name(&self) -> &'static str {
        short_type_name(std::any::type_name::<Self>())
    }

    fn is_cancellable(&self) -> bool {
        self.cancellation().is_cancellable()
    }

    fn is_cancelled(&self) -> bool {
        self.cancellation().is_cancelled()
    }

    fn cancel(&mut self) -> Result<(), CancellationError> {
        let event = self.event_name();
        self.cancellation_mut().cancel(event)
    }
}

/// Implements [`Event`] for a struct.
///
/// ```
/// use darmo_events::{impl_event, Cancellation, Event};
///
/// pub struct AppEvent {
///     state: Cancellation,
/// }
/// impl_event!(AppEvent, state = state);
///
/// pub struct StartEvent {
///     base: AppEvent,
/// }
/// impl_event!(StartEvent, extends = base);
///
/// let mut start = StartEvent { base: AppEvent { state: Cancellation::cancellable() } };
/// start.cancel().unwrap();
/// assert!(start.base.is_cancelled());
/// ```
#[macro_export]
macro_rules! impl_event {
    ($ty:ty, state = $field:ident) => {
        impl $crate::Event for $ty {
            fn cancellation(&self) -> &$crate::Cancellation {
                &self.$field
            }

            fn cancellation_mut(&mut self) -> &mut $crate::Cancellation {
                &mut self.$field
            }

            fn view_mut(
                &mut self,
                kind: ::std::any::TypeId,
            ) -> ::std::option::Option<&mut dyn ::std::any::Any> {
                if kind == ::std::any::TypeId::of::<Self>() {
                    ::std::option::Option::Some(self as &mut dyn ::std::any::Any)
                } else {
                    ::std::option::Option::None
                }
            }
        }
    };
    ($ty:ty, extends = $base:ident) => {
        impl $crate::Event for $ty {
            fn cancellation(&self) -> &$crate::Cancellation {
                $crate::Event::cancellation(&self.$base)
            }

            fn cancellation_mut(&mut self) -> &mut $crate::Cancellation {
                $crate::Event::cancellation_mut(&mut self.$base)
            }

            fn view_mut(
                &mut self,
                kind: ::std::any::TypeId,
            ) -> ::std::option::Option<&mut dyn ::std::any::Any> {
                if kind == ::std::any::TypeId::of::<Self>() {
                    ::std::option::Option::Some(self as &mut dyn ::std::any::Any)
                } else {
                    $crate::Event::view_mut(&mut self.$base, kind)
                }
            }
        }
    };
}

pub(crate) fn short_type_name(full: &'static str) -> &'static str {
    let base = full.split('<').next().unwrap_or(full);
    match base.rfind("::") {
        Some(idx) => &full[idx + 2..],
        None => full,
    }
}
