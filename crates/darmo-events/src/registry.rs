use crate::subscriber::HandlerDescriptor;
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Identity of a registered subscriber: the address of its `Arc` allocation.
///
/// The registry keeps a `Weak` to every subscriber, so the allocation (and
/// therefore the id) cannot be reused while the entry exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(usize);

impl SubscriberId {
    pub fn of<S: ?Sized>(subscriber: &Arc<S>) -> Self {
        Self(Arc::as_ptr(subscriber) as *const () as usize)
    }
}

/// The handlers of one subscriber, as stored by the bus.
pub(crate) struct Registration {
    id: SubscriberId,
    subscriber: &'static str,
    handle: Weak<dyn Any + Send + Sync>,
    handlers: Vec<HandlerDescriptor>,
    active: AtomicBool,
}

impl Registration {
    pub(crate) fn new<S: Any + Send + Sync>(
        subscriber: &Arc<S>,
        name: &'static str,
        handlers: Vec<HandlerDescriptor>,
    ) -> Self {
        let handle: Weak<S> = Arc::downgrade(subscriber);
        let handle: Weak<dyn Any + Send + Sync> = handle;
        Self {
            id: SubscriberId::of(subscriber),
            subscriber: name,
            handle,
            handlers,
            active: AtomicBool::new(true),
        }
    }

    pub(crate) fn id(&self) -> SubscriberId {
        self.id
    }

    pub(crate) fn subscriber(&self) -> &'static str {
        self.subscriber
    }

    pub(crate) fn handlers(&self) -> &[HandlerDescriptor] {
        &self.handlers
    }

    /// False once the registration was replaced or removed.
    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn is_dropped(&self) -> bool {
        self.handle.strong_count() == 0
    }

    pub(crate) fn upgrade(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.handle.upgrade()
    }

    fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }
}

/// Registrations in the order their subscribers were first registered.
///
/// Methods that take entries out hand them back to the caller. Dropping an
/// entry drops its handler closures, which must not happen while the bus
/// holds its registry lock.
#[derive(Default)]
pub(crate) struct Registry {
    entries: Vec<Arc<Registration>>,
}

impl Registry {
    /// Stores `registration`, replacing any previous entry for the same
    /// subscriber in place. Returns the replaced entry.
    pub(crate) fn insert(&mut self, registration: Registration) -> Option<Arc<Registration>> {
        let registration = Arc::new(registration);
        match self
            .entries
            .iter_mut()
            .find(|entry| entry.id() == registration.id())
        {
            Some(slot) => {
                slot.deactivate();
                Some(std::mem::replace(slot, registration))
            }
            None => {
                self.entries.push(registration);
                None
            }
        }
    }

    pub(crate) fn remove(&mut self, id: SubscriberId) -> Option<Arc<Registration>> {
        let idx = self.entries.iter().position(|entry| entry.id() == id)?;
        let removed = self.entries.remove(idx);
        removed.deactivate();
        Some(removed)
    }

    pub(crate) fn get(&self, id: SubscriberId) -> Option<&Arc<Registration>> {
        self.entries.iter().find(|entry| entry.id() == id)
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<Registration>> {
        self.entries.clone()
    }

    /// Takes out entries whose subscriber no longer exists.
    pub(crate) fn prune_dropped(&mut self) -> Vec<Arc<Registration>> {
        let (dropped, live): (Vec<_>, Vec<_>) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|entry| entry.is_dropped());
        self.entries = live;
        for entry in &dropped {
            entry.deactivate();
        }
        dropped
    }

    pub(crate) fn clear(&mut self) -> Vec<Arc<Registration>> {
        let removed = std::mem::take(&mut self.entries);
        for entry in &removed {
            entry.deactivate();
        }
        removed
    }

    /// Live subscribers; entries awaiting pruning are not counted.
    pub(crate) fn len(&self) -> usize {
        self.live().count()
    }

    pub(crate) fn handler_count(&self) -> usize {
        self.live().map(|entry| entry.handlers().len()).sum()
    }

    fn live(&self) -> impl Iterator<Item = &Arc<Registration>> {
        self.entries.iter().filter(|entry| !entry.is_dropped())
    }
}
