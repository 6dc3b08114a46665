use crate::config::{BusConfig, FailurePolicy};
use crate::error::{ConfigurationError, DispatchError, InvocationError};
use crate::event::{short_type_name, Event};
use crate::registry::{Registration, Registry, SubscriberId};
use crate::subscriber::{discover, HandlerDescriptor, HandlerSet, Subscriber};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Counters since the bus was created
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusStats {
    pub events_dispatched: u64,
    pub handlers_invoked: u64,
    pub handler_failures: u64,
    pub events_cancelled: u64,
}

#[derive(Debug, Default)]
struct Counters {
    events_dispatched: AtomicU64,
    handlers_invoked: AtomicU64,
    handler_failures: AtomicU64,
    events_cancelled: AtomicU64,
}

/// Outcome of a successful dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub handlers_invoked: usize,
    /// Whether the event was cancelled once every handler had run.
    pub cancelled: bool,
}

struct BusInner {
    config: BusConfig,
    registry: RwLock<Registry>,
    counters: Counters,
}

/// Synchronous publish/subscribe bus.
///
/// Handlers run on the thread that calls [`EventBus::dispatch`], in
/// registration order across subscribers and declaration order within one.
/// Cancelling an event does not stop delivery; publishers check
/// [`Event::is_cancelled`] once `dispatch` returns.
///
/// The bus only holds weak references to subscribers. Cloning the bus shares
/// its registry.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_config(BusConfig::default())
    }

    pub fn with_config(config: BusConfig) -> Self {
        Self {
            inner: Arc::new(BusInner {
                config,
                registry: RwLock::new(Registry::default()),
                counters: Counters::default(),
            }),
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    /// Registers every handler `subscriber` declares, replacing its previous
    /// registration. On error the previous registration is left untouched.
    pub fn register<S: Subscriber>(&self, subscriber: &Arc<S>) -> Result<(), ConfigurationError> {
        self.store(subscriber, discover(&**subscriber))
    }

    /// Like [`EventBus::register`], with the handlers supplied by `subscriptions`
    /// instead of a [`Subscriber`] impl.
    pub fn register_with<S, F>(
        &self,
        subscriber: &Arc<S>,
        subscriptions: F,
    ) -> Result<(), ConfigurationError>
    where
        S: Send + Sync + 'static,
        F: FnOnce(&mut HandlerSet<S>),
    {
        let mut handlers = HandlerSet::new();
        subscriptions(&mut handlers);
        self.store(subscriber, handlers.finish())
    }

    fn store<S: Send + Sync + 'static>(
        &self,
        subscriber: &Arc<S>,
        discovered: Result<Vec<HandlerDescriptor>, ConfigurationError>,
    ) -> Result<(), ConfigurationError> {
        let name = short_type_name(std::any::type_name::<S>());
        let descriptors = match discovered {
            Ok(descriptors) => descriptors,
            Err(err) => {
                tracing::warn!(
                    bus = %self.inner.config.name,
                    subscriber = name,
                    operation = %err.operation,
                    "Rejected subscriber: {}",
                    err.reason
                );
                return Err(err);
            }
        };

        let count = descriptors.len();
        let replaced = {
            let mut registry = self.inner.registry.write();
            registry.insert(Registration::new(subscriber, name, descriptors))
        };

        tracing::debug!(
            bus = %self.inner.config.name,
            subscriber = name,
            handlers = count,
            replaced = replaced.is_some(),
            "Registered subscriber"
        );
        // Old handlers may own values whose drop calls back into the bus.
        drop(replaced);
        Ok(())
    }

    /// Removes `subscriber`. Returns false if it was not registered.
    pub fn unregister<S: ?Sized>(&self, subscriber: &Arc<S>) -> bool {
        let removed = {
            let mut registry = self.inner.registry.write();
            registry.remove(SubscriberId::of(subscriber))
        };
        let Some(removed) = removed else {
            return false;
        };
        tracing::debug!(
            bus = %self.inner.config.name,
            subscriber = removed.subscriber(),
            "Unregistered subscriber"
        );
        drop(removed);
        true
    }

    pub fn is_registered<S: ?Sized>(&self, subscriber: &Arc<S>) -> bool {
        self.inner
            .registry
            .read()
            .get(SubscriberId::of(subscriber))
            .is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.registry.read().len()
    }

    pub fn handler_count(&self) -> usize {
        self.inner.registry.read().handler_count()
    }

    pub fn clear(&self) {
        let removed = {
            let mut registry = self.inner.registry.write();
            registry.clear()
        };
        drop(removed);
    }

    pub fn stats(&self) -> BusStats {
        let counters = &self.inner.counters;
        BusStats {
            events_dispatched: counters.events_dispatched.load(Ordering::Relaxed),
            handlers_invoked: counters.handlers_invoked.load(Ordering::Relaxed),
            handler_failures: counters.handler_failures.load(Ordering::Relaxed),
            events_cancelled: counters.events_cancelled.load(Ordering::Relaxed),
        }
    }

    /// Delivers `event` to every handler accepting its variant or one of the
    /// variants it extends.
    ///
    /// The registry lock is released before handlers run, so handlers may
    /// register, unregister or dispatch on this bus. A registration replaced
    /// or removed by a handler receives nothing further.
    pub fn dispatch<E: Event>(&self, event: &mut E) -> Result<Delivery, DispatchError> {
        let event_name = event.event_name();
        event.cancellation_mut().set_origin(event_name);
        let registrations = self.inner.registry.read().snapshot();
        let counters = &self.inner.counters;
        counters.events_dispatched.fetch_add(1, Ordering::Relaxed);

        let mut invoked = 0;
        let mut failures = Vec::new();
        let mut saw_dropped = false;

        for registration in &registrations {
            let Some(subscriber) = registration.upgrade() else {
                saw_dropped = true;
                continue;
            };

            for descriptor in registration.handlers() {
                if !registration.is_active() {
                    break;
                }
                let Some(view) = event.view_mut(descriptor.accepts().type_id()) else {
                    continue;
                };

                tracing::trace!(
                    bus = %self.inner.config.name,
                    subscriber = registration.subscriber(),
                    operation = descriptor.operation(),
                    event = event_name,
                    "Invoking handler"
                );
                invoked += 1;
                counters.handlers_invoked.fetch_add(1, Ordering::Relaxed);

                if let Err(source) = descriptor.call(&*subscriber, view) {
                    counters.handler_failures.fetch_add(1, Ordering::Relaxed);
                    let err = InvocationError {
                        subscriber: registration.subscriber(),
                        operation: descriptor.operation().to_string(),
                        event: event_name,
                        source,
                    };
                    tracing::warn!(
                        bus = %self.inner.config.name,
                        subscriber = err.subscriber,
                        operation = %err.operation,
                        event = event_name,
                        "Handler failed: {:#}",
                        err.source
                    );

                    match self.inner.config.failure_policy {
                        FailurePolicy::Abort => {
                            if saw_dropped {
                                self.prune_dropped();
                            }
                            return Err(DispatchError::Aborted(err));
                        }
                        FailurePolicy::Continue => failures.push(err),
                    }
                }
            }
        }

        if saw_dropped {
            self.prune_dropped();
        }

        let cancelled = event.is_cancelled();
        if cancelled {
            counters.events_cancelled.fetch_add(1, Ordering::Relaxed);
        }

        tracing::debug!(
            bus = %self.inner.config.name,
            event = event_name,
            handlers = invoked,
            failures = failures.len(),
            cancelled,
            "Dispatched event"
        );

        if failures.is_empty() {
            Ok(Delivery {
                handlers_invoked: invoked,
                cancelled,
            })
        } else {
            Err(DispatchError::Failed(failures))
        }
    }

    fn prune_dropped(&self) {
        let pruned = {
            let mut registry = self.inner.registry.write();
            registry.prune_dropped()
        };
        if !pruned.is_empty() {
            tracing::debug!(
                bus = %self.inner.config.name,
                pruned = pruned.len(),
                "Pruned dropped subscribers"
            );
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("name", &self.inner.config.name)
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Cancellation;
    use crate::impl_event;
    use crate::subscriber::HandlerResult;
    use parking_lot::Mutex;

    struct Tick {
        state: Cancellation,
    }
    impl_event!(Tick, state = state);

    impl Tick {
        fn new() -> Self {
            Self {
                state: Cancellation::cancellable(),
            }
        }
    }

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn record(&self, call: &str) {
            self.calls.lock().push(call.to_string());
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    fn recording(
        log: &Arc<Recorder>,
        label: &'static str,
    ) -> impl Fn(&Recorder, &mut Tick) -> HandlerResult + Send + Sync + 'static {
        let log = log.clone();
        move |_: &Recorder, _: &mut Tick| {
            log.record(label);
            Ok(())
        }
    }

    #[test]
    fn test_dispatch_follows_registration_order() {
        let bus = EventBus::new();
        let log = Arc::new(Recorder::default());
        let a = Arc::new(Recorder::default());
        let b = Arc::new(Recorder::default());

        bus.register_with(&a, |h| {
            h.on("a1", recording(&log, "a1")).on("a2", recording(&log, "a2"));
        })
        .unwrap();
        bus.register_with(&b, |h| {
            h.on("b1", recording(&log, "b1"));
        })
        .unwrap();
        // Re-registering keeps a's position.
        bus.register_with(&a, |h| {
            h.on("a3", recording(&log, "a3"));
        })
        .unwrap();

        let delivery = bus.dispatch(&mut Tick::new()).unwrap();
        assert_eq!(delivery.handlers_invoked, 2);
        assert_eq!(log.calls(), vec!["a3", "b1"]);
    }

    #[test]
    fn test_cancellation_does_not_stop_delivery() {
        let bus = EventBus::new();
        let log = Arc::new(Recorder::default());
        let a = Arc::new(Recorder::default());
        let b = Arc::new(Recorder::default());

        bus.register_with(&a, |h| {
            h.on("cancel", |_: &Recorder, tick: &mut Tick| {
                tick.cancel()?;
                Ok(())
            });
        })
        .unwrap();
        bus.register_with(&b, |h| {
            h.on("after", recording(&log, "after"));
        })
        .unwrap();

        let mut tick = Tick::new();
        let delivery = bus.dispatch(&mut tick).unwrap();
        assert!(delivery.cancelled);
        assert!(tick.is_cancelled());
        assert_eq!(log.calls(), vec!["after"]);
        assert_eq!(bus.stats().events_cancelled, 1);
    }

    #[test]
    fn test_abort_policy_stops_at_first_failure() {
        let bus = EventBus::new();
        let log = Arc::new(Recorder::default());
        let a = Arc::new(Recorder::default());

        bus.register_with(&a, |h| {
            h.on("fails", |_: &Recorder, _: &mut Tick| anyhow::bail!("broken"))
                .on("skipped", recording(&log, "skipped"));
        })
        .unwrap();

        let err = bus.dispatch(&mut Tick::new()).unwrap_err();
        match err {
            DispatchError::Aborted(ref inner) => {
                assert_eq!(inner.operation, "fails");
                assert_eq!(inner.subscriber, "Recorder");
                assert_eq!(inner.event, "Tick");
            }
            DispatchError::Failed(_) => panic!("expected abort"),
        }
        assert!(log.calls().is_empty());

        let stats = bus.stats();
        assert_eq!(stats.handlers_invoked, 1);
        assert_eq!(stats.handler_failures, 1);
    }

    #[test]
    fn test_continue_policy_collects_failures() {
        let bus = EventBus::with_config(
            BusConfig::new("test").with_failure_policy(FailurePolicy::Continue),
        );
        let log = Arc::new(Recorder::default());
        let a = Arc::new(Recorder::default());

        bus.register_with(&a, |h| {
            h.on("first", |_: &Recorder, _: &mut Tick| anyhow::bail!("one"))
                .on("middle", recording(&log, "middle"))
                .on("last", |_: &Recorder, _: &mut Tick| anyhow::bail!("two"));
        })
        .unwrap();

        let err = bus.dispatch(&mut Tick::new()).unwrap_err();
        let operations: Vec<_> = err.failures().iter().map(|f| f.operation.as_str()).collect();
        assert_eq!(operations, vec!["first", "last"]);
        assert_eq!(log.calls(), vec!["middle"]);
    }

    #[test]
    fn test_dropped_subscriber_is_pruned() {
        let bus = EventBus::new();
        let log = Arc::new(Recorder::default());
        let a = Arc::new(Recorder::default());

        bus.register_with(&a, |h| {
            h.on("tick", recording(&log, "tick"));
        })
        .unwrap();
        assert_eq!(bus.subscriber_count(), 1);

        drop(a);
        let delivery = bus.dispatch(&mut Tick::new()).unwrap();
        assert_eq!(delivery.handlers_invoked, 0);
        assert_eq!(bus.subscriber_count(), 0);
        assert!(log.calls().is_empty());
    }

    #[test]
    fn test_handler_can_reenter_bus() {
        let bus = EventBus::new();
        let log = Arc::new(Recorder::default());
        let late = Arc::new(Recorder::default());
        let a = Arc::new(Recorder::default());

        let inner_bus = bus.clone();
        let inner_late = late.clone();
        let inner_log = log.clone();
        bus.register_with(&a, move |h| {
            h.on("register_late", move |_: &Recorder, _: &mut Tick| {
                if !inner_bus.is_registered(&inner_late) {
                    inner_bus.register_with(&inner_late, |h| {
                        h.on("late", recording(&inner_log, "late"));
                    })?;
                }
                Ok(())
            });
        })
        .unwrap();

        // The late subscriber joins after the snapshot was taken.
        bus.dispatch(&mut Tick::new()).unwrap();
        assert!(log.calls().is_empty());
        assert!(bus.is_registered(&late));

        bus.dispatch(&mut Tick::new()).unwrap();
        assert_eq!(log.calls(), vec!["late"]);
    }

    #[test]
    fn test_replaced_registration_skipped_mid_dispatch() {
        let bus = EventBus::new();
        let log = Arc::new(Recorder::default());
        let a = Arc::new(Recorder::default());
        let b = Arc::new(Recorder::default());

        let inner_bus = bus.clone();
        let inner_b = b.clone();
        let inner_log = log.clone();
        bus.register_with(&a, move |h| {
            h.on("replace_b", move |_: &Recorder, _: &mut Tick| {
                inner_bus.register_with(&inner_b, |h| {
                    h.on("new", recording(&inner_log, "new"));
                })?;
                Ok(())
            });
        })
        .unwrap();
        bus.register_with(&b, |h| {
            h.on("old", recording(&log, "old"));
        })
        .unwrap();

        bus.dispatch(&mut Tick::new()).unwrap();
        assert!(log.calls().is_empty());

        bus.unregister(&a);
        bus.dispatch(&mut Tick::new()).unwrap();
        assert_eq!(log.calls(), vec!["new"]);
    }

    #[test]
    fn test_unregister_and_clear() {
        let bus = EventBus::new();
        let log = Arc::new(Recorder::default());
        let a = Arc::new(Recorder::default());
        let b = Arc::new(Recorder::default());

        bus.register_with(&a, |h| {
            h.on("a", recording(&log, "a"));
        })
        .unwrap();
        bus.register_with(&b, |h| {
            h.on("b", recording(&log, "b"));
        })
        .unwrap();
        assert_eq!(bus.handler_count(), 2);

        assert!(bus.unregister(&a));
        assert!(!bus.unregister(&a));
        bus.dispatch(&mut Tick::new()).unwrap();
        assert_eq!(log.calls(), vec!["b"]);

        bus.clear();
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(bus.dispatch(&mut Tick::new()).unwrap().handlers_invoked, 0);
    }

    #[test]
    fn test_stats_serialize() {
        let bus = EventBus::new();
        bus.dispatch(&mut Tick::new()).unwrap();
        let json = serde_json::to_value(bus.stats()).unwrap();
        assert_eq!(json["events_dispatched"], 1);
        assert_eq!(json["handlers_invoked"], 0);
    }

    /// Touches the bus when the handler owning it is dropped.
    struct TouchOnDrop {
        bus: EventBus,
        drops: Arc<AtomicU64>,
    }

    impl Drop for TouchOnDrop {
        fn drop(&mut self) {
            let _ = self.bus.subscriber_count();
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn register_touching(bus: &EventBus, subscriber: &Arc<Recorder>, drops: &Arc<AtomicU64>) {
        let touch = TouchOnDrop {
            bus: bus.clone(),
            drops: drops.clone(),
        };
        bus.register_with(subscriber, move |h| {
            h.on("touch", move |_: &Recorder, _: &mut Tick| {
                let _ = &touch;
                Ok(())
            });
        })
        .unwrap();
    }

    #[test]
    fn test_dropping_old_handlers_does_not_hold_registry_lock() {
        let (done_tx, done_rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let bus = EventBus::new();
            let drops = Arc::new(AtomicU64::new(0));
            let a = Arc::new(Recorder::default());

            register_touching(&bus, &a, &drops);
            register_touching(&bus, &a, &drops);
            let after_replace = drops.load(Ordering::SeqCst);

            bus.unregister(&a);
            let after_unregister = drops.load(Ordering::SeqCst);

            register_touching(&bus, &a, &drops);
            bus.clear();
            let after_clear = drops.load(Ordering::SeqCst);

            let b = Arc::new(Recorder::default());
            register_touching(&bus, &b, &drops);
            drop(b);
            bus.dispatch(&mut Tick::new()).unwrap();
            let after_prune = drops.load(Ordering::SeqCst);

            let _ = done_tx.send((after_replace, after_unregister, after_clear, after_prune));
        });

        let counts = done_rx
            .recv_timeout(std::time::Duration::from_secs(10))
            .expect("registry lock held while dropping handlers");
        assert_eq!(counts, (1, 2, 3, 4));
    }

    #[test]
    fn test_counts_ignore_dropped_subscribers() {
        let bus = EventBus::new();
        let log = Arc::new(Recorder::default());
        let a = Arc::new(Recorder::default());
        let b = Arc::new(Recorder::default());

        bus.register_with(&a, |h| {
            h.on("a", recording(&log, "a"));
        })
        .unwrap();
        bus.register_with(&b, |h| {
            h.on("b1", recording(&log, "b1"))
                .on("b2", recording(&log, "b2"));
        })
        .unwrap();
        assert_eq!(bus.subscriber_count(), 2);
        assert_eq!(bus.handler_count(), 3);

        drop(b);
        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(bus.handler_count(), 1);
    }
}
