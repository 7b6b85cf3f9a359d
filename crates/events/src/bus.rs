//! In-process publish/subscribe registry for execution events.
//!
//! Routing is by [`RunId`] only: an event published for run `A` is handed to
//! the handlers registered under `A` and to nobody else.
//!
//! ## Delivery
//!
//! - Synchronous: `publish` returns after every handler for the run has been
//!   invoked on the publishing thread.
//! - Registration order: handlers for one run see an event in the order they
//!   subscribed; events published sequentially reach each handler in publish
//!   order.
//! - Isolated: a handler returning an error or panicking is logged and
//!   skipped; the remaining handlers still run and `publish` never fails.
//! - At-most-once, no buffering: an event published while nobody is
//!   subscribed to its run is dropped.
//!
//! The handler list is snapshotted under the lock and invoked outside it, so
//! handlers may subscribe, unsubscribe or publish re-entrantly. A handler
//! removed during a `publish` still receives the event being delivered.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::{debug, warn};

use pressflow_core::RunId;

use crate::event::ExecutionEvent;

/// Failure reported by a subscriber handler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct SubscriberError(String);

impl SubscriberError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

pub type SubscriberResult = Result<(), SubscriberError>;

type Handler = Arc<dyn Fn(&ExecutionEvent) -> SubscriberResult + Send + Sync>;

struct Registration {
    id: u64,
    handler: Handler,
}

#[derive(Default)]
struct Registry {
    runs: HashMap<RunId, Vec<Registration>>,
    total: usize,
}

impl Registry {
    fn remove(&mut self, run_id: &RunId, id: u64) -> bool {
        let Some(list) = self.runs.get_mut(run_id) else {
            return false;
        };
        let before = list.len();
        list.retain(|r| r.id != id);
        let removed = list.len() < before;
        if list.is_empty() {
            self.runs.remove(run_id);
        }
        if removed {
            self.total -= 1;
        }
        removed
    }
}

struct BusInner {
    registry: Mutex<Registry>,
    next_id: AtomicU64,
}

impl BusInner {
    // A panicking handler never holds this lock, but recover anyway so that
    // publish and unsubscribe stay infallible.
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Run-scoped fan-out of [`ExecutionEvent`]s to live subscribers.
///
/// Cheap to clone; clones share one registry. Construct one per process at the
/// composition root and pass it to whoever publishes or subscribes.
#[derive(Clone)]
pub struct ExecutionEventBus {
    inner: Arc<BusInner>,
}

impl ExecutionEventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                registry: Mutex::new(Registry::default()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register `handler` for events of `run_id`.
    ///
    /// The returned [`Subscription`] is the only way to remove this
    /// registration: call [`Subscription::unsubscribe`] or drop it.
    pub fn subscribe<F>(&self, run_id: RunId, handler: F) -> Subscription
    where
        F: Fn(&ExecutionEvent) -> SubscriberResult + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut registry = self.inner.registry();
            registry.runs.entry(run_id.clone()).or_default().push(Registration {
                id,
                handler: Arc::new(handler),
            });
            registry.total += 1;
        }
        debug!(run_id = %run_id, subscription = id, "execution event subscriber registered");

        Subscription {
            bus: Arc::downgrade(&self.inner),
            run_id,
            id,
            active: AtomicBool::new(true),
        }
    }

    /// Deliver `event` to every handler currently registered for its run.
    pub fn publish(&self, event: &ExecutionEvent) {
        let handlers: Vec<(u64, Handler)> = {
            let registry = self.inner.registry();
            match registry.runs.get(event.run_id()) {
                Some(list) => list.iter().map(|r| (r.id, r.handler.clone())).collect(),
                None => return,
            }
        };

        for (id, handler) in handlers {
            match panic::catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(
                    run_id = %event.run_id(),
                    event_type = %event.event_type(),
                    subscription = id,
                    error = %err,
                    "execution event subscriber failed"
                ),
                Err(_) => warn!(
                    run_id = %event.run_id(),
                    event_type = %event.event_type(),
                    subscription = id,
                    "execution event subscriber panicked"
                ),
            }
        }
    }

    /// Number of live subscriptions for `run_id`.
    pub fn subscription_count(&self, run_id: &RunId) -> usize {
        self.inner.registry().runs.get(run_id).map_or(0, Vec::len)
    }

    /// Number of live subscriptions across all runs.
    pub fn total_subscription_count(&self) -> usize {
        self.inner.registry().total
    }

    /// Drop every subscription of every run.
    ///
    /// Outstanding [`Subscription`] handles become inert.
    pub fn clear(&self) {
        let mut registry = self.inner.registry();
        let dropped = registry.total;
        registry.runs.clear();
        registry.total = 0;
        drop(registry);
        debug!(dropped, "execution event bus cleared");
    }
}

impl Default for ExecutionEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for ExecutionEventBus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let registry = self.inner.registry();
        f.debug_struct("ExecutionEventBus")
            .field("runs", &registry.runs.len())
            .field("subscriptions", &registry.total)
            .finish()
    }
}

/// Unsubscribe capability for one registration on an [`ExecutionEventBus`].
///
/// Unsubscribing is idempotent and also happens on drop. The handle holds the
/// bus weakly, so it never keeps a bus alive.
#[must_use = "dropping a Subscription unsubscribes it immediately"]
#[derive(Debug)]
pub struct Subscription {
    bus: Weak<BusInner>,
    run_id: RunId,
    id: u64,
    active: AtomicBool,
}

impl Subscription {
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Whether this handle has not been unsubscribed yet.
    ///
    /// Stays `true` after [`ExecutionEventBus::clear`], which removes the
    /// registration without touching outstanding handles.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Remove exactly this registration. Later calls do nothing.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        let Some(bus) = self.bus.upgrade() else {
            return;
        };
        let removed = bus.registry().remove(&self.run_id, self.id);
        debug!(
            run_id = %self.run_id,
            subscription = self.id,
            removed,
            "execution event subscriber removed"
        );
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
