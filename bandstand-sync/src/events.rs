//! Typed in-process publish/subscribe.
//!
//! An [`EventBus`] routes events by kind to handlers registered for that
//! kind. Handlers run synchronously inside [`EventBus::publish`], in
//! registration order. A handler that returns an error or panics is logged
//! and skipped; later handlers still run and the publisher never sees the
//! failure.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::warn;

/// Result returned by event handlers.
pub type HandlerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// An event that can travel on an [`EventBus`].
pub trait BusEvent: Send + Sync + 'static {
    /// Discriminant used for routing.
    type Kind: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static;

    fn kind(&self) -> Self::Kind;
}

/// Identifies one registration, for [`EventBus::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler<E> = Arc<dyn Fn(&E) -> HandlerResult + Send + Sync>;

struct Registration<E> {
    id: SubscriptionId,
    once: bool,
    handler: Handler<E>,
}

struct Registry<E: BusEvent> {
    handlers: HashMap<E::Kind, Vec<Registration<E>>>,
    disposed: bool,
}

/// Event bus for one event type.
pub struct EventBus<E: BusEvent> {
    registry: Mutex<Registry<E>>,
    next_id: AtomicU64,
}

impl<E: BusEvent> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: BusEvent> fmt::Debug for EventBus<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.lock();
        f.debug_struct("EventBus")
            .field("kinds", &registry.handlers.len())
            .field("disposed", &registry.disposed)
            .finish()
    }
}

impl<E: BusEvent> EventBus<E> {
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(Registry {
                handlers: HashMap::new(),
                disposed: false,
            }),
            next_id: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Registry<E>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register<F>(&self, kind: E::Kind, once: bool, handler: F) -> SubscriptionId
    where
        F: Fn(&E) -> HandlerResult + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut registry = self.lock();
        if registry.disposed {
            return id;
        }
        registry.handlers.entry(kind).or_default().push(Registration {
            id,
            once,
            handler: Arc::new(handler),
        });
        id
    }

    /// Registers `handler` for every event of `kind`.
    ///
    /// After [`dispose`](Self::dispose) the registration is silently dropped.
    pub fn subscribe<F>(&self, kind: E::Kind, handler: F) -> SubscriptionId
    where
        F: Fn(&E) -> HandlerResult + Send + Sync + 'static,
    {
        self.register(kind, false, handler)
    }

    /// Registers `handler` for the next event of `kind` only.
    pub fn subscribe_once<F>(&self, kind: E::Kind, handler: F) -> SubscriptionId
    where
        F: Fn(&E) -> HandlerResult + Send + Sync + 'static,
    {
        self.register(kind, true, handler)
    }

    /// Removes a registration. Returns whether it was still registered.
    pub fn unsubscribe(&self, kind: E::Kind, id: SubscriptionId) -> bool {
        let mut registry = self.lock();
        let Some(list) = registry.handlers.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|r| r.id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            registry.handlers.remove(&kind);
        }
        removed
    }

    /// Delivers `event` to every handler registered for its kind.
    ///
    /// The handler list is snapshotted first: handlers added or removed by a
    /// running handler take effect from the next publish. Returns how many
    /// handlers completed successfully.
    pub fn publish(&self, event: &E) -> usize {
        let kind = event.kind();
        let snapshot: Vec<(SubscriptionId, Handler<E>)> = {
            let mut registry = self.lock();
            if registry.disposed {
                return 0;
            }
            let Some(list) = registry.handlers.get_mut(&kind) else {
                return 0;
            };
            let snapshot = list
                .iter()
                .map(|r| (r.id, Arc::clone(&r.handler)))
                .collect();
            list.retain(|r| !r.once);
            if list.is_empty() {
                registry.handlers.remove(&kind);
            }
            snapshot
        };

        let mut delivered = 0;
        for (id, handler) in snapshot {
            match panic::catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => warn!("Event handler {:?} for {:?} failed: {}", id, kind, e),
                Err(payload) => {
                    let message = payload
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| payload.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "non-string panic".to_string());
                    warn!("Event handler {:?} for {:?} panicked: {}", id, kind, message);
                }
            }
        }
        delivered
    }

    /// Number of handlers currently registered for `kind`.
    pub fn handler_count(&self, kind: E::Kind) -> usize {
        self.lock().handlers.get(&kind).map_or(0, Vec::len)
    }

    /// Drops every registration. Later publishes and subscriptions are no-ops.
    pub fn dispose(&self) {
        let mut registry = self.lock();
        registry.handlers.clear();
        registry.disposed = true;
    }

    pub fn is_disposed(&self) -> bool {
        self.lock().disposed
    }
}
