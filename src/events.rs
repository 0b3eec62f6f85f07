//! Per-producer publish/subscribe.
//!
//! Each producer owns one [`Emitter`] per event type. Consumers keep the
//! returned [`Subscription`] and call [`Subscription::unsubscribe`] on
//! teardown.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;
type Listeners<E> = Mutex<Vec<(u64, Handler<E>)>>;

pub struct Emitter<E> {
    listeners: Arc<Listeners<E>>,
    next_id: AtomicU64,
}

impl<E: 'static> Default for Emitter<E> {
    fn default() -> Self {
        Self {
            listeners: Arc::new(Mutex::new(Vec::new())),
            next_id: AtomicU64::new(0),
        }
    }
}

impl<E: 'static> Emitter<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.listeners).push((id, Arc::new(handler)));

        let weak: Weak<Listeners<E>> = Arc::downgrade(&self.listeners);
        Subscription {
            remove: Some(Box::new(move || {
                if let Some(listeners) = weak.upgrade() {
                    lock(&listeners).retain(|(lid, _)| *lid != id);
                }
            })),
        }
    }

    /// Calls every current listener. Handlers run outside the listener lock so
    /// they may subscribe or unsubscribe.
    pub fn emit(&self, event: &E) {
        let handlers: Vec<Handler<E>> = lock(&self.listeners)
            .iter()
            .map(|(_, h)| Arc::clone(h))
            .collect();
        for handler in handlers {
            handler(event);
        }
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.listeners).len()
    }
}

fn lock<E: 'static>(listeners: &Listeners<E>) -> std::sync::MutexGuard<'_, Vec<(u64, Handler<E>)>> {
    listeners.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Handle returned by [`Emitter::subscribe`].
#[must_use = "keep the subscription and unsubscribe on teardown"]
pub struct Subscription {
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.remove.is_some())
            .finish()
    }
}
