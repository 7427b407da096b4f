//! In-process notification signals
//!
//! A `Signal<T>` delivers each emitted value, in emission order, to the
//! handlers connected at the moment of emission. There is no replay: a
//! handler connected after an emit never sees it.
//!
//! Connecting returns a [`Subscription`]. The handler stays connected
//! exactly as long as the subscription is alive; dropping it (or calling
//! [`Subscription::disconnect`]) removes the handler before the next emit.
//!
//! ```
//! use datakeep_core::Signal;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//!
//! let signal = Signal::<u32>::new();
//! let seen = Arc::new(AtomicUsize::new(0));
//! let counter = Arc::clone(&seen);
//! let sub = signal.connect(move |v| {
//!     counter.fetch_add(*v as usize, Ordering::SeqCst);
//! });
//! signal.emit(&3);
//! sub.disconnect();
//! signal.emit(&4);
//! assert_eq!(seen.load(Ordering::SeqCst), 3);
//! ```

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct SignalInner<T> {
    handlers: Mutex<Vec<(u64, Handler<T>)>>,
    next_id: AtomicU64,
}

/// Publish/subscribe channel with ordered delivery to current subscribers.
pub struct Signal<T> {
    inner: Arc<SignalInner<T>>,
}

impl<T: 'static> Signal<T> {
    pub fn new() -> Self {
        Signal {
            inner: Arc::new(SignalInner {
                handlers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register `handler`; it is called for every emit until the returned
    /// subscription is dropped or disconnected.
    #[must_use = "the handler is disconnected when the subscription is dropped"]
    pub fn connect(&self, handler: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.handlers.lock().push((id, Arc::new(handler)));

        let weak: Weak<SignalInner<T>> = Arc::downgrade(&self.inner);
        Subscription {
            id,
            detach: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.handlers.lock().retain(|(hid, _)| *hid != id);
                }
            })),
        }
    }

    /// Deliver `value` to every connected handler, in connection order.
    ///
    /// Handlers run outside the internal lock, so they may connect or
    /// disconnect other handlers; such changes apply from the next emit.
    pub fn emit(&self, value: &T) {
        let handlers: Vec<Handler<T>> = self
            .inner
            .handlers
            .lock()
            .iter()
            .map(|(_, h)| Arc::clone(h))
            .collect();
        for handler in handlers {
            handler(value);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.handlers.lock().len()
    }
}

impl<T: 'static> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("subscribers", &self.inner.handlers.lock().len())
            .finish()
    }
}

/// Registration handle returned by [`Signal::connect`].
pub struct Subscription {
    id: u64,
    detach: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remove the handler now.
    pub fn disconnect(mut self) {
        self.detach_now();
    }

    /// Keep the handler connected for the lifetime of the signal.
    pub fn forget(mut self) {
        self.detach = None;
    }

    fn detach_now(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach_now();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
