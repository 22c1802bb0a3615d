// Fault-isolated listener dispatch.
//
// Close cascades in this crate are strictly one-directional: owners call
// `close()` downward (Conference -> Room -> Peer -> Transport) and observe
// upward through `Listeners`. A listener that panics is caught and logged;
// it never takes down the emitter or the listeners after it. Single-consumer
// flows (transport frames, peer requests) use mpsc channels instead, which
// isolate by construction.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Mutex;

type Listener<T> = std::sync::Arc<dyn Fn(&T) + Send + Sync>;

/// A list of listeners for one event source.
///
/// `emit` snapshots the list before invoking, so a listener may register
/// further listeners (or re-enter `emit` on another instance) without
/// deadlocking.
pub struct Listeners<T> {
    handlers: Mutex<Vec<Listener<T>>>,
}

impl<T> Listeners<T> {
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(Vec::new()),
        }
    }

    /// Register a listener. Listeners fire in registration order.
    pub fn add(&self, listener: impl Fn(&T) + Send + Sync + 'static) {
        self.handlers
            .lock()
            .unwrap()
            .push(std::sync::Arc::new(listener));
    }

    /// Invoke every listener with `event`. A panicking listener is caught
    /// and logged; remaining listeners still run.
    pub fn emit(&self, event: &T) {
        let snapshot: Vec<Listener<T>> = self.handlers.lock().unwrap().clone();
        for handler in snapshot {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                tracing::error!("event listener panicked; continuing dispatch");
            }
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.handlers.lock().unwrap().len()
    }
}

impl<T> Default for Listeners<T> {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
