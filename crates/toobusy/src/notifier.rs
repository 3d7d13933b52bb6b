//! Lag listeners and the per-sample evaluation pass

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::warn;

/// Callback invoked with the smoothed lag (ms) when it exceeds a threshold
pub type LagCallback = Arc<dyn Fn(f64) + Send + Sync>;

/// Handle returned by registration, used to remove a single listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

#[derive(Clone)]
struct Registration {
    id: ListenerId,
    callback: LagCallback,
    // None follows the monitor's max lag at evaluation time
    threshold: Option<f64>,
}

impl Registration {
    fn effective_threshold(&self, default_threshold: f64) -> f64 {
        self.threshold.unwrap_or(default_threshold)
    }
}

/// Ordered collection of listeners, evaluated once per completed sample
#[derive(Default)]
pub(crate) struct Notifier {
    listeners: Mutex<Vec<Registration>>,
    next_id: AtomicU64,
}

impl Notifier {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn listeners(&self) -> MutexGuard<'_, Vec<Registration>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn register(&self, callback: LagCallback, threshold: Option<f64>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners().push(Registration {
            id,
            callback,
            threshold,
        });
        id
    }

    pub(crate) fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners();
        let before = listeners.len();
        listeners.retain(|r| r.id != id);
        listeners.len() != before
    }

    pub(crate) fn clear(&self) -> usize {
        let mut listeners = self.listeners();
        let removed = listeners.len();
        listeners.clear();
        removed
    }

    pub(crate) fn len(&self) -> usize {
        self.listeners().len()
    }

    /// Fire every listener whose threshold `lag` exceeds, in registration order.
    ///
    /// The collection is copied before invoking anything, so callbacks may
    /// register or remove listeners freely. `keep_going` is consulted before
    /// each invocation; once it returns false the rest of the pass is skipped.
    /// A panicking listener is logged and does not stop the pass.
    /// Returns how many listeners fired.
    pub(crate) fn evaluate(
        &self,
        lag: f64,
        default_threshold: f64,
        keep_going: impl Fn() -> bool,
    ) -> usize {
        let snapshot: Vec<Registration> = self.listeners().clone();
        let mut fired = 0;

        for registration in snapshot {
            if lag <= registration.effective_threshold(default_threshold) {
                continue;
            }
            if !keep_going() {
                break;
            }
            let callback = &registration.callback;
            match panic::catch_unwind(AssertUnwindSafe(|| callback(lag))) {
                Ok(()) => fired += 1,
                Err(payload) => {
                    warn!(
                        listener = %registration.id,
                        lag_ms = lag,
                        panic = %panic_message(payload.as_ref()),
                        "Lag listener panicked; continuing with remaining listeners"
                    );
                }
            }
        }

        fired
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}
