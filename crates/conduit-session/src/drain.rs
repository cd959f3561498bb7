//! Tracks requests that are inside a handler so shutdown can drain them
//! and peers can cancel them.

use conduit_core::RequestId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

struct Entry {
    count: usize,
    cancel: watch::Sender<bool>,
}

/// Multiset of in-flight `(session, request id)` pairs.
#[derive(Default)]
pub struct InFlightTracker {
    active: Mutex<HashMap<String, Entry>>,
    idle: Notify,
}

fn key(session_id: &str, id: &RequestId) -> String {
    format!("{session_id}/{id}")
}

impl InFlightTracker {
    /// Creates an empty tracker.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Records a request entering a handler; dropping the guard records it
    /// leaving.
    pub fn begin(self: &Arc<Self>, session_id: &str, id: &RequestId) -> InFlightGuard {
        let key = key(session_id, id);
        let mut active = self.active.lock();
        let entry = active.entry(key.clone()).or_insert_with(|| Entry {
            count: 0,
            cancel: watch::Sender::new(false),
        });
        entry.count += 1;
        let cancelled = entry.cancel.subscribe();
        drop(active);
        InFlightGuard {
            tracker: self.clone(),
            key,
            cancelled,
        }
    }

    /// Signals cancellation to every in-flight request with this id.
    /// Returns `false` if none is in flight.
    pub fn cancel(&self, session_id: &str, id: &RequestId) -> bool {
        match self.active.lock().get(&key(session_id, id)) {
            Some(entry) => {
                entry.cancel.send_replace(true);
                debug!(session_id = %session_id, request_id = %id, "Request cancelled");
                true
            }
            None => false,
        }
    }

    /// Number of requests currently in flight.
    pub fn len(&self) -> usize {
        self.active.lock().values().map(|e| e.count).sum()
    }

    /// Whether nothing is in flight.
    pub fn is_empty(&self) -> bool {
        self.active.lock().is_empty()
    }

    /// Whether the given request is in flight.
    pub fn contains(&self, session_id: &str, id: &RequestId) -> bool {
        self.active.lock().contains_key(&key(session_id, id))
    }

    fn finish(&self, key: &str) {
        let mut active = self.active.lock();
        if let Some(entry) = active.get_mut(key) {
            entry.count -= 1;
            if entry.count == 0 {
                active.remove(key);
            }
        }
        if active.is_empty() {
            self.idle.notify_waiters();
        }
    }

    /// Waits until nothing is in flight, for at most `timeout`.
    ///
    /// Returns `true` if the tracker drained in time.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.idle.notified();
            let pending = self.len();
            if pending == 0 {
                return true;
            }
            info!(pending, "Waiting for in-flight requests to drain");
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                warn!(pending = self.len(), "Drain timeout elapsed, forcing close");
                return false;
            }
        }
    }
}

/// RAII marker for one in-flight request.
pub struct InFlightGuard {
    tracker: Arc<InFlightTracker>,
    key: String,
    cancelled: watch::Receiver<bool>,
}

impl InFlightGuard {
    /// Resolves once the request is cancelled, including a cancellation
    /// that happened before this call.
    pub async fn cancelled(&mut self) {
        if self.cancelled.wait_for(|c| *c).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.tracker.finish(&self.key);
    }
}
