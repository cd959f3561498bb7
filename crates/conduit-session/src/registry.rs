//! In-memory session registry with idle expiry.

use crate::session::Session;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Owns every live session of one server.
///
/// All operations take the map lock briefly and never across an `.await`,
/// so concurrent requests on the same session only serialize on bookkeeping.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    ttl: Duration,
}

impl SessionRegistry {
    /// Creates a registry expiring sessions idle for longer than `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// The configured time-to-live.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Creates and registers a new session.
    pub fn create(&self) -> Arc<Session> {
        let session = Arc::new(Session::new());
        self.sessions
            .lock()
            .insert(session.id().to_string(), session.clone());
        info!(session_id = %session.id(), "Session created");
        session
    }

    /// Looks up a session.
    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.lock().get(id).cloned()
    }

    /// Marks a session active now. Returns `false` if it is unknown.
    pub fn touch(&self, id: &str) -> bool {
        self.touch_at(id, Instant::now())
    }

    /// Marks a session active at `at`. Returns `false` if it is unknown.
    pub fn touch_at(&self, id: &str, at: Instant) -> bool {
        match self.get(id) {
            Some(session) => {
                session.touch_at(at);
                true
            }
            None => false,
        }
    }

    /// Removes a session, returning it if it existed.
    pub fn destroy(&self, id: &str) -> Option<Arc<Session>> {
        let removed = self.sessions.lock().remove(id);
        if removed.is_some() {
            info!(session_id = %id, "Session destroyed");
        }
        removed
    }

    /// Removes every session idle longer than the TTL as of now.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    /// Removes every session idle longer than the TTL as of `now`.
    pub fn sweep_at(&self, now: Instant) -> usize {
        self.sweep_expired_at(now).len()
    }

    /// Like [`sweep_at`](Self::sweep_at) but returns the removed ids.
    pub fn sweep_expired_at(&self, now: Instant) -> Vec<String> {
        let mut sessions = self.sessions.lock();
        let expired: Vec<String> = sessions
            .iter()
            .filter(|(_, s)| s.idle_for(now) > self.ttl)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            sessions.remove(id);
        }
        drop(sessions);

        if !expired.is_empty() {
            info!(count = expired.len(), "Expired idle sessions");
        }
        expired
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Whether no session is live.
    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// Snapshot of every live session.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.lock().values().cloned().collect()
    }

    /// Starts the background sweep on a fixed interval.
    ///
    /// `on_expired` receives the ids removed by each non-empty sweep. The
    /// task holds only a weak reference and ends once the registry is
    /// dropped or the returned handle is stopped.
    pub fn spawn_sweeper<F>(self: &Arc<Self>, interval: Duration, on_expired: F) -> SweeperHandle
    where
        F: Fn(&[String]) + Send + Sync + 'static,
    {
        let registry: Weak<Self> = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(registry) = registry.upgrade() else {
                    debug!("Session registry dropped, sweeper exiting");
                    break;
                };
                let expired = registry.sweep_expired_at(Instant::now());
                if !expired.is_empty() {
                    on_expired(&expired);
                }
            }
        });
        SweeperHandle { task: Some(task) }
    }
}

/// Handle to a running sweeper; stopping or dropping it cancels the task.
pub struct SweeperHandle {
    task: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    /// Cancels the sweeper.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    /// Whether the sweeper task is still scheduled.
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
