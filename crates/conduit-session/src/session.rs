use crate::lifecycle::{ConnectionState, Lifecycle, PeerInfo};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Server-side state for one logical client connection.
#[derive(Debug)]
pub struct Session {
    id: String,
    created_at: DateTime<Utc>,
    last_active: Mutex<Instant>,
    lifecycle: Lifecycle,
    ephemeral: bool,
}

impl Session {
    /// A new session with a random, unguessable id and a fresh lifecycle.
    pub fn new() -> Self {
        Self::build(Lifecycle::new(), false)
    }

    /// A throwaway session that is already ready.
    ///
    /// Stateless HTTP synthesizes one of these per request and never
    /// registers it.
    pub fn ephemeral() -> Self {
        Self::build(Lifecycle::ready(), true)
    }

    fn build(lifecycle: Lifecycle, ephemeral: bool) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            created_at: Utc::now(),
            last_active: Mutex::new(Instant::now()),
            lifecycle,
            ephemeral,
        }
    }

    /// Opaque session id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wall-clock creation time.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Monotonic time of the last request addressed to this session.
    pub fn last_active(&self) -> Instant {
        *self.last_active.lock()
    }

    /// Whether this is a synthetic stateless session.
    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral
    }

    /// The session's lifecycle state machine.
    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    /// Shortcut for `lifecycle().state()`.
    pub fn state(&self) -> ConnectionState {
        self.lifecycle.state()
    }

    /// Shortcut for `lifecycle().peer()`.
    pub fn peer(&self) -> PeerInfo {
        self.lifecycle.peer()
    }

    /// Marks the session active now.
    pub fn touch(&self) {
        self.touch_at(Instant::now());
    }

    /// Marks the session active at `at`; never moves the timestamp backwards.
    pub fn touch_at(&self, at: Instant) {
        let mut last = self.last_active.lock();
        if at > *last {
            *last = at;
        }
    }

    /// How long the session has been idle as of `now`.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_active())
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}
