//! Publish/subscribe hooks a transport exposes to its owner.
//!
//! Each event kind keeps its own listener list. Listeners run synchronously,
//! in registration order, on the task that emitted the event.

use conduit_core::{Message, ParseFailure};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Handle returned by [`Listeners::add`], used to remove the listener again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// An ordered list of callbacks for one event kind.
pub struct Listeners<T> {
    next_id: AtomicU64,
    entries: Mutex<Vec<(ListenerId, Callback<T>)>>,
}

impl<T> Listeners<T> {
    /// An empty list.
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Registers `listener` after every existing one.
    pub fn add<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries.lock().push((id, Arc::new(listener)));
        id
    }

    /// Unregisters a listener. Returns `false` if it was not registered.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|(existing, _)| *existing != id);
        entries.len() != before
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether no listener is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Invokes every listener with `event`.
    ///
    /// The list is snapshotted first, so a listener may add or remove
    /// listeners without deadlocking; changes apply from the next emit.
    pub fn emit(&self, event: &T) {
        let snapshot: Vec<Callback<T>> =
            self.entries.lock().iter().map(|(_, cb)| cb.clone()).collect();
        for callback in snapshot {
            callback(event);
        }
    }
}

impl<T> Default for Listeners<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A failure observed by a transport that did not end it.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportError {
    /// An inbound frame failed to parse.
    Parse(ParseFailure),
    /// Reading or writing the channel failed.
    Io(String),
}

/// Why a transport closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The inbound channel reached end of input.
    EndOfInput,
    /// A termination signal was received.
    Signal,
    /// An I/O error ended the channel.
    Error,
}

/// Message, error and close hooks of one transport.
#[derive(Default)]
pub struct TransportEvents {
    /// Every successfully parsed inbound message.
    pub message: Listeners<Message>,
    /// Failures that did not close the transport.
    pub error: Listeners<TransportError>,
    /// Emitted exactly once when the transport closes.
    pub close: Listeners<CloseReason>,
}

impl TransportEvents {
    /// Empty hook lists.
    pub fn new() -> Self {
        Self::default()
    }
}
