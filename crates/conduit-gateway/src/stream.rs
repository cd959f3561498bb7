//! Per-session event streams with replay.
//!
//! Each session has one sequence and one bounded buffer of past events, shared
//! by every stream the session opens. Event ids have the form
//! `<session>:<sequence>`, so a reconnecting client can name its resume point
//! with the last id it saw.
//!
//! A session holds at most one live stream (opened by `GET` with a last event
//! id) plus one request stream per streamed `POST`. A request stream carries
//! the answer to its own request and whatever the handler publishes while
//! answering it.

use async_trait::async_trait;
use axum::body::Bytes;
use conduit_core::{codec, ConduitResult, Message};
use conduit_mcp::Publisher;
use futures_util::Stream;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info};

const PREAMBLE: &[u8] = b": stream open\n\n";
const KEEP_ALIVE: &[u8] = b": keep-alive\n\n";

/// The receiving end of a session stream, suitable for a response body.
pub struct EventStream {
    inner: UnboundedReceiverStream<Bytes>,
    key: u64,
}

impl EventStream {
    /// Identifies this stream among the streams of its session; see
    /// [`EventStreamManager::send_to`].
    pub fn key(&self) -> u64 {
        self.key
    }
}

impl Stream for EventStream {
    type Item = Bytes;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Bytes>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// One event as kept in the replay buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferedEvent {
    /// Position in the session's sequence, starting at 1.
    pub sequence: u64,
    /// `<session>:<sequence>`.
    pub id: String,
    /// The `event:` line, if any.
    pub event_type: Option<String>,
    /// Serialized payload.
    pub data: String,
}

impl BufferedEvent {
    fn frame(&self) -> Bytes {
        Bytes::from(format_event(&self.id, self.event_type.as_deref(), &self.data))
    }
}

/// Formats one event: optional `event:` line, one `data:` line per payload
/// line, the `id:` line and a blank terminator.
pub fn format_event(id: &str, event_type: Option<&str>, data: &str) -> String {
    let mut out = String::with_capacity(data.len() + id.len() + 32);
    if let Some(t) = event_type {
        out.push_str("event: ");
        out.push_str(t);
        out.push('\n');
    }
    for line in data.split('\n') {
        out.push_str("data: ");
        out.push_str(line.strip_suffix('\r').unwrap_or(line));
        out.push('\n');
    }
    out.push_str("id: ");
    out.push_str(id);
    out.push_str("\n\n");
    out
}

/// Extracts the sequence from `<session>:<sequence>`; `None` when the id is
/// malformed or belongs to another session.
pub fn parse_event_id(session_id: &str, event_id: &str) -> Option<u64> {
    event_id
        .trim()
        .strip_prefix(session_id)?
        .strip_prefix(':')?
        .parse()
        .ok()
}

/// Write half of one open stream.
struct Channel {
    tx: mpsc::UnboundedSender<Bytes>,
    keep_alive: Option<JoinHandle<()>>,
}

impl Channel {
    fn is_active(&self) -> bool {
        !self.tx.is_closed()
    }

    fn write(&self, frame: Bytes) -> bool {
        self.tx.send(frame).is_ok()
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if let Some(task) = self.keep_alive.take() {
            task.abort();
        }
    }
}

#[derive(Default)]
struct StreamState {
    sequence: u64,
    next_key: u64,
    buffer: VecDeque<BufferedEvent>,
    live: Option<Channel>,
    requests: HashMap<u64, Channel>,
}

impl StreamState {
    fn is_active(&self) -> bool {
        self.live.as_ref().is_some_and(Channel::is_active)
    }

    /// Writes to the live stream, dropping it once the client is gone.
    fn write_live(&mut self, session_id: &str, frame: Bytes) {
        if let Some(live) = &self.live {
            if !live.write(frame) {
                debug!(session_id = %session_id, "Event stream disconnected");
                self.live = None;
            }
        }
    }
}

/// Owns the event streams of every session.
pub struct EventStreamManager {
    streams: Mutex<HashMap<String, StreamState>>,
    capacity: usize,
    keep_alive: Duration,
}

impl EventStreamManager {
    /// Keeps up to `capacity` events per session and writes a keep-alive
    /// comment every `keep_alive` (never, if zero).
    pub fn new(capacity: usize, keep_alive: Duration) -> Arc<Self> {
        Arc::new(Self {
            streams: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
            keep_alive,
        })
    }

    /// Opens the live stream for `session_id`, replacing any earlier one.
    ///
    /// The sequence and replay buffer are kept. Request streams are not
    /// affected.
    pub fn open(&self, session_id: &str) -> EventStream {
        let mut streams = self.streams.lock();
        let state = streams.entry(session_id.to_string()).or_default();
        let (stream, channel) = self.channel(session_id, state);
        state.live = Some(channel);
        info!(session_id = %session_id, "Event stream opened");
        stream
    }

    /// Opens a stream dedicated to one request, next to the live stream and
    /// any other request streams of the session.
    pub fn open_request(&self, session_id: &str) -> EventStream {
        let mut streams = self.streams.lock();
        let state = streams.entry(session_id.to_string()).or_default();
        let (stream, channel) = self.channel(session_id, state);
        state.requests.insert(stream.key, channel);
        debug!(session_id = %session_id, key = stream.key, "Request stream opened");
        stream
    }

    /// Replaces the live stream and first replays every buffered event after
    /// `last_event_id`, under its original id.
    ///
    /// An id that does not parse, or names another session, replays
    /// nothing.
    pub fn reconnect(&self, session_id: &str, last_event_id: &str) -> EventStream {
        let mut streams = self.streams.lock();
        let state = streams.entry(session_id.to_string()).or_default();
        let (stream, channel) = self.channel(session_id, state);

        let mut replayed = 0usize;
        match parse_event_id(session_id, last_event_id) {
            Some(after) => {
                for event in state.buffer.iter().filter(|e| e.sequence > after) {
                    if !channel.write(event.frame()) {
                        break;
                    }
                    replayed += 1;
                }
            }
            None => debug!(
                session_id = %session_id,
                last_event_id = %last_event_id,
                "Unrecognized last event id, nothing to replay"
            ),
        }
        state.live = Some(channel);
        info!(session_id = %session_id, replayed, "Event stream reconnected");
        stream
    }

    fn channel(&self, session_id: &str, state: &mut StreamState) -> (EventStream, Channel) {
        state.next_key += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(Bytes::from_static(PREAMBLE));
        let keep_alive = self.spawn_keep_alive(session_id, tx.clone());
        let stream = EventStream {
            inner: UnboundedReceiverStream::new(rx),
            key: state.next_key,
        };
        (stream, Channel { tx, keep_alive })
    }

    fn spawn_keep_alive(
        &self,
        session_id: &str,
        tx: mpsc::UnboundedSender<Bytes>,
    ) -> Option<JoinHandle<()>> {
        if self.keep_alive.is_zero() {
            return None;
        }
        let period = self.keep_alive;
        let session_id = session_id.to_string();
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if tx.send(Bytes::from_static(KEEP_ALIVE)).is_err() {
                            break;
                        }
                    }
                    () = tx.closed() => break,
                }
            }
            debug!(session_id = %session_id, "Keep-alive stopped");
        }))
    }

    fn record(
        &self,
        session_id: &str,
        state: &mut StreamState,
        message: &Message,
        event_type: Option<&str>,
    ) -> (Bytes, String) {
        state.sequence += 1;
        let event = BufferedEvent {
            sequence: state.sequence,
            id: format!("{session_id}:{}", state.sequence),
            event_type: event_type.map(str::to_string),
            data: codec::serialize(message),
        };
        let frame = event.frame();
        let id = event.id.clone();
        state.buffer.push_back(event);
        while state.buffer.len() > self.capacity {
            state.buffer.pop_front();
        }
        (frame, id)
    }

    /// Sends `message` to the session's live stream and returns the assigned
    /// event id, or `None` if the session never opened a stream.
    ///
    /// A disconnected stream still numbers and buffers the event so a later
    /// reconnect can replay it; only the write is skipped.
    pub fn send(
        &self,
        session_id: &str,
        message: &Message,
        event_type: Option<&str>,
    ) -> Option<String> {
        let mut streams = self.streams.lock();
        let state = streams.get_mut(session_id)?;
        let (frame, id) = self.record(session_id, state, message, event_type);
        state.write_live(session_id, frame);
        Some(id)
    }

    /// Sends `message` to the request stream `key`. Falls back to the live
    /// stream once that request stream has ended or its client left.
    ///
    /// Numbering and buffering are the same as for [`send`](Self::send).
    pub fn send_to(
        &self,
        session_id: &str,
        key: u64,
        message: &Message,
        event_type: Option<&str>,
    ) -> Option<String> {
        let mut streams = self.streams.lock();
        let state = streams.get_mut(session_id)?;
        let (frame, id) = self.record(session_id, state, message, event_type);

        let delivered = match state.requests.get(&key) {
            Some(channel) => channel.write(frame.clone()),
            None => false,
        };
        if !delivered {
            if state.requests.remove(&key).is_some() {
                debug!(session_id = %session_id, key, "Request stream disconnected");
            }
            state.write_live(session_id, frame);
        }
        Some(id)
    }

    /// Ends request stream `key`, keeping the buffer for a later reconnect.
    /// Returns `false` if it was already gone.
    pub fn end_request(&self, session_id: &str, key: u64) -> bool {
        self.streams
            .lock()
            .get_mut(session_id)
            .is_some_and(|state| state.requests.remove(&key).is_some())
    }

    /// Drops everything held for the session. Returns `false` if nothing was.
    pub fn close(&self, session_id: &str) -> bool {
        let removed = self.streams.lock().remove(session_id).is_some();
        if removed {
            debug!(session_id = %session_id, "Event stream closed");
        }
        removed
    }

    /// Closes every stream.
    pub fn close_all(&self) {
        let drained: Vec<_> = self.streams.lock().drain().collect();
        if !drained.is_empty() {
            info!(count = drained.len(), "Closing event streams");
        }
    }

    /// Whether the session has a connected live stream.
    pub fn is_active(&self, session_id: &str) -> bool {
        self.streams
            .lock()
            .get(session_id)
            .is_some_and(StreamState::is_active)
    }

    /// Number of request streams the session has open.
    pub fn request_streams(&self, session_id: &str) -> usize {
        self.streams
            .lock()
            .get(session_id)
            .map_or(0, |s| s.requests.len())
    }

    /// The session's last assigned sequence.
    pub fn sequence(&self, session_id: &str) -> Option<u64> {
        self.streams.lock().get(session_id).map(|s| s.sequence)
    }

    /// Snapshot of the session's replay buffer, oldest first.
    pub fn buffered(&self, session_id: &str) -> Vec<BufferedEvent> {
        self.streams
            .lock()
            .get(session_id)
            .map(|s| s.buffer.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of sessions with stream state.
    pub fn len(&self) -> usize {
        self.streams.lock().len()
    }

    /// Whether no session has stream state.
    pub fn is_empty(&self) -> bool {
        self.streams.lock().is_empty()
    }
}

/// Delivers server-initiated messages of one session as `message` events.
pub struct SessionPublisher {
    streams: Arc<EventStreamManager>,
    session_id: String,
    request_stream: Option<u64>,
}

impl SessionPublisher {
    /// Publishes to the session's live stream.
    pub fn new(streams: Arc<EventStreamManager>, session_id: impl Into<String>) -> Self {
        Self {
            streams,
            session_id: session_id.into(),
            request_stream: None,
        }
    }

    /// Publishes to request stream `key`, falling back to the live stream.
    pub fn for_request(
        streams: Arc<EventStreamManager>,
        session_id: impl Into<String>,
        key: u64,
    ) -> Self {
        Self {
            request_stream: Some(key),
            ..Self::new(streams, session_id)
        }
    }
}

#[async_trait]
impl Publisher for SessionPublisher {
    async fn publish(&self, message: Message) -> ConduitResult<()> {
        let sent = match self.request_stream {
            Some(key) => self
                .streams
                .send_to(&self.session_id, key, &message, Some("message")),
            None => self.streams.send(&self.session_id, &message, Some("message")),
        };
        if sent.is_none() {
            debug!(session_id = %self.session_id, "No event stream, message dropped");
        }
        Ok(())
    }
}
