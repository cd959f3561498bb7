//! Newline-delimited JSON over a pair of byte streams.
//!
//! Protocol frames use the outbound stream only. Diagnostics go through
//! `tracing`, whose subscriber writes to standard error.

use crate::engine::{ProtocolEngine, Publisher, RequestContext};
use crate::events::{CloseReason, TransportError, TransportEvents};
use async_trait::async_trait;
use conduit_core::{codec, ConduitResult, Message, ParseFailure};
use conduit_session::Session;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const READ_CHUNK: usize = 8192;

/// Accumulates inbound bytes and splits them into complete lines.
///
/// Lines are handed out as raw bytes; UTF-8 validation belongs to the codec.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    /// An empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `chunk` and returns every line it completed.
    ///
    /// A trailing `\r` is stripped and blank lines are dropped. The bytes
    /// after the last `\n` stay buffered.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            if let Some(line) = decode_line(&raw[..raw.len() - 1]) {
                lines.push(line);
            }
        }
        lines
    }

    /// Takes the buffered partial line, if it holds anything but whitespace.
    pub fn finish(&mut self) -> Option<Vec<u8>> {
        let raw = std::mem::take(&mut self.buf);
        decode_line(&raw)
    }

    /// Bytes waiting for a line terminator.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

fn decode_line(raw: &[u8]) -> Option<Vec<u8>> {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    if raw.iter().all(u8::is_ascii_whitespace) {
        None
    } else {
        Some(raw.to_vec())
    }
}

/// Serialized writer for the outbound stream; cheap to clone.
///
/// Each send holds the write lock for the whole line, so concurrent senders
/// never interleave bytes.
#[derive(Clone)]
pub struct StdioSender {
    writer: Arc<Mutex<Box<dyn AsyncWrite + Unpin + Send>>>,
}

impl StdioSender {
    /// Wraps an outbound stream.
    pub fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self {
            writer: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    /// Writes `message` as one `\n`-terminated line and flushes.
    pub async fn send(&self, message: &Message) -> ConduitResult<()> {
        let mut line = codec::serialize(message).into_bytes();
        line.push(b'\n');
        let mut writer = self.writer.lock().await;
        writer.write_all(&line).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Shuts the outbound stream down.
    pub async fn shutdown(&self) -> ConduitResult<()> {
        self.writer.lock().await.shutdown().await?;
        Ok(())
    }
}

#[async_trait]
impl Publisher for StdioSender {
    async fn publish(&self, message: Message) -> ConduitResult<()> {
        self.send(&message).await
    }
}

/// One inbound and one outbound byte stream carrying NDJSON frames.
pub struct StdioTransport<R> {
    reader: R,
    lines: LineBuffer,
    pending: VecDeque<Vec<u8>>,
    sender: StdioSender,
    events: Arc<TransportEvents>,
    chunk: Vec<u8>,
    eof: bool,
    closed: bool,
}

impl StdioTransport<tokio::io::Stdin> {
    /// The process's own standard input and output.
    pub fn stdio() -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout())
    }
}

impl<R> StdioTransport<R>
where
    R: AsyncRead + Unpin + Send,
{
    /// A transport reading from `reader` and writing to `writer`.
    pub fn new<W>(reader: R, writer: W) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self {
            reader,
            lines: LineBuffer::new(),
            pending: VecDeque::new(),
            sender: StdioSender::new(writer),
            events: Arc::new(TransportEvents::new()),
            chunk: vec![0; READ_CHUNK],
            eof: false,
            closed: false,
        }
    }

    /// A handle for writing frames, usable from other tasks.
    pub fn sender(&self) -> StdioSender {
        self.sender.clone()
    }

    /// The transport's message, error and close hooks.
    pub fn events(&self) -> &Arc<TransportEvents> {
        &self.events
    }

    /// Whether [`close`](Self::close) already ran.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Reads the next frame.
    ///
    /// Parse failures are returned (and emitted as error events) without
    /// ending the stream. At end of input the buffered partial line gets a
    /// final parse attempt, then `None` is returned. Safe to cancel: bytes
    /// are only consumed once a read completes.
    pub async fn recv(&mut self) -> Option<Result<Message, ParseFailure>> {
        loop {
            if let Some(line) = self.pending.pop_front() {
                return Some(self.decode(&line));
            }
            if self.eof || self.closed {
                return None;
            }
            match self.reader.read(&mut self.chunk).await {
                Ok(0) => {
                    self.eof = true;
                    if let Some(rest) = self.lines.finish() {
                        debug!(bytes = rest.len(), "Flushing unterminated final line");
                        self.pending.push_back(rest);
                    }
                }
                Ok(n) => {
                    let complete = self.lines.push(&self.chunk[..n]);
                    self.pending.extend(complete);
                }
                Err(e) => {
                    warn!(error = %e, "Failed to read inbound stream");
                    self.events.error.emit(&TransportError::Io(e.to_string()));
                    self.close(CloseReason::Error).await;
                    return None;
                }
            }
        }
    }

    fn decode(&self, line: &[u8]) -> Result<Message, ParseFailure> {
        match codec::parse_bytes(line) {
            Ok(message) => {
                self.events.message.emit(&message);
                Ok(message)
            }
            Err(failure) => {
                warn!(code = failure.error.code, error = %failure, "Discarding malformed frame");
                self.events
                    .error
                    .emit(&TransportError::Parse(failure.clone()));
                Err(failure)
            }
        }
    }

    /// Closes the transport once; later calls do nothing.
    pub async fn close(&mut self, reason: CloseReason) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.sender.shutdown().await {
            debug!(error = %e, "Outbound stream already gone");
        }
        info!(reason = ?reason, "Stdio transport closed");
        self.events.close.emit(&reason);
    }
}

/// Why [`serve`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The peer closed its end.
    EndOfInput,
    /// The shutdown future resolved.
    Signal,
}

/// Runs one session over `transport` until end of input or `shutdown`.
///
/// Messages are dispatched one at a time in arrival order. When `shutdown`
/// resolves during a dispatch, the session starts shutting down and the
/// running request gets up to the engine's drain timeout to finish.
pub async fn serve<R, F>(
    mut transport: StdioTransport<R>,
    engine: Arc<ProtocolEngine>,
    shutdown: F,
) -> ConduitResult<ExitReason>
where
    R: AsyncRead + Unpin + Send,
    F: Future<Output = ()>,
{
    let session = Arc::new(Session::new());
    let sender = transport.sender();
    let ctx = RequestContext::new(session.clone()).with_publisher(Arc::new(sender.clone()));
    tokio::pin!(shutdown);
    info!(session_id = %session.id(), "Stdio transport started");

    let mut signalled = false;
    let exit = loop {
        let next = tokio::select! {
            biased;
            () = &mut shutdown => break ExitReason::Signal,
            next = transport.recv() => next,
        };

        let reply = match next {
            None => break ExitReason::EndOfInput,
            Some(Err(failure)) => Some(failure.into_response()),
            Some(Ok(message)) => {
                let dispatch = engine.dispatch(message, &ctx);
                tokio::pin!(dispatch);
                let finished = tokio::select! {
                    outcome = &mut dispatch => Some(outcome),
                    () = &mut shutdown => None,
                };
                match finished {
                    Some(outcome) => outcome.into_response(),
                    None => {
                        signalled = true;
                        session.lifecycle().initiate_shutdown();
                        match tokio::time::timeout(engine.drain_timeout(), dispatch).await {
                            Ok(outcome) => outcome.into_response(),
                            Err(_) => {
                                warn!("Drain timeout elapsed, abandoning in-flight request");
                                None
                            }
                        }
                    }
                }
            }
        };

        if let Some(response) = reply {
            sender.send(&Message::Response(response)).await?;
        }
        if signalled {
            break ExitReason::Signal;
        }
    };

    let reason = match exit {
        ExitReason::Signal => {
            info!("Termination signal received, shutting down");
            CloseReason::Signal
        }
        ExitReason::EndOfInput => CloseReason::EndOfInput,
    };
    engine.shutdown([session.as_ref()]).await;
    transport.close(reason).await;
    Ok(exit)
}
