//! The message pipeline shared by both transports.
//!
//! raw frame -> codec -> [`ProtocolEngine::dispatch`] (admission, handshake,
//! handler) -> [`Outcome`] -> transport-specific framing.

use async_trait::async_trait;
use conduit_core::protocol::methods;
use conduit_core::{ConduitResult, ErrorObject, Message, RequestId, Response, ServerDescriptor};
use conduit_session::{ConnectionState, InFlightTracker, Session};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Default grace period for in-flight requests during shutdown.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Pushes server-initiated messages to the peer of one session.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Sends `message` outside of any request/response cycle.
    async fn publish(&self, message: Message) -> ConduitResult<()>;
}

/// Per-message context handed to a [`Handler`].
#[derive(Clone)]
pub struct RequestContext {
    session: Arc<Session>,
    publisher: Option<Arc<dyn Publisher>>,
}

impl RequestContext {
    /// A context without a push channel.
    pub fn new(session: Arc<Session>) -> Self {
        Self {
            session,
            publisher: None,
        }
    }

    /// Attaches a push channel.
    pub fn with_publisher(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// The session this message is addressed to.
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Shortcut for `session().id()`.
    pub fn session_id(&self) -> &str {
        self.session.id()
    }

    /// Whether server-initiated messages can be delivered.
    pub fn can_publish(&self) -> bool {
        self.publisher.is_some()
    }

    /// Pushes a server-initiated message. Returns `Ok(false)` when this
    /// context has no push channel.
    pub async fn publish(&self, message: Message) -> ConduitResult<bool> {
        match &self.publisher {
            Some(p) => p.publish(message).await.map(|()| true),
            None => Ok(false),
        }
    }
}

/// Caller-supplied business logic.
///
/// Requests must return `Some(response)`. Business failures belong in the
/// result (for tools, `isError: true`); an `Err` is reported to the peer as a
/// generic internal error.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Handles one admitted message.
    async fn handle(&self, message: Message, ctx: &RequestContext)
        -> ConduitResult<Option<Response>>;
}

#[async_trait]
impl<H: Handler + ?Sized> Handler for Arc<H> {
    async fn handle(
        &self,
        message: Message,
        ctx: &RequestContext,
    ) -> ConduitResult<Option<Response>> {
        (**self).handle(message, ctx).await
    }
}

/// Result of dispatching one inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// A request was answered.
    Reply(Response),
    /// A notification or response was accepted.
    Accepted,
    /// Admission or the handshake failed.
    Rejected {
        /// Identifier of the rejected request; `None` for notifications.
        id: Option<RequestId>,
        /// The error to report.
        error: ErrorObject,
    },
    /// The handler returned nothing for a request.
    Missing(RequestId),
    /// The handler failed while processing a request.
    Fault(RequestId),
}

impl Outcome {
    /// The JSON-RPC response the peer should see, if any.
    ///
    /// Rejected notifications produce nothing; handler faults and missing
    /// responses become a generic internal error.
    pub fn into_response(self) -> Option<Response> {
        match self {
            Self::Reply(r) => Some(r),
            Self::Accepted => None,
            Self::Rejected { id: Some(id), error } => Some(Response::error(id, error)),
            Self::Rejected { id: None, .. } => None,
            Self::Missing(id) | Self::Fault(id) => {
                Some(Response::error(id, ErrorObject::internal_error()))
            }
        }
    }
}

/// Runs admission and the handshake, then forwards to the handler.
pub struct ProtocolEngine {
    server: ServerDescriptor,
    handler: Arc<dyn Handler>,
    in_flight: Arc<InFlightTracker>,
    drain_timeout: Duration,
}

impl ProtocolEngine {
    /// Creates an engine advertising `server` and delegating to `handler`.
    pub fn new(server: ServerDescriptor, handler: Arc<dyn Handler>) -> Self {
        Self {
            server,
            handler,
            in_flight: InFlightTracker::new(),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    /// Sets how long shutdown waits for in-flight requests.
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// The advertised server descriptor.
    pub fn server(&self) -> &ServerDescriptor {
        &self.server
    }

    /// How long shutdown waits for in-flight requests.
    pub fn drain_timeout(&self) -> Duration {
        self.drain_timeout
    }

    /// Requests currently inside the handler.
    pub fn in_flight(&self) -> &Arc<InFlightTracker> {
        &self.in_flight
    }

    /// Dispatches one inbound message addressed to `ctx.session()`.
    pub async fn dispatch(&self, message: Message, ctx: &RequestContext) -> Outcome {
        let lifecycle = ctx.session().lifecycle();
        let request_id = match &message {
            Message::Request(r) => Some(r.id.clone()),
            _ => None,
        };

        if let Err(error) = lifecycle.check_admission(&message) {
            debug!(
                session_id = %ctx.session_id(),
                method = message.method().unwrap_or("<response>"),
                code = error.code,
                "Message not admitted"
            );
            return Outcome::Rejected {
                id: request_id,
                error,
            };
        }

        match &message {
            Message::Request(req) if req.method == methods::INITIALIZE => {
                return match lifecycle.handle_initialize(req.params.as_ref(), &self.server) {
                    Ok(result) => match serde_json::to_value(result) {
                        Ok(value) => Outcome::Reply(Response::success(req.id.clone(), value)),
                        Err(e) => {
                            error!(error = %e, "Failed to encode initialize result");
                            Outcome::Fault(req.id.clone())
                        }
                    },
                    Err(error) => Outcome::Rejected {
                        id: Some(req.id.clone()),
                        error,
                    },
                };
            }
            Message::Request(req) if req.method == methods::PING => {
                return Outcome::Reply(Response::success(req.id.clone(), serde_json::json!({})));
            }
            Message::Notification(n)
                if n.method == methods::INITIALIZED
                    && lifecycle.state() == ConnectionState::Initializing =>
            {
                if let Err(error) = lifecycle.handle_initialized_ack() {
                    return Outcome::Rejected { id: None, error };
                }
            }
            Message::Notification(n) if n.method == methods::CANCELLED => {
                self.cancel_in_flight(n.params.as_ref(), ctx);
            }
            _ => {}
        }

        let mut guard = request_id
            .as_ref()
            .map(|id| self.in_flight.begin(ctx.session_id(), id));
        let method = message.method().map(str::to_string);
        let result = match guard.as_mut() {
            Some(guard) => tokio::select! {
                result = self.handler.handle(message, ctx) => Some(result),
                () = guard.cancelled() => None,
            },
            None => Some(self.handler.handle(message, ctx).await),
        };
        let Some(result) = result else {
            let id = request_id.unwrap_or(RequestId::Null);
            debug!(session_id = %ctx.session_id(), request_id = %id, "Handler abandoned");
            return Outcome::Reply(Response::error(id, ErrorObject::request_cancelled()));
        };

        match (request_id, result) {
            (Some(_), Ok(Some(response))) => Outcome::Reply(response),
            (Some(id), Ok(None)) => {
                error!(
                    session_id = %ctx.session_id(),
                    method = method.as_deref().unwrap_or_default(),
                    "Handler returned no response for a request"
                );
                Outcome::Missing(id)
            }
            (Some(id), Err(e)) => {
                error!(
                    session_id = %ctx.session_id(),
                    method = method.as_deref().unwrap_or_default(),
                    error = %e,
                    "Handler failed"
                );
                Outcome::Fault(id)
            }
            (None, Ok(_)) => Outcome::Accepted,
            (None, Err(e)) => {
                warn!(
                    session_id = %ctx.session_id(),
                    method = method.as_deref().unwrap_or("<response>"),
                    error = %e,
                    "Handler failed on a notification"
                );
                Outcome::Accepted
            }
        }
    }

    fn cancel_in_flight(&self, params: Option<&Map<String, Value>>, ctx: &RequestContext) {
        let Some(id) = params
            .and_then(|p| p.get("requestId"))
            .and_then(RequestId::from_value)
        else {
            debug!(session_id = %ctx.session_id(), "Cancellation without a usable requestId");
            return;
        };
        if !self.in_flight.cancel(ctx.session_id(), &id) {
            debug!(session_id = %ctx.session_id(), request_id = %id, "Nothing to cancel");
        }
    }

    /// Starts shutdown on every given session, then waits up to the drain
    /// timeout for in-flight requests. Returns `true` if they all finished.
    pub async fn shutdown<'a, I>(&self, sessions: I) -> bool
    where
        I: IntoIterator<Item = &'a Session>,
    {
        for session in sessions {
            if session.lifecycle().initiate_shutdown() {
                debug!(session_id = %session.id(), "Session shutting down");
            }
        }
        self.in_flight.wait_idle(self.drain_timeout).await
    }
}
