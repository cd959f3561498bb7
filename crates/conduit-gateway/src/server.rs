use crate::config::HttpConfig;
use crate::headers::{
    is_json, wants_event_stream, EVENT_STREAM, LAST_EVENT_ID, PROTOCOL_VERSION as VERSION_HEADER,
    SESSION_ID,
};
use crate::middleware::{origin_middleware, OriginPolicy};
use crate::stream::{EventStream, EventStreamManager, SessionPublisher};
use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware as axum_mw,
    response::{IntoResponse, Response},
    routing::post,
    Router,
};
use conduit_core::protocol::methods;
use conduit_core::{
    codec, ConduitResult, ErrorObject, Message, RequestId, Response as RpcResponse,
    LEGACY_PROTOCOL_VERSION, PROTOCOL_VERSION,
};
use conduit_mcp::{Outcome, ProtocolEngine, RequestContext};
use conduit_session::{Session, SessionRegistry};
use futures_util::StreamExt;
use std::convert::Infallible;
use std::future::{Future, IntoFuture};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tower::ServiceBuilder;
use tracing::{debug, info, warn};

/// Shared state of the HTTP transport.
struct GatewayState {
    engine: Arc<ProtocolEngine>,
    registry: Arc<SessionRegistry>,
    streams: Arc<EventStreamManager>,
    config: HttpConfig,
    shutting_down: AtomicBool,
}

/// The HTTP transport: one endpoint, many concurrent sessions.
#[derive(Clone)]
pub struct GatewayServer {
    state: Arc<GatewayState>,
}

impl GatewayServer {
    /// Creates the transport. Nothing runs until [`serve`](Self::serve) or
    /// the [`router`](Self::router) is mounted.
    pub fn new(engine: Arc<ProtocolEngine>, config: HttpConfig) -> Self {
        let registry = Arc::new(SessionRegistry::new(config.session_ttl()));
        let streams = EventStreamManager::new(config.replay_capacity, config.keep_alive());
        Self {
            state: Arc::new(GatewayState {
                engine,
                registry,
                streams,
                config,
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    /// Live sessions.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.state.registry
    }

    /// Per-session event streams.
    pub fn streams(&self) -> &Arc<EventStreamManager> {
        &self.state.streams
    }

    /// Settings the endpoint was built with.
    pub fn config(&self) -> &HttpConfig {
        &self.state.config
    }

    /// Builds the router for the configured endpoint, origin checks included.
    pub fn router(&self) -> Router {
        let policy = Arc::new(OriginPolicy::new(self.state.config.allowed_origins.clone()));
        Router::new()
            .route(
                &self.state.config.path,
                post(handle_post)
                    .get(handle_get)
                    .delete(handle_delete)
                    .options(handle_options),
            )
            .with_state(self.state.clone())
            .layer(
                ServiceBuilder::new()
                    .layer(axum_mw::from_fn_with_state(policy, origin_middleware)),
            )
    }

    /// Starts shutdown on every session, waits for in-flight requests up to
    /// the drain timeout and closes all event streams.
    ///
    /// Returns `true` if every request finished in time.
    pub async fn shutdown(&self) -> bool {
        self.state.shutting_down.store(true, Ordering::SeqCst);
        let sessions = self.state.registry.sessions();
        let drained = self
            .state
            .engine
            .shutdown(sessions.iter().map(Arc::as_ref))
            .await;
        self.state.streams.close_all();
        drained
    }

    /// Whether [`shutdown`](Self::shutdown) has started.
    pub fn is_shutting_down(&self) -> bool {
        self.state.shutting_down.load(Ordering::SeqCst)
    }

    /// Serves on `listener` until `shutdown` resolves, running the session
    /// sweeper in the background.
    ///
    /// Connections still open one drain timeout after shutdown completed are
    /// dropped.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> ConduitResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr()?;
        let streams = self.state.streams.clone();
        let _sweeper = self
            .state
            .registry
            .spawn_sweeper(self.state.config.sweep_interval(), move |expired| {
                for id in expired {
                    streams.close(id);
                }
            });

        info!(
            addr = %addr,
            path = %self.state.config.path,
            stateless = self.state.config.stateless,
            "HTTP transport listening"
        );

        let (drained_tx, drained_rx) = oneshot::channel::<()>();
        let server = self.clone();
        let signal = async move {
            shutdown.await;
            info!("Shutdown signal received, draining");
            server.shutdown().await;
            let _ = drained_tx.send(());
        };

        let grace = self.state.engine.drain_timeout();
        let forced = async move {
            match drained_rx.await {
                Ok(()) => tokio::time::sleep(grace).await,
                Err(_) => std::future::pending().await,
            }
        };

        let serving = axum::serve(listener, self.router())
            .with_graceful_shutdown(signal)
            .into_future();
        tokio::select! {
            result = serving => result?,
            () = forced => warn!("Connections still open after drain timeout, forcing close"),
        }
        info!("HTTP transport stopped");
        Ok(())
    }
}

async fn handle_options() -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn handle_post(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let content_type = header_str(&headers, header::CONTENT_TYPE.as_str()).unwrap_or_default();
    if !is_json(content_type) {
        return (
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "Content-Type must be application/json",
        )
            .into_response();
    }

    if let Err(rejection) = check_protocol_version(&headers, &state.config) {
        return rejection;
    }

    let limit = state.config.max_body_bytes;
    let declared = header_str(&headers, header::CONTENT_LENGTH.as_str())
        .and_then(|v| v.trim().parse::<usize>().ok());
    if declared.is_some_and(|len| len > limit) {
        return payload_too_large(limit);
    }
    let bytes = match axum::body::to_bytes(body, limit).await {
        Ok(bytes) => bytes,
        Err(e) => {
            debug!(error = %e, "Failed to read request body");
            return payload_too_large(limit);
        }
    };

    let message = match codec::parse_bytes(&bytes) {
        Ok(message) => message,
        Err(failure) => {
            debug!(code = failure.error.code, "Rejected malformed message");
            return rpc_response(StatusCode::BAD_REQUEST, failure.into_response(), None);
        }
    };

    if state.shutting_down.load(Ordering::SeqCst) {
        let id = message.id().cloned().unwrap_or(RequestId::Null);
        return rpc_response(
            StatusCode::BAD_REQUEST,
            RpcResponse::error(id, ErrorObject::shutting_down()),
            None,
        );
    }

    let is_initialize =
        matches!(&message, Message::Request(r) if r.method == methods::INITIALIZE);
    let (session, minted) = match resolve_session(&state, &headers, is_initialize) {
        Ok(resolved) => resolved,
        Err(rejection) => return rejection,
    };
    let ctx = context_for(&state, &session);

    let accept = header_str(&headers, header::ACCEPT.as_str()).unwrap_or_default();
    if !state.config.stateless
        && !is_initialize
        && message.is_request()
        && wants_event_stream(accept)
    {
        return stream_request(state, session, message, ctx);
    }

    let outcome = state.engine.dispatch(message, &ctx).await;
    let keep_session = matches!(&outcome, Outcome::Reply(r) if !r.is_error());
    if minted && !keep_session {
        state.registry.destroy(session.id());
    }

    match outcome {
        Outcome::Accepted => StatusCode::ACCEPTED.into_response(),
        Outcome::Reply(response) => {
            let sid = (minted && keep_session).then(|| session.id());
            rpc_response(StatusCode::OK, response, sid)
        }
        Outcome::Rejected { id, error } => rpc_response(
            StatusCode::BAD_REQUEST,
            RpcResponse::error(id.unwrap_or(RequestId::Null), error),
            None,
        ),
        Outcome::Missing(id) | Outcome::Fault(id) => rpc_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            RpcResponse::error(id, ErrorObject::internal_error()),
            None,
        ),
    }
}

async fn handle_get(State(state): State<Arc<GatewayState>>, headers: HeaderMap) -> Response {
    let Some(last_event_id) = header_str(&headers, LAST_EVENT_ID) else {
        return (
            StatusCode::NOT_IMPLEMENTED,
            "Server-initiated event streams are not implemented",
        )
            .into_response();
    };
    if state.config.stateless {
        return (StatusCode::NOT_IMPLEMENTED, "Event streams are disabled in stateless mode")
            .into_response();
    }
    let Some(sid) = header_str(&headers, SESSION_ID) else {
        return (StatusCode::BAD_REQUEST, "Missing mcp-session-id header").into_response();
    };
    let Some(session) = state.registry.get(sid) else {
        return (StatusCode::NOT_FOUND, "Unknown session").into_response();
    };
    session.touch();
    event_stream_response(state.streams.reconnect(session.id(), last_event_id))
}

async fn handle_delete(State(state): State<Arc<GatewayState>>, headers: HeaderMap) -> Response {
    if state.config.stateless {
        return (StatusCode::METHOD_NOT_ALLOWED, "No sessions in stateless mode").into_response();
    }
    let Some(sid) = header_str(&headers, SESSION_ID) else {
        return (StatusCode::BAD_REQUEST, "Missing mcp-session-id header").into_response();
    };
    match state.registry.destroy(sid) {
        Some(session) => {
            session.lifecycle().initiate_shutdown();
            state.streams.close(sid);
            StatusCode::NO_CONTENT.into_response()
        }
        None => (StatusCode::NOT_FOUND, "Unknown session").into_response(),
    }
}

/// Answers a request over its own event stream: the handler's response and
/// anything it publishes meanwhile arrive as `message` events, then the
/// stream ends. Other streams of the session are left open.
fn stream_request(
    state: Arc<GatewayState>,
    session: Arc<Session>,
    message: Message,
    ctx: RequestContext,
) -> Response {
    if let Err(error) = session.lifecycle().check_admission(&message) {
        let id = message.id().cloned().unwrap_or(RequestId::Null);
        return rpc_response(StatusCode::BAD_REQUEST, RpcResponse::error(id, error), None);
    }

    let stream = state.streams.open_request(session.id());
    let key = stream.key();
    let publisher = SessionPublisher::for_request(state.streams.clone(), session.id(), key);
    let ctx = ctx.with_publisher(Arc::new(publisher));
    tokio::spawn(async move {
        let outcome = state.engine.dispatch(message, &ctx).await;
        if let Some(response) = outcome.into_response() {
            state.streams.send_to(
                ctx.session_id(),
                key,
                &Message::Response(response),
                Some("message"),
            );
        }
        state.streams.end_request(ctx.session_id(), key);
    });
    event_stream_response(stream)
}

fn resolve_session(
    state: &GatewayState,
    headers: &HeaderMap,
    is_initialize: bool,
) -> Result<(Arc<Session>, bool), Response> {
    if state.config.stateless {
        let session = if is_initialize {
            Session::new()
        } else {
            Session::ephemeral()
        };
        return Ok((Arc::new(session), false));
    }
    if is_initialize {
        return Ok((state.registry.create(), true));
    }

    let Some(sid) = header_str(headers, SESSION_ID) else {
        return Err((StatusCode::BAD_REQUEST, "Missing mcp-session-id header").into_response());
    };
    let Some(session) = state.registry.get(sid) else {
        debug!(session_id = %sid, "Request for unknown session");
        return Err((StatusCode::NOT_FOUND, "Unknown session").into_response());
    };
    session.touch();
    Ok((session, false))
}

fn context_for(state: &GatewayState, session: &Arc<Session>) -> RequestContext {
    let ctx = RequestContext::new(session.clone());
    if state.config.stateless {
        ctx
    } else {
        ctx.with_publisher(Arc::new(SessionPublisher::new(
            state.streams.clone(),
            session.id(),
        )))
    }
}

fn check_protocol_version(headers: &HeaderMap, config: &HttpConfig) -> Result<(), Response> {
    let version = match header_str(headers, VERSION_HEADER) {
        Some(v) => v.trim(),
        None => match config.fallback_protocol_version.as_deref() {
            Some(v) => v,
            None => {
                return Err(
                    (StatusCode::BAD_REQUEST, "Missing mcp-protocol-version header")
                        .into_response(),
                )
            }
        },
    };
    if version == PROTOCOL_VERSION || version == LEGACY_PROTOCOL_VERSION {
        Ok(())
    } else {
        warn!(version = %version, "Rejected request: unsupported protocol version");
        Err((
            StatusCode::BAD_REQUEST,
            format!("Unsupported mcp-protocol-version: {version}"),
        )
            .into_response())
    }
}

fn payload_too_large(limit: usize) -> Response {
    rpc_response(
        StatusCode::PAYLOAD_TOO_LARGE,
        RpcResponse::error(RequestId::Null, ErrorObject::payload_too_large(limit)),
        None,
    )
}

fn rpc_response(status: StatusCode, response: RpcResponse, session_id: Option<&str>) -> Response {
    let body = codec::serialize(&Message::Response(response));
    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json");

    if let Some(sid) = session_id {
        if let Ok(v) = HeaderValue::from_str(sid) {
            builder = builder.header(SESSION_ID, v);
        }
    }

    builder
        .body(Body::from(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn event_stream_response(stream: EventStream) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, EVENT_STREAM)
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(stream.map(Ok::<_, Infallible>)))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|h| h.to_str().ok())
}
