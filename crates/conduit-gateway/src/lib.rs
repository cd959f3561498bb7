//! Streamable HTTP transport for Conduit.
//!
//! One endpoint carries every session: `POST` for client messages, `GET` to
//! resume an event stream, `DELETE` to end a session and `OPTIONS` for
//! preflight. Origin checks and CORS run as middleware in front of it.

/// `[http]` settings.
pub mod config;
pub mod headers;
/// Origin allow-list and CORS.
pub mod middleware;
/// The endpoint and its request handling.
pub mod server;
pub mod stream;

pub use config::HttpConfig;
pub use middleware::OriginPolicy;
pub use server::GatewayServer;
pub use stream::{
    format_event, parse_event_id, BufferedEvent, EventStream, EventStreamManager,
    SessionPublisher,
};
