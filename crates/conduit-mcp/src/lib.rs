//! Protocol engine and stream transport for Conduit.
//!
//! [`ProtocolEngine`] implements the inbound data flow shared by every
//! transport: lifecycle admission, the handshake, and dispatch to a
//! caller-supplied [`Handler`]. [`StdioTransport`] frames messages as
//! newline-delimited JSON; [`McpClient`] drives a server subprocess over the
//! same framing.

pub mod client;
pub mod engine;
pub mod events;
pub mod stdio;

pub use client::{ClientConfig, McpClient};
pub use engine::{Handler, Outcome, ProtocolEngine, Publisher, RequestContext};
pub use events::{CloseReason, ListenerId, Listeners, TransportError, TransportEvents};
pub use stdio::{serve, ExitReason, LineBuffer, StdioSender, StdioTransport};
