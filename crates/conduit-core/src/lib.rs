//! Core types for the Conduit protocol engine.
//!
//! This crate provides the values every other Conduit crate exchanges: the
//! JSON-RPC 2.0 message model, the codec that turns raw text into typed
//! messages (and back), the protocol error objects, and the MCP handshake
//! payloads.
//!
//! # Main types
//!
//! - [`Message`]: Tagged union of [`Request`], [`Notification`] and [`Response`].
//! - [`ErrorObject`]: JSON-RPC error payload; see [`codes`] for the taxonomy.
//! - [`codec::parse`] / [`codec::serialize`]: The wire codec.
//! - [`ConduitError`]: Unified error enum for all Conduit subsystems.
//! - [`ConduitResult`]: Convenience alias for `Result<T, ConduitError>`.

/// Text codec for JSON-RPC messages.
pub mod codec;
/// Unified error type.
pub mod error;
/// JSON-RPC 2.0 message model.
pub mod jsonrpc;
/// MCP handshake payloads and protocol constants.
pub mod protocol;

pub use codec::{parse, parse_bytes, parse_response, serialize, ParseFailure};
pub use error::{ConduitError, ConduitResult};
pub use jsonrpc::{
    codes, ErrorObject, Message, Notification, Request, RequestId, Response, ResponsePayload,
    JSONRPC_VERSION,
};
pub use protocol::{
    methods, Content, Implementation, InitializeParams, InitializeResult, ServerDescriptor,
    ToolCallResult, ToolDef, LEGACY_PROTOCOL_VERSION, PROTOCOL_VERSION,
};
