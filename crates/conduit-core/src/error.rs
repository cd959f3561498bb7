use crate::jsonrpc::ErrorObject;

/// A convenience `Result` alias using [`ConduitError`].
pub type ConduitResult<T> = Result<T, ConduitError>;

/// Top-level error type for the Conduit engine.
///
/// Each variant corresponds to a subsystem that can produce errors. None of
/// them is ever serialized to a peer: at a protocol boundary every variant
/// collapses into [`ErrorObject::internal_error`].
#[derive(Debug, thiserror::Error)]
pub enum ConduitError {
    /// A peer violated the protocol in a way that has no JSON-RPC answer.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// An error related to session lookup or bookkeeping.
    #[error("Session error: {0}")]
    Session(String),

    /// An error from a transport (pipe closed, socket bind failure, ...).
    #[error("Transport error: {0}")]
    Transport(String),

    /// An error raised by a caller-supplied handler.
    #[error("Handler error: {0}")]
    Handler(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// The remote peer answered a request with a JSON-RPC error.
    #[error("Remote error {}: {}", .0.code, .0.message)]
    Remote(ErrorObject),

    /// A request did not complete within its deadline.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ConduitError> for ErrorObject {
    fn from(_: ConduitError) -> Self {
        ErrorObject::internal_error()
    }
}
