use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// The literal carried in the `jsonrpc` field of every message.
pub const JSONRPC_VERSION: &str = "2.0";

/// Numeric error codes.
///
/// The standard JSON-RPC range, the implementation-defined server range
/// (`-32099..=-32000`) and the MCP request-level codes.
pub mod codes {
    /// Malformed JSON.
    pub const PARSE_ERROR: i64 = -32700;
    /// Structurally invalid message.
    pub const INVALID_REQUEST: i64 = -32600;
    /// The method does not exist.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i64 = -32602;
    /// Internal fault.
    pub const INTERNAL_ERROR: i64 = -32603;
    /// Lower bound of the implementation-defined server error range.
    pub const SERVER_ERROR_MIN: i64 = -32099;
    /// Upper bound of the implementation-defined server error range.
    pub const SERVER_ERROR_MAX: i64 = -32000;
    /// The connection is shutting down.
    pub const SHUTTING_DOWN: i64 = -32001;
    /// The handshake has not completed.
    pub const NOT_INITIALIZED: i64 = -32002;
    /// The request was cancelled by the peer.
    pub const REQUEST_CANCELLED: i64 = -32800;
    /// The payload exceeds the configured size limit.
    pub const PAYLOAD_TOO_LARGE: i64 = -32801;

    /// Whether `code` lies in the implementation-defined server range.
    pub fn is_server_error(code: i64) -> bool {
        (SERVER_ERROR_MIN..=SERVER_ERROR_MAX).contains(&code)
    }
}

/// A request identifier.
///
/// Integers never carry a fractional part. `Null` is accepted on inbound
/// requests and echoed back unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// Integer identifier.
    Number(i64),
    /// String identifier.
    String(String),
    /// Explicit `null` identifier.
    Null,
}

impl RequestId {
    /// Interprets a raw JSON value as an identifier.
    ///
    /// Returns `None` for every value that is not a string, an integer that
    /// fits in `i64`, or `null`.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(Self::String(s.clone())),
            Value::Number(n) => n.as_i64().map(Self::Number),
            Value::Null => Some(Self::Null),
            _ => None,
        }
    }

    /// The identifier as a JSON value.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Number(n) => Value::from(*n),
            Self::String(s) => Value::String(s.clone()),
            Self::Null => Value::Null,
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s}"),
            Self::Null => f.write_str("null"),
        }
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

impl From<i32> for RequestId {
    fn from(n: i32) -> Self {
        Self::Number(i64::from(n))
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

/// JSON-RPC error object.
///
/// A pure value: it never carries stack traces or internal exception text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    /// Numeric error code, see [`codes`].
    pub code: i64,
    /// Short human-readable message.
    pub message: String,
    /// Optional structured detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorObject {
    /// Creates an error object without structured data.
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Attaches structured data.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// `-32700`: the text was not valid JSON.
    pub fn parse_error() -> Self {
        Self::new(codes::PARSE_ERROR, "Parse error")
    }

    /// `-32600` with a short reason in `data.detail`.
    pub fn invalid_request(detail: impl Into<String>) -> Self {
        Self::new(codes::INVALID_REQUEST, "Invalid Request")
            .with_data(serde_json::json!({ "detail": detail.into() }))
    }

    /// `-32601` naming the unknown method.
    pub fn method_not_found(method: &str) -> Self {
        Self::new(codes::METHOD_NOT_FOUND, "Method not found")
            .with_data(serde_json::json!({ "method": method }))
    }

    /// `-32602` with a short reason in `data.detail`.
    pub fn invalid_params(detail: impl Into<String>) -> Self {
        Self::new(codes::INVALID_PARAMS, "Invalid params")
            .with_data(serde_json::json!({ "detail": detail.into() }))
    }

    /// `-32603`: the generic internal fault every Rust error collapses into.
    pub fn internal_error() -> Self {
        Self::new(codes::INTERNAL_ERROR, "Internal error")
    }

    /// The handshake has not completed for this connection.
    pub fn not_initialized() -> Self {
        Self::new(codes::NOT_INITIALIZED, "Server not initialized")
    }

    /// The connection is in its shutdown phase.
    pub fn shutting_down() -> Self {
        Self::new(codes::SHUTTING_DOWN, "Server shutting down")
    }

    /// `-32800`: the request was cancelled.
    pub fn request_cancelled() -> Self {
        Self::new(codes::REQUEST_CANCELLED, "Request cancelled")
    }

    /// `-32801`: the payload exceeded `limit` bytes.
    pub fn payload_too_large(limit: usize) -> Self {
        Self::new(codes::PAYLOAD_TOO_LARGE, "Payload too large")
            .with_data(serde_json::json!({ "limit": limit }))
    }
}

impl fmt::Display for ErrorObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

/// A call that expects a [`Response`].
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// Correlation identifier echoed by the response.
    pub id: RequestId,
    /// Method name.
    pub method: String,
    /// Named parameters, if any.
    pub params: Option<Map<String, Value>>,
}

impl Request {
    /// Creates a request.
    pub fn new(
        id: impl Into<RequestId>,
        method: impl Into<String>,
        params: Option<Map<String, Value>>,
    ) -> Self {
        Self {
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

/// A fire-and-forget call with no identifier.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    /// Method name.
    pub method: String,
    /// Named parameters, if any.
    pub params: Option<Map<String, Value>>,
}

impl Notification {
    /// Creates a notification.
    pub fn new(method: impl Into<String>, params: Option<Map<String, Value>>) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }
}

/// Either side of a response: exactly one of `result` or `error`.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponsePayload {
    /// Successful result.
    Result(Value),
    /// Protocol-level error.
    Error(ErrorObject),
}

/// The answer to a [`Request`].
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Identifier of the request being answered.
    pub id: RequestId,
    /// Result or error.
    pub payload: ResponsePayload,
}

impl Response {
    /// A successful response.
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            id,
            payload: ResponsePayload::Result(result),
        }
    }

    /// An error response.
    pub fn error(id: RequestId, error: ErrorObject) -> Self {
        Self {
            id,
            payload: ResponsePayload::Error(error),
        }
    }

    /// Whether this response carries an error.
    pub fn is_error(&self) -> bool {
        matches!(self.payload, ResponsePayload::Error(_))
    }

    /// The result value, if successful.
    pub fn result(&self) -> Option<&Value> {
        match &self.payload {
            ResponsePayload::Result(v) => Some(v),
            ResponsePayload::Error(_) => None,
        }
    }

    /// The error object, if failed.
    pub fn error_object(&self) -> Option<&ErrorObject> {
        match &self.payload {
            ResponsePayload::Result(_) => None,
            ResponsePayload::Error(e) => Some(e),
        }
    }
}

/// Any protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// A call expecting an answer.
    Request(Request),
    /// A call without an answer.
    Notification(Notification),
    /// An answer to a previous request.
    Response(Response),
}

impl Message {
    /// The method name for requests and notifications.
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request(r) => Some(&r.method),
            Self::Notification(n) => Some(&n.method),
            Self::Response(_) => None,
        }
    }

    /// The identifier for requests and responses.
    pub fn id(&self) -> Option<&RequestId> {
        match self {
            Self::Request(r) => Some(&r.id),
            Self::Notification(_) => None,
            Self::Response(r) => Some(&r.id),
        }
    }

    /// Named parameters for requests and notifications.
    pub fn params(&self) -> Option<&Map<String, Value>> {
        match self {
            Self::Request(r) => r.params.as_ref(),
            Self::Notification(n) => n.params.as_ref(),
            Self::Response(_) => None,
        }
    }

    /// Whether this message is a request.
    pub fn is_request(&self) -> bool {
        matches!(self, Self::Request(_))
    }

    /// Whether this message is a notification.
    pub fn is_notification(&self) -> bool {
        matches!(self, Self::Notification(_))
    }

    /// The wire representation as a JSON object.
    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("jsonrpc".into(), Value::String(JSONRPC_VERSION.into()));
        match self {
            Self::Request(r) => {
                obj.insert("id".into(), r.id.to_value());
                obj.insert("method".into(), Value::String(r.method.clone()));
                if let Some(params) = &r.params {
                    obj.insert("params".into(), Value::Object(params.clone()));
                }
            }
            Self::Notification(n) => {
                obj.insert("method".into(), Value::String(n.method.clone()));
                if let Some(params) = &n.params {
                    obj.insert("params".into(), Value::Object(params.clone()));
                }
            }
            Self::Response(r) => {
                obj.insert("id".into(), r.id.to_value());
                match &r.payload {
                    ResponsePayload::Result(v) => {
                        obj.insert("result".into(), v.clone());
                    }
                    ResponsePayload::Error(e) => {
                        let mut err = Map::new();
                        err.insert("code".into(), Value::from(e.code));
                        err.insert("message".into(), Value::String(e.message.clone()));
                        if let Some(data) = &e.data {
                            err.insert("data".into(), data.clone());
                        }
                        obj.insert("error".into(), Value::Object(err));
                    }
                }
            }
        }
        Value::Object(obj)
    }
}

impl Serialize for Message {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl From<Request> for Message {
    fn from(r: Request) -> Self {
        Self::Request(r)
    }
}

impl From<Notification> for Message {
    fn from(n: Notification) -> Self {
        Self::Notification(n)
    }
}

impl From<Response> for Message {
    fn from(r: Response) -> Self {
        Self::Response(r)
    }
}
