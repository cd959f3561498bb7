//! Parses and serializes JSON-RPC messages.
//!
//! Parsing validates in a fixed order and stops at the first violation:
//! syntax, top-level shape, protocol tag, method, params, identifier. Every
//! failure carries the JSON-RPC error object the peer should see.

use crate::jsonrpc::{
    ErrorObject, Message, Notification, Request, RequestId, Response, ResponsePayload,
    JSONRPC_VERSION,
};
use serde_json::{Map, Value};

/// A message that could not be parsed.
///
/// `id` is populated whenever the identifier itself was well formed, so the
/// error response can be correlated by the peer.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{error}")]
pub struct ParseFailure {
    /// The error object to report.
    pub error: ErrorObject,
    /// Identifier recovered from the input, if any.
    pub id: Option<RequestId>,
}

impl ParseFailure {
    fn new(error: ErrorObject, id: Option<RequestId>) -> Self {
        Self { error, id }
    }

    /// The error response answering the unparseable input.
    pub fn into_response(self) -> Response {
        Response::error(self.id.unwrap_or(RequestId::Null), self.error)
    }
}

/// Parses one message from `text`.
///
/// Objects without a `method` but with a `result` or `error` member are
/// parsed as responses; everything else must be a request or notification.
pub fn parse(text: &str) -> Result<Message, ParseFailure> {
    let obj = decode_object(text)?;
    let recovered = obj.get("id").and_then(RequestId::from_value);

    if !obj.contains_key("method") && (obj.contains_key("result") || obj.contains_key("error")) {
        return response_from_object(&obj).map(Message::Response);
    }

    let method = match obj.get("method") {
        Some(Value::String(m)) => m.clone(),
        Some(_) => {
            return Err(ParseFailure::new(
                ErrorObject::invalid_request("method must be a string"),
                recovered,
            ))
        }
        None => {
            return Err(ParseFailure::new(
                ErrorObject::invalid_request("missing method"),
                recovered,
            ))
        }
    };

    let params = match obj.get("params") {
        None => None,
        Some(Value::Object(p)) => Some(p.clone()),
        Some(_) => {
            return Err(ParseFailure::new(
                ErrorObject::invalid_params("params must be an object"),
                recovered,
            ))
        }
    };

    match obj.get("id") {
        None => Ok(Message::Notification(Notification { method, params })),
        Some(raw) => match RequestId::from_value(raw) {
            Some(id) => Ok(Message::Request(Request { id, method, params })),
            None => Err(ParseFailure::new(
                ErrorObject::invalid_request("id must be a string, integer or null"),
                None,
            )),
        },
    }
}

/// Parses one message from raw bytes. Bytes that are not valid UTF-8 are a
/// parse error.
pub fn parse_bytes(bytes: &[u8]) -> Result<Message, ParseFailure> {
    let text = std::str::from_utf8(bytes)
        .map_err(|_| ParseFailure::new(ErrorObject::parse_error(), None))?;
    parse(text)
}

/// Parses `text` as a response and nothing else.
pub fn parse_response(text: &str) -> Result<Response, ParseFailure> {
    let obj = decode_object(text)?;
    response_from_object(&obj)
}

/// Serializes a message to its single-line wire form.
pub fn serialize(message: &Message) -> String {
    message.to_value().to_string()
}

fn decode_object(text: &str) -> Result<Map<String, Value>, ParseFailure> {
    let value: Value = serde_json::from_str(text)
        .map_err(|_| ParseFailure::new(ErrorObject::parse_error(), None))?;

    let Value::Object(obj) = value else {
        return Err(ParseFailure::new(
            ErrorObject::invalid_request("message must be a JSON object"),
            None,
        ));
    };

    match obj.get("jsonrpc") {
        Some(Value::String(v)) if v == JSONRPC_VERSION => Ok(obj),
        _ => Err(ParseFailure::new(
            ErrorObject::invalid_request("jsonrpc must be \"2.0\""),
            obj.get("id").and_then(RequestId::from_value),
        )),
    }
}

fn response_from_object(obj: &Map<String, Value>) -> Result<Response, ParseFailure> {
    let id = match obj.get("id") {
        Some(raw) => RequestId::from_value(raw).ok_or_else(|| {
            ParseFailure::new(
                ErrorObject::invalid_request("id must be a string, integer or null"),
                None,
            )
        })?,
        None => {
            return Err(ParseFailure::new(
                ErrorObject::invalid_request("response is missing id"),
                None,
            ))
        }
    };

    let payload = match (obj.get("result"), obj.get("error")) {
        (Some(result), None) => ResponsePayload::Result(result.clone()),
        (None, Some(error)) => ResponsePayload::Error(error_from_value(error, &id)?),
        (Some(_), Some(_)) => {
            return Err(ParseFailure::new(
                ErrorObject::invalid_request("response has both result and error"),
                Some(id),
            ))
        }
        (None, None) => {
            return Err(ParseFailure::new(
                ErrorObject::invalid_request("response has neither result nor error"),
                Some(id),
            ))
        }
    };

    Ok(Response { id, payload })
}

fn error_from_value(value: &Value, id: &RequestId) -> Result<ErrorObject, ParseFailure> {
    let malformed = || {
        ParseFailure::new(
            ErrorObject::invalid_request("malformed error object"),
            Some(id.clone()),
        )
    };

    let obj = value.as_object().ok_or_else(malformed)?;
    let code = obj.get("code").and_then(Value::as_i64).ok_or_else(malformed)?;
    let message = obj
        .get("message")
        .and_then(Value::as_str)
        .ok_or_else(malformed)?;

    Ok(ErrorObject {
        code,
        message: message.to_string(),
        data: obj.get("data").cloned(),
    })
}
