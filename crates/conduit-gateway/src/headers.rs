//! Header names and media types used by the HTTP transport.

/// Protocol version negotiated during the handshake.
pub const PROTOCOL_VERSION: &str = "mcp-protocol-version";
/// Session identifier minted on `initialize`.
pub const SESSION_ID: &str = "mcp-session-id";
/// Resume point of a reconnecting event stream.
pub const LAST_EVENT_ID: &str = "last-event-id";

/// Media type of event streams.
pub const EVENT_STREAM: &str = "text/event-stream";
/// Media type of JSON bodies.
pub const JSON: &str = "application/json";

/// Whether a `content-type` value names a JSON media type.
pub fn is_json(content_type: &str) -> bool {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    essence == JSON || (essence.starts_with("application/") && essence.ends_with("+json"))
}

/// Whether an `accept` value asks for an event stream and rules out JSON.
pub fn wants_event_stream(accept: &str) -> bool {
    let mut stream = false;
    let mut json = false;
    for part in accept.split(',') {
        let essence = part.split(';').next().unwrap_or_default().trim();
        if essence.eq_ignore_ascii_case(EVENT_STREAM) {
            stream = true;
        } else if essence.eq_ignore_ascii_case(JSON) || essence == "*/*" {
            json = true;
        }
    }
    stream && !json
}
