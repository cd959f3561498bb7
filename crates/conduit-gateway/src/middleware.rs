use crate::headers;
use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::warn;

const ALLOW_METHODS: &str = "GET, POST, DELETE, OPTIONS";

/// Origin allow-list.
#[derive(Debug, Clone)]
pub struct OriginPolicy {
    allowed: Vec<String>,
}

impl OriginPolicy {
    /// Allows exactly the listed origins; `*` allows any.
    pub fn new(allowed: Vec<String>) -> Self {
        Self { allowed }
    }

    /// Returns true if `origin` matches an entry exactly or the list holds `*`.
    pub fn allows(&self, origin: &str) -> bool {
        self.allowed.iter().any(|a| a == "*" || a == origin)
    }
}

/// Origin middleware: rejects disallowed origins with 403 and decorates
/// responses to allowed ones with CORS headers.
///
/// Requests without an `Origin` header pass through untouched. An allowed
/// preflight is answered here with 204.
pub async fn origin_middleware(
    State(policy): State<Arc<OriginPolicy>>,
    request: Request,
    next: Next,
) -> Response {
    let origin = match request.headers().get(header::ORIGIN) {
        None => return next.run(request).await,
        Some(value) => match value.to_str() {
            Ok(s) if !s.trim().is_empty() => s.to_string(),
            Ok(_) => return next.run(request).await,
            Err(_) => {
                warn!("Rejected request: unreadable Origin header");
                return (StatusCode::FORBIDDEN, "Origin not allowed").into_response();
            }
        },
    };

    if !policy.allows(&origin) {
        warn!(origin = %origin, "Rejected request: origin not allowed");
        return (StatusCode::FORBIDDEN, "Origin not allowed").into_response();
    }

    let mut response = if request.method() == Method::OPTIONS {
        StatusCode::NO_CONTENT.into_response()
    } else {
        next.run(request).await
    };
    apply_cors(response.headers_mut(), &origin);
    response
}

fn apply_cors(headers: &mut HeaderMap, origin: &str) {
    let Ok(origin) = HeaderValue::from_str(origin) else {
        return;
    };
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static(ALLOW_METHODS),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static(
            "content-type, accept, mcp-protocol-version, mcp-session-id, last-event-id",
        ),
    );
    headers.insert(
        header::ACCESS_CONTROL_EXPOSE_HEADERS,
        HeaderValue::from_static(headers::SESSION_ID),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
        HeaderValue::from_static("true"),
    );
    headers.append(header::VARY, HeaderValue::from_static("origin"));
}
