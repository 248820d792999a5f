use axum::{
    body::Body,
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::{debug, warn};

use crate::auth::{self, TIMESTAMP_TOLERANCE};
use crate::error::Error;
use crate::state::AppState;

/// Largest control-plane body we will buffer for signature verification.
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Signed-request gate for the control plane.
///
/// Verification consumes the body, so the buffered bytes are re-installed
/// on the request before it reaches the handler.
pub async fn require_signature(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    if !state.config.auth_enabled() {
        warn!("API credentials not configured; running unauthenticated (development mode)");
        return next.run(req).await;
    }

    let headers = req.headers();
    let (Some(key), Some(timestamp), Some(signature)) = (
        header_str(headers, "x-api-key"),
        header_str(headers, "x-timestamp"),
        header_str(headers, "x-signature"),
    ) else {
        return reject("AUTH_MISSING_HEADERS", "missing authentication headers");
    };

    if key != state.config.api_key {
        return reject("AUTH_INVALID_KEY", "invalid API key");
    }

    let Ok(timestamp) = timestamp.parse::<i64>() else {
        return reject("AUTH_INVALID_TIMESTAMP", "timestamp is not a number");
    };
    if !auth::timestamp_fresh(timestamp, TIMESTAMP_TOLERANCE) {
        return reject("AUTH_TIMESTAMP_EXPIRED", "timestamp outside tolerance");
    }

    let signature = signature.to_string();
    let (parts, body) = req.into_parts();
    let bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(err) => {
            return Error::BadRequest(format!("failed to read request body: {err}")).into_response()
        }
    };

    if !auth::verify(
        parts.method.as_str(),
        parts.uri.path(),
        &bytes,
        timestamp,
        &state.config.api_secret,
        &signature,
    ) {
        return reject("AUTH_INVALID_SIGNATURE", "signature mismatch");
    }

    debug!(method = %parts.method, path = %parts.uri.path(), "request signature verified");
    let req = Request::from_parts(parts, Body::from(bytes));
    next.run(req).await
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn reject(code: &'static str, message: &'static str) -> Response {
    Error::Unauthorized { code, message }.into_response()
}
