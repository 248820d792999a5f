use std::time::Duration;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Service-level error surfaced as `{success:false, error, code?}` with the
/// matching HTTP status.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    BadRequest(String),

    #[error("{message}")]
    Unauthorized {
        code: &'static str,
        message: &'static str,
    },

    #[error("{0}")]
    NotFound(String),

    #[error("instance for {0} is not running")]
    Unavailable(String),

    #[error("Proxy error")]
    Upstream(String),

    #[error("upstream connect timed out")]
    UpstreamTimeout,

    #[error("no available ports: all {0} instance slots are in use")]
    NoCapacity(usize),

    #[error("dev server for {project_id} did not become ready within {timeout:?}")]
    StartupTimeout {
        project_id: String,
        timeout: Duration,
    },

    #[error("dependency installation failed: {0}")]
    InstallFailure(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Internal(String),
}

impl Error {
    pub fn status(&self) -> StatusCode {
        match self {
            Error::BadRequest(_) => StatusCode::BAD_REQUEST,
            Error::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Upstream(_) => StatusCode::BAD_GATEWAY,
            Error::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            Error::NoCapacity(_)
            | Error::StartupTimeout { .. }
            | Error::InstallFailure(_)
            | Error::Io(_)
            | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> Option<&'static str> {
        match self {
            Error::Unauthorized { code, .. } => Some(code),
            _ => None,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, http_status = %status, "request failed");
        }
        let mut body = json!({
            "success": false,
            "error": self.to_string(),
        });
        if let Some(code) = self.code() {
            body["code"] = json!(code);
        }
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_match_error_kinds() {
        assert_eq!(Error::BadRequest("x".into()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            Error::Unauthorized {
                code: "AUTH_INVALID_KEY",
                message: "invalid API key"
            }
            .status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(Error::NotFound("x".into()).status(), StatusCode::NOT_FOUND);
        assert_eq!(
            Error::Unavailable("p".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(Error::Upstream("refused".into()).status(), StatusCode::BAD_GATEWAY);
        assert_eq!(Error::UpstreamTimeout.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(Error::NoCapacity(20).status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn capacity_error_mentions_ports() {
        let message = Error::NoCapacity(20).to_string();
        assert!(message.contains("no available ports"));
    }
}
