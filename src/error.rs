//! Request-facing error taxonomy.
//!
//! Cache backend faults never reach this module: backends degrade to
//! miss/false and count the error internally. Everything here maps to an
//! HTTP status and the uniform JSON envelope
//! `{code, message, success: false, timestamp}`.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use thiserror::Error;

/// Errors surfaced to HTTP clients.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Missing/empty object path, unknown cache mode on switch.
    #[error("{0}")]
    BadRequest(String),

    /// Origin reported no such key or bucket, or a GET yielded no body.
    #[error("{0}")]
    NotFound(String),

    /// Origin denied access to the object.
    #[error("{0}")]
    Forbidden(String),

    /// Transport failure, timeout or unclassified origin error.
    #[error("origin request failed: {0}")]
    Origin(String),

    /// Playlist bytes could not be decoded or rewritten.
    #[error("playlist rewrite failed: {0}")]
    Rewrite(String),

    /// Anything else.
    #[error("{0}")]
    Internal(String),
}

impl ProxyError {
    /// Stable machine-readable code carried in the error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "bad-request",
            Self::NotFound(_) => "not-found",
            Self::Forbidden(_) => "forbidden",
            Self::Origin(_) => "origin-failure",
            Self::Rewrite(_) => "rewrite-failure",
            Self::Internal(_) => "internal-error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Origin(_) => StatusCode::BAD_GATEWAY,
            Self::Rewrite(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "code": self.code(),
            "message": self.to_string(),
            "success": false,
            "timestamp": Utc::now().to_rfc3339(),
        });
        (self.status(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_and_statuses_line_up() {
        let cases = [
            (ProxyError::BadRequest("x".into()), "bad-request", 400),
            (ProxyError::NotFound("x".into()), "not-found", 404),
            (ProxyError::Forbidden("x".into()), "forbidden", 403),
            (ProxyError::Origin("x".into()), "origin-failure", 502),
            (ProxyError::Rewrite("x".into()), "rewrite-failure", 500),
        ];
        for (err, code, status) in cases {
            assert_eq!(err.code(), code);
            assert_eq!(err.status().as_u16(), status);
        }
    }
}
