//! Ingress error taxonomy and HTTP mapping.
//!
//! Every error kind maps to a stable machine-readable code; storage details
//! are logged server-side and never leak into responses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use hookline_core::CoreError;
use serde::Serialize;
use thiserror::Error;
use tracing::error;

/// Errors surfaced at the HTTP boundary.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Missing or unknown bearer token.
    #[error("unauthorized")]
    Unauthorized,

    /// Token resolved to a disabled source.
    #[error("source disabled")]
    SourceDisabled,

    /// Client address failed the source's CIDR allow-list.
    #[error("ip not allowed")]
    IpBlocked,

    /// Body exceeded the source's cap.
    #[error("payload too large")]
    PayloadTooLarge,

    /// Unreadable body or malformed request.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Unknown event, source, destination, or route.
    #[error("not found: {0}")]
    NotFound(String),

    /// Storage or other internal failure; details stay in the logs.
    #[error("internal error")]
    Internal,
}

impl ApiError {
    /// Stable machine-readable code.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized => "unauthorized",
            Self::SourceDisabled => "forbidden_source_disabled",
            Self::IpBlocked => "forbidden_ip",
            Self::PayloadTooLarge => "payload_too_large",
            Self::BadRequest(_) => "bad_request",
            Self::NotFound(_) => "not_found",
            Self::Internal => "internal_error",
        }
    }

    const fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::SourceDisabled | Self::IpBlocked => StatusCode::FORBIDDEN,
            Self::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail { code: self.code(), message: self.to_string() },
        };
        (self.status(), Json(body)).into_response()
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::NotFound(msg) => Self::NotFound(msg),
            CoreError::InvalidInput(msg) => Self::BadRequest(msg),
            CoreError::ConstraintViolation(_) => Self::BadRequest("conflict".to_string()),
            CoreError::Database(msg) => {
                error!(error = %msg, "storage failure");
                Self::Internal
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_taxonomy() {
        assert_eq!(ApiError::Unauthorized.code(), "unauthorized");
        assert_eq!(ApiError::SourceDisabled.code(), "forbidden_source_disabled");
        assert_eq!(ApiError::IpBlocked.code(), "forbidden_ip");
        assert_eq!(ApiError::PayloadTooLarge.code(), "payload_too_large");
        assert_eq!(ApiError::Internal.code(), "internal_error");
    }

    #[test]
    fn status_mapping() {
        assert_eq!(ApiError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError::SourceDisabled.status(), StatusCode::FORBIDDEN);
        assert_eq!(ApiError::IpBlocked.status(), StatusCode::FORBIDDEN);
        assert_eq!(ApiError::PayloadTooLarge.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(ApiError::NotFound("x".into()).status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn storage_errors_do_not_leak() {
        let err = ApiError::from(CoreError::Database("password=hunter2".to_string()));
        assert!(matches!(err, ApiError::Internal));
        assert_eq!(err.to_string(), "internal error");
    }
}
