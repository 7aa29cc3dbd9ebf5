use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

use crate::middleware::RateLimitError;
use crate::reporting::ErrorReport;

/// Application-wide error types with appropriate HTTP status codes.
///
/// # Configuration Errors
///
/// `MissingEnvironment` and `ConfigError` are raised while the middleware
/// stack is being assembled and are meant to abort startup.
///
/// # Request Errors
///
/// The remaining variants are returned from handlers. Their responses carry an
/// [`ErrorReport`] extension so the error reporter can decide whether to
/// forward them.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("{0}: the deployment environment must be provided explicitly")]
    MissingEnvironment(&'static str),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error(transparent)]
    RateLimit(#[from] RateLimitError),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("Range not satisfiable: {0}")]
    RangeNotSatisfiable(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AppError {
    /// HTTP status this error is rendered with.
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::PreconditionFailed(_) => StatusCode::PRECONDITION_FAILED,
            AppError::RangeNotSatisfiable(_) => StatusCode::RANGE_NOT_SATISFIABLE,
            AppError::MissingEnvironment(_)
            | AppError::ConfigError(_)
            | AppError::RateLimit(_)
            | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            AppError::MissingEnvironment(_) | AppError::ConfigError(_) | AppError::RateLimit(_) => {
                "config_error"
            }
            AppError::BadRequest(_) => "bad_request",
            AppError::Forbidden(_) => "forbidden",
            AppError::NotFound(_) => "not_found",
            AppError::PreconditionFailed(_) => "precondition_failed",
            AppError::RangeNotSatisfiable(_) => "range_not_satisfiable",
            AppError::Internal(_) => "internal_error",
        }
    }
}

/// Error response body for API endpoints.
#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();

        // Client errors are routine; server errors get full details in the log
        // and a generic message on the wire.
        let message = if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
            "An internal error occurred. Please contact support if the issue persists."
                .to_string()
        } else {
            tracing::debug!(error = %self, status = status.as_u16(), "Request rejected");
            self.to_string()
        };

        let body = ErrorResponse {
            error: self.kind(),
            message,
        };

        let mut response = (status, axum::Json(body)).into_response();
        response
            .extensions_mut()
            .insert(ErrorReport::new(status, self.to_string()));
        response
    }
}

/// Convenience type alias for Results with AppError.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use http_body_util::BodyExt;

    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            AppError::BadRequest("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::NotFound("x".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::RangeNotSatisfiable("x".into()).status(),
            StatusCode::RANGE_NOT_SATISFIABLE
        );
        assert_eq!(
            AppError::MissingEnvironment("server").status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_missing_environment_message_names_entry_point() {
        let err = AppError::MissingEnvironment("serve_static");
        assert!(err.to_string().starts_with("serve_static:"));
    }

    #[tokio::test]
    async fn test_response_carries_error_report() {
        let response = AppError::NotFound("widget 7".into()).into_response();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let report = response.extensions().get::<ErrorReport>().unwrap();
        assert_eq!(report.status, Some(StatusCode::NOT_FOUND));
        assert!(report.message.contains("widget 7"));
        assert!(!report.uncaught);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "not_found");
    }

    #[tokio::test]
    async fn test_internal_error_hides_details() {
        let response = AppError::Internal("db password wrong".into()).into_response();

        let report = response.extensions().get::<ErrorReport>().unwrap();
        assert!(report.message.contains("db password wrong"));

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(!json["message"].as_str().unwrap().contains("password"));
    }
}
