//! HTTP error mapping.
//!
//! The response status is chosen by the error's `kind` alone; messages and
//! properties pass through to the body untouched.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::common::error::{CoreError, ErrorKind};

/// Route-level error wrapper.
#[derive(Debug)]
pub struct ApiError(pub CoreError);

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        ApiError(err)
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError(CoreError::from(err))
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::NotAuthorized => StatusCode::FORBIDDEN,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::ConcurrentUpdate => StatusCode::PRECONDITION_FAILED,
        ErrorKind::Duplicate => StatusCode::CONFLICT,
        ErrorKind::DockerPolicy => StatusCode::BAD_REQUEST,
        ErrorKind::BundleNotFound => StatusCode::NOT_FOUND,
        ErrorKind::BundleCorrupt => StatusCode::BAD_GATEWAY,
        ErrorKind::AcquireFailed | ErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::Cancelled => StatusCode::CONFLICT,
        ErrorKind::Execution => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(self.0.kind);
        let body = serde_json::json!({
            "error": {
                "kind": self.0.kind.as_str(),
                "message": self.0.message,
                "properties": self.0.properties,
            }
        });
        (status, Json(body)).into_response()
    }
}
