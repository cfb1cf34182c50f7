//! Error envelope for the HTTP surface.

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::{error, warn};

use crate::error::SandboxError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Sandbox(err) => match err {
                SandboxError::InvalidPath(_) => StatusCode::BAD_REQUEST,
                SandboxError::NotFound(_) => StatusCode::NOT_FOUND,
                SandboxError::AmbiguousId { .. } => StatusCode::CONFLICT,
                SandboxError::EngineUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    /// Message shown to the caller. Host filesystem paths stay in the logs.
    fn message(&self) -> String {
        match self {
            ApiError::Sandbox(SandboxError::Io { .. }) => "Internal I/O error".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(status = status.as_u16(), error = %self, "http:request failed");
        } else {
            warn!(status = status.as_u16(), error = %self, "http:request rejected");
        }
        let body = json!({ "success": false, "error": self.message() });
        (status, Json(body)).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;
