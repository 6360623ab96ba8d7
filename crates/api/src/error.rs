//! HTTP error mapping

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use inference_engine::InferenceError;
use orchestrator::{OrchestratorError, PipelineError};
use serde_json::json;
use storage::StorageError;
use thiserror::Error;

/// Errors returned by request handlers, rendered as `{"error": "..."}`
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),
    #[error("No image was uploaded")]
    UploadMissing,
    #[error("{0}")]
    BadRequest(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            ApiError::UploadMissing => (StatusCode::BAD_REQUEST, self.to_string()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "An internal error occurred".to_string(),
                )
            }
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound(what) => ApiError::NotFound(format!("{} not found", what)),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(e: OrchestratorError) -> Self {
        match e {
            OrchestratorError::JobNotFound(_) => ApiError::NotFound(e.to_string()),
            OrchestratorError::Storage(inner) => inner.into(),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<InferenceError> for ApiError {
    fn from(e: InferenceError) -> Self {
        match e {
            InferenceError::ModelNotFound { .. } => ApiError::NotFound(e.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

/// Failures while assembling or serving the application
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
    #[error("Invalid rate limit: {0}")]
    RateLimit(String),
    #[error("Media URL path '{0}' must name a sub-path, not the root")]
    MediaPath(String),
    #[error("Recovering pending jobs failed: {0}")]
    Recovery(#[from] OrchestratorError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn body_json(error: ApiError) -> (StatusCode, serde_json::Value) {
        let response = error.into_response();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_status_codes() {
        let (status, body) = body_json(ApiError::UploadMissing).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "No image was uploaded");

        let (status, _) = body_json(ApiError::NotFound("Model 3 not found".into())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = body_json(ApiError::Internal("disk full".into())).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "An internal error occurred");
    }

    #[test]
    fn test_error_conversions() {
        assert!(matches!(
            ApiError::from(OrchestratorError::JobNotFound(9)),
            ApiError::NotFound(_)
        ));
        assert!(matches!(
            ApiError::from(StorageError::DatabaseError("locked".into())),
            ApiError::Internal(_)
        ));
        assert!(matches!(
            ApiError::from(InferenceError::ModelNotFound {
                key: "nitride".into(),
                path: "models/nitride.onnx".into()
            }),
            ApiError::NotFound(_)
        ));
    }
}
