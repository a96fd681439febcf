use crate::request_store::StoreError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Failures of the request pipeline.
///
/// Once a submission has been accepted these never reach the client directly;
/// they are recorded on the request row and surfaced through status polling.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("No frames received for request {0}")]
    NoFrames(String),

    #[error("Face matching failed: {0}")]
    EngineFailure(String),

    #[error("Face matching timed out after {}s", .0.as_secs())]
    EngineTimeout(Duration),

    #[error("Packaging failed: {0}")]
    PackagingFailure(String),

    #[error("Delivery failed: {0}")]
    DeliveryFailure(String),

    #[error("Request not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    StoreUnavailable(#[from] StoreError),

    #[error("Request {0} was cancelled")]
    Cancelled(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// JSON error body returned by the ingress endpoints
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub status: &'static str,
    pub message: String,
}

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        let (code, status) = match &self {
            PipelineError::InvalidInput(_) | PipelineError::NoFrames(_) => {
                (StatusCode::BAD_REQUEST, "error")
            }
            // Never conflated with a real request status
            PipelineError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            PipelineError::StoreUnavailable(StoreError::Duplicate(_)) => {
                (StatusCode::CONFLICT, "error")
            }
            PipelineError::StoreUnavailable(e) => {
                tracing::error!(error = %e, "Request store error");
                (StatusCode::SERVICE_UNAVAILABLE, "error")
            }
            other => {
                tracing::error!(error = %other, "Internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, "error")
            }
        };

        let body = Json(ErrorBody {
            status,
            message: self.to_string(),
        });
        (code, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_maps_to_404() {
        let response = PipelineError::NotFound("r1".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_duplicate_maps_to_conflict() {
        let error: PipelineError = StoreError::Duplicate("r1".to_string()).into();
        assert_eq!(error.into_response().status(), StatusCode::CONFLICT);
    }

    #[test]
    fn test_timeout_message() {
        let error = PipelineError::EngineTimeout(Duration::from_secs(600));
        assert_eq!(error.to_string(), "Face matching timed out after 600s");
    }
}
