//! Read-only status lookup for clients polling a request.

use crate::error::{PipelineError, Result};
use crate::request_store::{RequestStatus, RequestStore};
use serde::Serialize;
use std::sync::Arc;

/// What a polling client sees of a request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusView {
    pub status: RequestStatus,
    pub zip_url: Option<String>,
    pub error_message: Option<String>,
}

/// Read-only status lookups
pub struct StatusQuery {
    store: Arc<dyn RequestStore>,
}

impl StatusQuery {
    pub fn new(store: Arc<dyn RequestStore>) -> Self {
        Self { store }
    }

    /// Current status of a request; `NotFound` when the id is unknown
    pub async fn get_status(&self, request_id: &str) -> Result<StatusView> {
        let request = self
            .store
            .get_by_id(request_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(request_id.to_string()))?;

        Ok(StatusView {
            status: request.status,
            zip_url: request.zip_url,
            error_message: request.error_message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request_store::{NewUserRequest, RequestPatch};
    use crate::testing::MemoryRequestStore;

    #[tokio::test]
    async fn test_unknown_request_is_not_found() {
        let query = StatusQuery::new(Arc::new(MemoryRequestStore::new()));

        let result = query.get_status("missing").await;

        assert!(matches!(result, Err(PipelineError::NotFound(id)) if id == "missing"));
    }

    #[tokio::test]
    async fn test_terminal_status_is_stable() {
        let store = Arc::new(MemoryRequestStore::new());
        store
            .create(&NewUserRequest {
                id: "r1".to_string(),
                email: "a@b.com".to_string(),
                event_name: "evt1".to_string(),
            })
            .await
            .unwrap();
        store
            .update_fields("r1", &RequestPatch::failed("Face matching failed: exit 1"))
            .await
            .unwrap();
        let query = StatusQuery::new(store);

        let first = query.get_status("r1").await.unwrap();
        let second = query.get_status("r1").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.status, RequestStatus::Error);
        assert_eq!(first.error_message.as_deref(), Some("Face matching failed: exit 1"));
        assert_eq!(first.zip_url, None);
    }
}
