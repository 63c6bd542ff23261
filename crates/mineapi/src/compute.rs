use crate::{ApiError, ApiErrorKind};

/// The four control-plane operations the coordinator needs: peer
/// discovery for leader election, plus the operator's scaling actions.
/// Any orchestrator that can answer these suffices; a cloud binding
/// lives outside this tree.
#[allow(async_fn_in_trait)]
pub trait ComputeProvider: Send + Sync {
    async fn list_worker_ids(&self) -> Result<Vec<String>, ApiError>;

    async fn launch(&self, count: usize) -> Result<(), ApiError> {
        let _ = count;
        Err(ApiError::new(
            ApiErrorKind::Unsupported,
            "this compute provider cannot launch workers",
        ))
    }

    async fn set_desired_count(&self, count: usize) -> Result<(), ApiError> {
        let _ = count;
        Err(ApiError::new(
            ApiErrorKind::Unsupported,
            "this compute provider cannot scale workers",
        ))
    }

    async fn terminate(&self, worker_ids: &[String]) -> Result<(), ApiError> {
        let _ = worker_ids;
        Err(ApiError::new(
            ApiErrorKind::Unsupported,
            "this compute provider cannot terminate workers",
        ))
    }
}

/// Fixed peer list from configuration, for fleets managed outside the
/// coordinator (and for tests).
#[derive(Clone, Debug, Default)]
pub struct StaticComputeProvider {
    pub worker_ids: Vec<String>,
}

impl StaticComputeProvider {
    pub fn new(worker_ids: Vec<String>) -> Self {
        Self { worker_ids }
    }
}

impl ComputeProvider for StaticComputeProvider {
    async fn list_worker_ids(&self) -> Result<Vec<String>, ApiError> {
        Ok(self.worker_ids.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_provider_lists_and_rejects_scaling() {
        let provider = StaticComputeProvider::new(vec!["i-0b".to_string(), "i-0a".to_string()]);
        assert_eq!(provider.list_worker_ids().await.unwrap().len(), 2);
        let err = provider.set_desired_count(5).await.unwrap_err();
        assert_eq!(err.kind, ApiErrorKind::Unsupported);
    }
}
