//! Golden snapshot management.

use std::sync::Arc;

use tracing::{info, warn};

use super::OperationWaiter;
use crate::providers::traits::{ComputeProvider, ProviderError};

/// Creates the golden snapshot once and reuses it afterwards.
#[derive(Clone)]
pub struct SnapshotOperator {
    provider: Arc<dyn ComputeProvider>,
    waiter: OperationWaiter,
}

impl SnapshotOperator {
    /// Create an operator.
    #[must_use]
    pub fn new(provider: Arc<dyn ComputeProvider>, waiter: OperationWaiter) -> Self {
        Self { provider, waiter }
    }

    /// Whether a snapshot exists.
    ///
    /// # Errors
    /// Returns any provider error other than not-found.
    pub async fn exists(&self, snapshot: &str) -> Result<bool, ProviderError> {
        match self.provider.get_snapshot(snapshot).await {
            Ok(_) => {
                info!(snapshot = %snapshot, "Snapshot already exists");
                Ok(true)
            }
            Err(ProviderError::NotFound(_)) => {
                info!(snapshot = %snapshot, "Snapshot does not exist, will create it");
                Ok(false)
            }
            Err(e) => {
                warn!(snapshot = %snapshot, error = %e, "Error checking snapshot existence");
                Err(e)
            }
        }
    }

    /// Snapshot `disk` and wait for it.
    ///
    /// # Errors
    /// Returns provider or operation errors.
    pub async fn create(&self, zone: &str, disk: &str, snapshot: &str) -> Result<(), ProviderError> {
        info!(zone = %zone, disk = %disk, snapshot = %snapshot, "Creating snapshot");
        let operation = self.provider.create_snapshot(zone, disk, snapshot).await?;
        self.waiter.wait(operation).await
    }
}
