//! Failover disks.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use super::OperationWaiter;
use crate::providers::traits::{ComputeProvider, DiskSpec, ProviderError};

/// Creates, looks up and deletes disks restored from the golden snapshot.
#[derive(Clone)]
pub struct DiskOperator {
    provider: Arc<dyn ComputeProvider>,
    waiter: OperationWaiter,
    disk_type: String,
    delete_settle: Duration,
}

impl DiskOperator {
    /// Create an operator.
    ///
    /// `delete_settle` is waited before deleting a disk, giving a failed
    /// instance insert time to release it.
    #[must_use]
    pub fn new(
        provider: Arc<dyn ComputeProvider>,
        waiter: OperationWaiter,
        disk_type: impl Into<String>,
        delete_settle: Duration,
    ) -> Self {
        Self {
            provider,
            waiter,
            disk_type: disk_type.into(),
            delete_settle,
        }
    }

    /// Whether a disk exists.
    ///
    /// # Errors
    /// Returns any provider error other than not-found.
    pub async fn exists(&self, zone: &str, disk: &str) -> Result<bool, ProviderError> {
        match self.provider.get_disk(zone, disk).await {
            Ok(_) => {
                info!(zone = %zone, disk = %disk, "Disk already exists");
                Ok(true)
            }
            Err(ProviderError::NotFound(_)) => {
                info!(zone = %zone, disk = %disk, "Disk does not exist, will create it");
                Ok(false)
            }
            Err(e) => {
                warn!(zone = %zone, disk = %disk, error = %e, "Error checking disk existence");
                Err(e)
            }
        }
    }

    /// Create a disk from a snapshot and wait for it.
    ///
    /// # Errors
    /// Returns provider or operation errors.
    pub async fn create_from_snapshot(
        &self,
        zone: &str,
        disk: &str,
        snapshot: &str,
    ) -> Result<(), ProviderError> {
        info!(zone = %zone, disk = %disk, snapshot = %snapshot, "Creating disk from snapshot");
        let spec = DiskSpec {
            name: disk.to_string(),
            source_snapshot: snapshot.to_string(),
            disk_type: self.disk_type.clone(),
        };
        let operation = self.provider.insert_disk(zone, &spec).await?;
        self.waiter.wait(operation).await
    }

    /// Make sure a disk exists, creating it from `snapshot` if needed.
    ///
    /// # Errors
    /// Returns provider or operation errors.
    pub async fn prepare(&self, zone: &str, disk: &str, snapshot: &str) -> Result<(), ProviderError> {
        if self.exists(zone, disk).await? {
            info!(zone = %zone, disk = %disk, "Using existing disk");
            return Ok(());
        }
        self.create_from_snapshot(zone, disk, snapshot).await
    }

    /// Delete a disk. Best-effort: failures are logged, never returned,
    /// so cleanup cannot mask the failure that triggered it.
    pub async fn delete(&self, zone: &str, disk: &str) {
        info!(zone = %zone, disk = %disk, "Deleting disk");
        tokio::time::sleep(self.delete_settle).await;

        let result = match self.provider.delete_disk(zone, disk).await {
            Ok(operation) => self.waiter.wait(operation).await,
            Err(ProviderError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            warn!(zone = %zone, disk = %disk, error = %e, "Disk deletion failed");
        }
    }
}
