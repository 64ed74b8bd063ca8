//! Zone failover: recreate the instance from the golden snapshot in the
//! first candidate zone that accepts it.
//!
//! Zones are tried strictly in order. Each trial ends in a
//! [`ZoneOutcome`]. Every failed trial deletes the disk it created, whether
//! the scan moves on to the next zone or aborts, so a failed scan leaves
//! nothing behind.

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::operators::{DiskOperator, InstanceOperator};
use crate::providers::traits::{Instance, ProviderError};

/// Resource names for one failover attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailoverNames {
    /// Disk restored from the snapshot.
    pub disk: String,
    /// Instance booting from that disk.
    pub instance: String,
}

impl FailoverNames {
    /// `{server_type}-disk-{host}-{timestamp}` and
    /// `{server_type}-instance-{host}-{timestamp}`.
    #[must_use]
    pub fn new(server_type: &str, host: &str, at: DateTime<Utc>) -> Self {
        let stamp = at.format("%Y%m%d-%H%M%S");
        Self {
            disk: format!("{server_type}-disk-{host}-{stamp}"),
            instance: format!("{server_type}-instance-{host}-{stamp}"),
        }
    }
}

/// Result of trying one zone.
#[derive(Debug)]
pub enum ZoneOutcome {
    /// The replacement instance exists.
    Created(Instance),
    /// The zone refused; its disk was cleaned up.
    Continue,
    /// An error that is not a zone-level refusal; its disk was cleaned up
    /// and scanning stops.
    Abort(ProviderError),
}

/// Runs the per-zone trials of a failover.
pub struct ZoneFailover {
    disks: DiskOperator,
    instances: InstanceOperator,
    snapshot: String,
    server_type: String,
    host: String,
}

impl ZoneFailover {
    /// Create a failover restoring from `snapshot`.
    #[must_use]
    pub fn new(
        disks: DiskOperator,
        instances: InstanceOperator,
        snapshot: impl Into<String>,
        server_type: impl Into<String>,
        host: impl Into<String>,
    ) -> Self {
        Self {
            disks,
            instances,
            snapshot: snapshot.into(),
            server_type: server_type.into(),
            host: host.into(),
        }
    }

    /// Try `zones` in order and return the first instance created.
    ///
    /// `Ok(None)` means every zone refused.
    ///
    /// # Errors
    /// Returns the first error that is not a zone-level refusal.
    pub async fn run(&self, zones: &[String]) -> Result<Option<Instance>, ProviderError> {
        for zone in zones {
            info!(zone = %zone, "Attempting to create instance");
            match self.try_zone(zone).await {
                ZoneOutcome::Created(instance) => return Ok(Some(instance)),
                ZoneOutcome::Continue => {}
                ZoneOutcome::Abort(e) => return Err(e),
            }
        }

        warn!(zones = ?zones, "No zone accepted the instance");
        Ok(None)
    }

    /// Restore a disk in `zone` and boot an instance from it.
    pub async fn try_zone(&self, zone: &str) -> ZoneOutcome {
        let names = FailoverNames::new(&self.server_type, &self.host, Utc::now());

        if let Err(e) = self.disks.prepare(zone, &names.disk, &self.snapshot).await {
            return self.reject_or_abort(zone, &names.disk, e).await;
        }

        match self.instances.create(zone, &names.instance, &names.disk).await {
            Ok(instance) => {
                info!(zone = %zone, instance_id = %instance.id, "Instance created in zone");
                ZoneOutcome::Created(instance)
            }
            Err(e) => self.reject_or_abort(zone, &names.disk, e).await,
        }
    }

    async fn reject_or_abort(&self, zone: &str, disk: &str, error: ProviderError) -> ZoneOutcome {
        let rejected = error.is_rejection();
        if rejected {
            info!(zone = %zone, error = %error, "Zone refused the instance");
        } else {
            warn!(zone = %zone, error = %error, "Unexpected error during failover");
        }

        self.disks.delete(zone, disk).await;

        if rejected {
            ZoneOutcome::Continue
        } else {
            ZoneOutcome::Abort(error)
        }
    }
}
