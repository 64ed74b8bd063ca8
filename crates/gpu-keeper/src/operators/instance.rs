//! Instance creation and zone discovery.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::OperationWaiter;
use crate::classify::ErrorKind;
use crate::config::KeeperConfig;
use crate::providers::traits::{ComputeProvider, Instance, InstanceSpec, ProviderError};
use crate::retry::{on_kinds, with_retry, RetryPolicy};

/// Creates GPU instances from failover disks and finds zones that can host
/// them.
#[derive(Clone)]
pub struct InstanceOperator {
    provider: Arc<dyn ComputeProvider>,
    waiter: OperationWaiter,
    config: Arc<KeeperConfig>,
    insert_retry: RetryPolicy,
}

impl InstanceOperator {
    /// Create an operator using the machine, accelerator and network
    /// settings from `config`.
    #[must_use]
    pub fn new(
        provider: Arc<dyn ComputeProvider>,
        waiter: OperationWaiter,
        config: Arc<KeeperConfig>,
    ) -> Self {
        let insert_retry = config.timings.insert_retry();
        Self {
            provider,
            waiter,
            config,
            insert_retry,
        }
    }

    /// The instance definition used for a new instance on `boot_disk`.
    #[must_use]
    pub fn spec(&self, name: &str, boot_disk: &str) -> InstanceSpec {
        InstanceSpec {
            name: name.to_string(),
            machine_type: self.config.machine_type.clone(),
            boot_disk: boot_disk.to_string(),
            accelerator: self.config.accelerator(),
            network: self.config.network.clone(),
            subnetwork: self.config.subnetwork.clone(),
            tags: self.config.tags.clone(),
            service_account: self.config.service_account(),
            startup_script: self.config.startup_script.clone(),
        }
    }

    /// Create an instance booting from `boot_disk` and return it.
    ///
    /// The insert is re-issued on zone resource exhaustion, as often as the
    /// insert retry policy allows.
    ///
    /// # Errors
    /// Returns the last provider or operation error.
    pub async fn create(
        &self,
        zone: &str,
        name: &str,
        boot_disk: &str,
    ) -> Result<Instance, ProviderError> {
        let spec = self.spec(name, boot_disk);
        info!(
            zone = %zone,
            instance = %name,
            machine_type = %spec.machine_type,
            boot_disk = %boot_disk,
            "Creating instance"
        );

        let provider = &self.provider;
        let waiter = &self.waiter;
        let spec = &spec;
        with_retry(
            &self.insert_retry,
            "instance insert",
            on_kinds(&[ErrorKind::ResourceExhausted]),
            || async move {
                let operation = provider.insert_instance(zone, spec).await?;
                waiter.wait(operation).await
            },
        )
        .await?;

        let instance = self.provider.get_instance(zone, name).await?;
        info!(zone = %zone, instance = %name, instance_id = %instance.id, "Instance created");
        Ok(instance)
    }

    /// Current state of an instance.
    ///
    /// # Errors
    /// Returns provider errors, including not-found.
    pub async fn configuration(&self, zone: &str, instance: &str) -> Result<Instance, ProviderError> {
        self.provider.get_instance(zone, instance).await
    }

    /// Whether `zone` offers both the configured accelerator type and
    /// machine type.
    ///
    /// # Errors
    /// Returns provider errors from either listing.
    pub async fn zone_supports(&self, zone: &str) -> Result<bool, ProviderError> {
        let accelerators = self.provider.list_accelerator_types(zone).await?;
        let machines = self.provider.list_machine_types(zone).await?;

        let has_accelerator = accelerators
            .iter()
            .any(|a| a == &self.config.accelerator_type);
        let has_machine = machines.iter().any(|m| m == &self.config.machine_type);

        debug!(zone = %zone, has_accelerator, has_machine, "Checked zone offerings");
        Ok(has_accelerator && has_machine)
    }

    /// Zones, in provider enumeration order, that offer both the
    /// accelerator and machine type and belong to the preferred region.
    ///
    /// Zones outside the region are dropped before their offerings are
    /// listed. A zone whose listing is rejected is logged and skipped.
    ///
    /// # Errors
    /// Returns errors from listing zones, and non-rejection errors from
    /// listing a zone's offerings.
    pub async fn candidate_zones(&self) -> Result<Vec<String>, ProviderError> {
        let zones = self.provider.list_zones().await?;
        let mut candidates = Vec::new();

        for zone in zones
            .into_iter()
            .filter(|z| z.starts_with(&self.config.region))
        {
            match self.zone_supports(&zone).await {
                Ok(true) => candidates.push(zone),
                Ok(false) => {}
                Err(e) if e.is_rejection() => {
                    warn!(zone = %zone, error = %e, "Could not list zone offerings, skipping");
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            region = %self.config.region,
            accelerator = %self.config.accelerator_type,
            machine_type = %self.config.machine_type,
            zones = ?candidates,
            "Found candidate zones"
        );
        Ok(candidates)
    }
}
