//! Lifecycle of the single managed instance for a server type.
//!
//! The [`InstanceLifecycleManager`] owns the persisted [`InstanceHandle`],
//! starts and stops the instance it names, resolves its IP and relocates it
//! to another zone when it cannot be started where it is.
//!
//! ```text
//! ensure_ready
//!   ├─ no handle ──► acquire (zone scan from snapshot) ──┐  repeat until created
//!   └─ handle ─────► start ──false──► switch zones ──────┤  cooldown, then start again
//!                      │                                 │
//!                      └──true──► resolve external IP ◄──┘
//! ```

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cache::{CacheError, HandleStore, InstanceHandle};
use crate::classify::{Classify, ErrorKind};
use crate::config::KeeperConfig;
use crate::executor::InstanceControl;
use crate::failover::ZoneFailover;
use crate::operators::{DiskOperator, InstanceOperator, OperationWaiter, SnapshotOperator};
use crate::probe::LivenessProbe;
use crate::providers::traits::{ComputeProvider, Instance, ProviderError};

/// Errors from lifecycle operations.
#[derive(Error, Debug)]
pub enum LifecycleError {
    /// Provider call failed.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Handle or IP cache failed.
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// No instance is known for the server type.
    #[error("No instance handle for server type {0}")]
    NoHandle(String),

    /// The instance has no external address.
    #[error("Instance {0} has no external IP address")]
    NoExternalIp(String),

    /// The provider returned an address that does not parse.
    #[error("Invalid IP address {0:?}")]
    InvalidIp(String),

    /// The instance has no boot disk to snapshot.
    #[error("Boot disk not found on instance {0}")]
    NoBootDisk(String),

    /// Initial acquisition needs the golden snapshot.
    #[error("Snapshot {0} does not exist and there is no instance to take it from")]
    SnapshotMissing(String),
}

impl Classify for LifecycleError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Provider(e) => e.kind(),
            _ => ErrorKind::Fatal,
        }
    }
}

/// Whether a lifecycle error is worth waiting out.
fn is_recoverable(error: &LifecycleError) -> bool {
    matches!(
        error.kind(),
        ErrorKind::Transient | ErrorKind::Connectivity | ErrorKind::ResourceExhausted
    )
}

#[derive(Debug, Clone, Copy)]
enum PowerAction {
    Start,
    Stop,
}

impl PowerAction {
    fn wants_running(self) -> bool {
        matches!(self, Self::Start)
    }
}

/// Manages one instance slot for a server type.
pub struct InstanceLifecycleManager {
    provider: Arc<dyn ComputeProvider>,
    store: Arc<dyn HandleStore>,
    probe: Arc<dyn LivenessProbe>,
    config: Arc<KeeperConfig>,
    disks: DiskOperator,
    snapshots: SnapshotOperator,
    instances: InstanceOperator,
}

impl InstanceLifecycleManager {
    /// Create a manager.
    ///
    /// If the config names a seed zone and instance and nothing is
    /// persisted yet, the seed is persisted as the handle. A persisted
    /// handle always wins over the seed.
    ///
    /// # Errors
    /// Returns an error if the handle store cannot be read or written.
    pub fn new(
        provider: Arc<dyn ComputeProvider>,
        store: Arc<dyn HandleStore>,
        probe: Arc<dyn LivenessProbe>,
        config: KeeperConfig,
    ) -> Result<Self, LifecycleError> {
        let config = Arc::new(config);
        let waiter = OperationWaiter::new(provider.clone(), config.timings.operation_poll());
        let disks = DiskOperator::new(
            provider.clone(),
            waiter.clone(),
            config.disk_type.clone(),
            config.timings.disk_delete_settle,
        );
        let snapshots = SnapshotOperator::new(provider.clone(), waiter.clone());
        let instances = InstanceOperator::new(provider.clone(), waiter, config.clone());

        let manager = Self {
            provider,
            store,
            probe,
            config,
            disks,
            snapshots,
            instances,
        };
        manager.adopt_seed()?;
        Ok(manager)
    }

    fn adopt_seed(&self) -> Result<(), LifecycleError> {
        let (Some(zone), Some(instance_id)) = (&self.config.seed_zone, &self.config.seed_instance)
        else {
            return Ok(());
        };

        if let Some(existing) = self.store.load(&self.config.server_type)? {
            debug!(
                zone = %existing.zone,
                instance_id = %existing.instance_id,
                "Persisted handle takes precedence over seed"
            );
            return Ok(());
        }

        let handle = InstanceHandle::new(
            &self.config.project_id,
            zone,
            instance_id,
            &self.config.server_type,
        );
        self.store.save(&handle)?;
        info!(zone = %zone, instance_id = %instance_id, "Adopted seed instance");
        Ok(())
    }

    /// The configuration in use.
    #[must_use]
    pub fn config(&self) -> &KeeperConfig {
        &self.config
    }

    /// The persisted handle, if any.
    ///
    /// # Errors
    /// Returns an error if the store cannot be read.
    pub fn handle(&self) -> Result<Option<InstanceHandle>, LifecycleError> {
        Ok(self.store.load(&self.config.server_type)?)
    }

    fn require_handle(&self) -> Result<InstanceHandle, LifecycleError> {
        self.handle()?
            .ok_or_else(|| LifecycleError::NoHandle(self.config.server_type.clone()))
    }

    /// Current provider view of the managed instance.
    ///
    /// # Errors
    /// Returns [`LifecycleError::NoHandle`] without a handle, or provider errors.
    pub async fn instance(&self) -> Result<Instance, LifecycleError> {
        let handle = self.require_handle()?;
        Ok(self
            .instances
            .configuration(&handle.zone, &handle.instance_id)
            .await?)
    }

    /// Zones a failover would try, in order.
    ///
    /// # Errors
    /// Returns provider errors from the zone listing.
    pub async fn candidate_zones(&self) -> Result<Vec<String>, LifecycleError> {
        Ok(self.instances.candidate_zones().await?)
    }

    async fn is_running(&self, handle: &InstanceHandle) -> Result<bool, LifecycleError> {
        let instance = self
            .provider
            .get_instance(&handle.zone, &handle.instance_id)
            .await?;
        Ok(instance.is_running())
    }

    /// Whether the managed instance is running. One status check.
    ///
    /// # Errors
    /// Returns [`LifecycleError::NoHandle`] without a handle, or provider errors.
    pub async fn is_active(&self) -> Result<bool, LifecycleError> {
        let handle = self.require_handle()?;
        let active = self.is_running(&handle).await?;
        if active {
            info!(instance_id = %handle.instance_id, "Instance is active");
        }
        Ok(active)
    }

    /// Whether at least one accelerator is attached.
    ///
    /// # Errors
    /// Returns [`LifecycleError::NoHandle`] without a handle, or provider errors.
    pub async fn is_gpu_available(&self) -> Result<bool, LifecycleError> {
        Ok(self.instance().await?.accelerator_count > 0)
    }

    /// Start the managed instance and wait for it to run.
    ///
    /// Returns `Ok(false)` if it is still not running once the status poll
    /// bound is exhausted.
    ///
    /// # Errors
    /// Returns [`LifecycleError::NoHandle`] without a handle, not-found if
    /// the instance is gone, or non-recoverable provider errors.
    pub async fn start(&self) -> Result<bool, LifecycleError> {
        let handle = self.require_handle()?;
        self.drive(&handle, PowerAction::Start).await
    }

    /// Stop the managed instance and wait for it to leave RUNNING.
    ///
    /// # Errors
    /// Same as [`start`](Self::start).
    pub async fn stop(&self) -> Result<bool, LifecycleError> {
        let handle = self.require_handle()?;
        self.drive(&handle, PowerAction::Stop).await
    }

    /// Stop, then start.
    ///
    /// # Errors
    /// Same as [`start`](Self::start).
    pub async fn restart(&self) -> Result<bool, LifecycleError> {
        if !self.stop().await? {
            return Ok(false);
        }
        self.start().await
    }

    /// Issue `action` until the instance reaches the wanted state, checking
    /// status between issues.
    async fn drive(&self, handle: &InstanceHandle, action: PowerAction) -> Result<bool, LifecycleError> {
        let wanted = action.wants_running();

        if self.is_running(handle).await? == wanted {
            match action {
                PowerAction::Start => info!(instance_id = %handle.instance_id, "Instance already running"),
                PowerAction::Stop => info!(instance_id = %handle.instance_id, "Instance already stopped"),
            }
            return Ok(true);
        }

        self.issue(handle, action).await?;

        let policy = self.config.timings.status_poll();
        for (attempt, delay) in policy.schedule().enumerate() {
            if self.is_running(handle).await? == wanted {
                info!(
                    instance_id = %handle.instance_id,
                    action = ?action,
                    attempt = attempt + 1,
                    "Instance reached wanted state"
                );
                return Ok(true);
            }
            debug!(instance_id = %handle.instance_id, action = ?action, attempt = attempt + 1, "Waiting for instance");
            tokio::time::sleep(delay).await;
            self.issue(handle, action).await?;
        }

        warn!(
            instance_id = %handle.instance_id,
            action = ?action,
            polls = policy.max_retries,
            "Instance did not reach wanted state"
        );
        Ok(false)
    }

    /// Fire a start or stop without waiting on its operation. Refusals and
    /// transient errors are logged; the next status poll decides.
    async fn issue(&self, handle: &InstanceHandle, action: PowerAction) -> Result<(), LifecycleError> {
        let result = match action {
            PowerAction::Start => {
                self.provider
                    .start_instance(&handle.zone, &handle.instance_id)
                    .await
            }
            PowerAction::Stop => {
                self.provider
                    .stop_instance(&handle.zone, &handle.instance_id)
                    .await
            }
        };

        match result {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Err(e.into()),
            Err(e)
                if e.is_rejection()
                    || matches!(e.kind(), ErrorKind::Transient | ErrorKind::Connectivity) =>
            {
                warn!(instance_id = %handle.instance_id, action = ?action, error = %e, "Power request failed");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Delete the persisted handle.
    ///
    /// # Errors
    /// Returns an error if the store cannot be written.
    pub fn forget(&self) -> Result<(), LifecycleError> {
        self.store.remove(&self.config.server_type)?;
        info!(server_type = %self.config.server_type, "Forgot instance handle");
        Ok(())
    }

    /// IP of the managed instance.
    ///
    /// A cached IP is returned without further provider calls when the
    /// local probe on `port` answers, or when the instance reports active.
    /// Otherwise the instance is brought up with
    /// [`ensure_ready`](Self::ensure_ready).
    ///
    /// # Errors
    /// Returns errors from [`ensure_ready`](Self::ensure_ready) or the store.
    pub async fn get_ip(&self, port: Option<u16>) -> Result<IpAddr, LifecycleError> {
        if let Some(ip) = self.cached_ip(port).await? {
            return Ok(ip);
        }
        self.ensure_ready().await
    }

    async fn cached_ip(&self, port: Option<u16>) -> Result<Option<IpAddr>, LifecycleError> {
        let Some(handle) = self.handle()? else {
            return Ok(None);
        };
        let Some(raw) = self.store.load_ip(&handle.instance_id)? else {
            return Ok(None);
        };
        let Ok(ip) = raw.parse::<IpAddr>() else {
            warn!(instance_id = %handle.instance_id, ip = %raw, "Ignoring unparsable cached IP");
            return Ok(None);
        };

        if let Some(port) = port {
            if self.probe.is_alive(port).await {
                debug!(port, ip = %ip, "Local probe answered, using cached IP");
                return Ok(Some(ip));
            }
        }

        match self.is_running(&handle).await {
            Ok(true) => Ok(Some(ip)),
            Ok(false) => Ok(None),
            Err(e) => {
                debug!(error = %e, "Status check failed, bringing instance up");
                Ok(None)
            }
        }
    }

    /// Bring the managed instance up, acquiring or relocating it as
    /// needed, and return its external IP.
    ///
    /// Acquisition and relocation repeat until an instance runs; only
    /// non-recoverable errors end the loop early. A handle whose instance
    /// no longer exists is forgotten and a new instance acquired.
    ///
    /// # Errors
    /// Returns non-recoverable provider errors, store errors, or
    /// [`LifecycleError::SnapshotMissing`] when there is nothing to restore from.
    pub async fn ensure_ready(&self) -> Result<IpAddr, LifecycleError> {
        loop {
            if self.handle()?.is_none() {
                info!(server_type = %self.config.server_type, "No cached instance, acquiring a new one");
                self.acquire().await?;
            }

            match self.start_with_failover().await {
                Ok(()) => break,
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    warn!(error = %e, "Managed instance is gone, acquiring a new one");
                    self.forget()?;
                }
                Err(e) => return Err(e),
            }
        }

        self.resolve_ip().await
    }

    async fn resolve_ip(&self) -> Result<IpAddr, LifecycleError> {
        let instance = self.instance().await?;
        let raw = instance
            .external_ip
            .clone()
            .ok_or_else(|| LifecycleError::NoExternalIp(instance.id.clone()))?;
        let ip = raw
            .parse::<IpAddr>()
            .map_err(|_| LifecycleError::InvalidIp(raw.clone()))?;

        self.store.save_ip(&instance.id, &raw)?;
        info!(instance_id = %instance.id, ip = %ip, "Instance ready");
        Ok(ip)
    }

    /// Create a first instance from the golden snapshot, retrying after a
    /// cooldown until one zone accepts it.
    async fn acquire(&self) -> Result<(), LifecycleError> {
        loop {
            match self.switch_to_new_instance().await {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(e) if is_recoverable(&e) => {
                    warn!(error = %e, "Instance acquisition failed");
                }
                Err(e) => return Err(e),
            }
            self.cool_down(self.config.timings.acquisition_cooldown).await;
        }
    }

    async fn start_with_failover(&self) -> Result<(), LifecycleError> {
        loop {
            match self.start().await {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(e) if is_recoverable(&e) => {
                    warn!(error = %e, "Start failed");
                    self.cool_down(self.config.timings.acquisition_cooldown).await;
                    continue;
                }
                Err(e) => return Err(e),
            }

            match self.switch_to_new_instance().await {
                Ok(true) => self.cool_down(self.config.timings.failover_cooldown).await,
                Ok(false) => {
                    info!("Switching to new instance failed on all available zones");
                    self.cool_down(self.config.timings.acquisition_cooldown).await;
                }
                Err(e) if is_recoverable(&e) => {
                    warn!(error = %e, "Switching to new instance failed");
                    self.cool_down(self.config.timings.acquisition_cooldown).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn cool_down(&self, wait: std::time::Duration) {
        info!(wait_secs = wait.as_secs_f64(), "Cooling down before retrying");
        tokio::time::sleep(wait).await;
    }

    /// Recreate the instance from the golden snapshot in a candidate zone.
    ///
    /// With a current instance, the snapshot is taken from its boot disk
    /// if it does not exist yet; the instance is stopped first so the disk
    /// is consistent. Once a replacement is created its handle is
    /// persisted and the previous instance is stopped, best-effort.
    ///
    /// Returns `Ok(false)` if no zone accepted the instance.
    ///
    /// # Errors
    /// Returns non-refusal provider errors, store errors,
    /// [`LifecycleError::NoBootDisk`] or [`LifecycleError::SnapshotMissing`].
    pub async fn switch_to_new_instance(&self) -> Result<bool, LifecycleError> {
        let previous = self.handle()?;
        let snapshot = self.config.snapshot_name();

        if !self.snapshots.exists(&snapshot).await? {
            let Some(prev) = &previous else {
                return Err(LifecycleError::SnapshotMissing(snapshot));
            };
            let instance = self
                .instances
                .configuration(&prev.zone, &prev.instance_id)
                .await?;
            let boot_disk = instance
                .boot_disk
                .ok_or_else(|| LifecycleError::NoBootDisk(prev.instance_id.clone()))?;

            if !self.drive(prev, PowerAction::Stop).await? {
                warn!(instance_id = %prev.instance_id, "Instance did not stop, snapshotting anyway");
            }
            self.snapshots
                .create(&prev.zone, &boot_disk, &snapshot)
                .await?;
        }

        let zones = self.instances.candidate_zones().await?;
        let failover = ZoneFailover::new(
            self.disks.clone(),
            self.instances.clone(),
            snapshot,
            self.config.server_type.clone(),
            self.config.host_tag.clone(),
        );

        let Some(instance) = failover.run(&zones).await? else {
            return Ok(false);
        };

        let handle = InstanceHandle::new(
            &self.config.project_id,
            &instance.zone,
            &instance.id,
            &self.config.server_type,
        );
        self.store.save(&handle)?;
        info!(
            zone = %handle.zone,
            instance_id = %handle.instance_id,
            "Switched to new instance"
        );

        if let Some(prev) = previous.filter(|p| p.instance_id != handle.instance_id) {
            match self.drive(&prev, PowerAction::Stop).await {
                Ok(true) => {}
                Ok(false) => warn!(instance_id = %prev.instance_id, "Previous instance did not stop"),
                Err(e) => warn!(instance_id = %prev.instance_id, error = %e, "Could not stop previous instance"),
            }
        }

        Ok(true)
    }
}

#[async_trait]
impl InstanceControl for InstanceLifecycleManager {
    async fn stop(&self) -> Result<bool, LifecycleError> {
        InstanceLifecycleManager::stop(self).await
    }

    async fn ensure_ready(&self) -> Result<IpAddr, LifecycleError> {
        InstanceLifecycleManager::ensure_ready(self).await
    }
}
