//! In-memory compute provider and helpers shared by the integration tests.

#![allow(dead_code)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use gpu_keeper::cache::{HandleStore, InstanceHandle, MemoryHandleStore};
use gpu_keeper::probe::LivenessProbe;
use gpu_keeper::providers::traits::{
    ComputeProvider, Disk, DiskSpec, Instance, InstanceSpec, InstanceStatus, Operation,
    OperationErrorDetail, OperationScope, OperationStatus, ProviderError, Snapshot,
};
use gpu_keeper::{InstanceLifecycleManager, KeeperConfig};

pub const PROJECT: &str = "test-project";
pub const SERVER_TYPE: &str = "translation";
pub const SNAPSHOT: &str = "translation-server-snapshot";
pub const ZONE_A: &str = "europe-west4-a";
pub const ZONE_B: &str = "europe-west4-b";
pub const ZONE_C: &str = "europe-west4-c";
pub const ACCELERATOR: &str = "nvidia-l4";
pub const MACHINE: &str = "g2-standard-4";

// =============================================================================
// Fake compute provider
// =============================================================================

/// How a zone answers an instance insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertBehavior {
    /// The instance is created.
    Accept,
    /// The insert operation ends with a zone resource exhaustion error.
    Exhausted,
    /// The insert call is rejected with a 400.
    Reject,
    /// The insert call fails authentication.
    Unauthorized,
    /// The insert operation never reaches DONE.
    Unfinished,
}

#[derive(Default)]
pub struct FakeState {
    /// Instances keyed by (zone, id).
    pub instances: HashMap<(String, String), Instance>,
    /// Disks keyed by (zone, name).
    pub disks: HashMap<(String, String), Disk>,
    pub snapshots: HashSet<String>,
    pub zones: Vec<String>,
    pub accelerators: HashMap<String, Vec<String>>,
    pub machines: HashMap<String, Vec<String>>,
    pub insert_behavior: HashMap<String, InsertBehavior>,
    /// Instance IDs whose start requests never take effect.
    pub unstartable: HashSet<String>,
    pub operations: HashMap<String, Operation>,
    pub calls: HashMap<&'static str, usize>,
    next_id: u64,
}

#[derive(Default, Clone)]
pub struct FakeCompute {
    state: Arc<Mutex<FakeState>>,
}

impl FakeCompute {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn calls(&self, method: &str) -> usize {
        self.state().calls.get(method).copied().unwrap_or(0)
    }

    /// Add a zone offering the given accelerator and machine types.
    pub fn add_zone(&self, zone: &str, accelerators: &[&str], machines: &[&str]) {
        let mut state = self.state();
        state.zones.push(zone.to_string());
        state.accelerators.insert(
            zone.to_string(),
            accelerators.iter().map(ToString::to_string).collect(),
        );
        state.machines.insert(
            zone.to_string(),
            machines.iter().map(ToString::to_string).collect(),
        );
    }

    /// Add a zone offering the default GPU shape.
    pub fn add_gpu_zone(&self, zone: &str) {
        self.add_zone(zone, &[ACCELERATOR], &[MACHINE]);
    }

    pub fn set_insert_behavior(&self, zone: &str, behavior: InsertBehavior) {
        self.state()
            .insert_behavior
            .insert(zone.to_string(), behavior);
    }

    pub fn add_snapshot(&self, name: &str) {
        self.state().snapshots.insert(name.to_string());
    }

    pub fn has_snapshot(&self, name: &str) -> bool {
        self.state().snapshots.contains(name)
    }

    /// Add an instance with a boot disk and one accelerator.
    pub fn add_instance(&self, zone: &str, id: &str, status: InstanceStatus) -> Instance {
        let boot_disk = format!("{id}-boot");
        let instance = Instance {
            id: id.to_string(),
            name: format!("{id}-name"),
            zone: zone.to_string(),
            status,
            machine_type: MACHINE.to_string(),
            external_ip: Some("34.90.0.1".to_string()),
            internal_ip: Some("10.164.0.1".to_string()),
            accelerator_count: 1,
            boot_disk: Some(boot_disk.clone()),
            created_at: None,
        };
        let mut state = self.state();
        state.disks.insert(
            (zone.to_string(), boot_disk.clone()),
            Disk {
                name: boot_disk,
                zone: zone.to_string(),
                status: "READY".to_string(),
                source_snapshot: None,
            },
        );
        state
            .instances
            .insert((zone.to_string(), id.to_string()), instance.clone());
        instance
    }

    pub fn set_accelerators(&self, zone: &str, id: &str, count: u32) {
        if let Some(instance) = self
            .state()
            .instances
            .get_mut(&(zone.to_string(), id.to_string()))
        {
            instance.accelerator_count = count;
        }
    }

    pub fn make_unstartable(&self, id: &str) {
        self.state().unstartable.insert(id.to_string());
    }

    pub fn status(&self, zone: &str, id: &str) -> Option<InstanceStatus> {
        self.state()
            .instances
            .get(&(zone.to_string(), id.to_string()))
            .map(|i| i.status)
    }

    /// Names of the disks in a zone.
    pub fn disks_in(&self, zone: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .state()
            .disks
            .keys()
            .filter(|(z, _)| z == zone)
            .map(|(_, name)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Instances in a zone.
    pub fn instances_in(&self, zone: &str) -> Vec<Instance> {
        self.state()
            .instances
            .values()
            .filter(|i| i.zone == zone)
            .cloned()
            .collect()
    }

    fn record(state: &mut FakeState, method: &'static str) {
        *state.calls.entry(method).or_insert(0) += 1;
    }

    fn operation(state: &mut FakeState, zone: &str, errors: Vec<OperationErrorDetail>) -> Operation {
        state.next_id += 1;
        let op = Operation {
            name: format!("operation-{}", state.next_id),
            scope: OperationScope::Zone(zone.to_string()),
            status: OperationStatus::Done,
            errors,
        };
        state.operations.insert(op.name.clone(), op.clone());
        op
    }

    fn find_instance<'a>(
        state: &'a mut FakeState,
        zone: &str,
        instance: &str,
    ) -> Result<&'a mut Instance, ProviderError> {
        state
            .instances
            .iter_mut()
            .find(|((z, id), i)| z == zone && (id == instance || i.name == instance))
            .map(|(_, i)| i)
            .ok_or_else(|| ProviderError::NotFound(format!("instance {zone}/{instance}")))
    }
}

#[async_trait]
impl ComputeProvider for FakeCompute {
    async fn get_instance(&self, zone: &str, instance: &str) -> Result<Instance, ProviderError> {
        let mut state = self.state();
        Self::record(&mut state, "get_instance");
        Self::find_instance(&mut state, zone, instance).map(|i| i.clone())
    }

    async fn start_instance(&self, zone: &str, instance: &str) -> Result<Operation, ProviderError> {
        let mut state = self.state();
        Self::record(&mut state, "start_instance");
        let unstartable = state.unstartable.clone();
        let found = Self::find_instance(&mut state, zone, instance)?;
        if unstartable.contains(&found.id) {
            return Ok(Self::operation(
                &mut state,
                zone,
                vec![OperationErrorDetail {
                    code: "ZONE_RESOURCE_POOL_EXHAUSTED".to_string(),
                    message: "The zone does not have enough resources".to_string(),
                }],
            ));
        }
        found.status = InstanceStatus::Running;
        Ok(Self::operation(&mut state, zone, Vec::new()))
    }

    async fn stop_instance(&self, zone: &str, instance: &str) -> Result<Operation, ProviderError> {
        let mut state = self.state();
        Self::record(&mut state, "stop_instance");
        Self::find_instance(&mut state, zone, instance)?.status = InstanceStatus::Terminated;
        Ok(Self::operation(&mut state, zone, Vec::new()))
    }

    async fn insert_instance(
        &self,
        zone: &str,
        spec: &InstanceSpec,
    ) -> Result<Operation, ProviderError> {
        let mut state = self.state();
        Self::record(&mut state, "insert_instance");

        match state
            .insert_behavior
            .get(zone)
            .copied()
            .unwrap_or(InsertBehavior::Accept)
        {
            InsertBehavior::Accept => {}
            InsertBehavior::Exhausted => {
                return Ok(Self::operation(
                    &mut state,
                    zone,
                    vec![OperationErrorDetail {
                        code: "ZONE_RESOURCE_POOL_EXHAUSTED_WITH_DETAILS".to_string(),
                        message: format!("{zone} does not have enough resources"),
                    }],
                ));
            }
            InsertBehavior::Reject => {
                return Err(ProviderError::Api {
                    status: 400,
                    message: "Invalid value for field 'resource.guestAccelerators'".to_string(),
                });
            }
            InsertBehavior::Unauthorized => {
                return Err(ProviderError::Auth("Request had invalid credentials".to_string()));
            }
            InsertBehavior::Unfinished => {
                return Err(ProviderError::Timeout(format!("operation-insert-{}", spec.name), 720));
            }
        }

        if !state
            .disks
            .contains_key(&(zone.to_string(), spec.boot_disk.clone()))
        {
            return Err(ProviderError::NotFound(format!("disk {}", spec.boot_disk)));
        }

        state.next_id += 1;
        let id = format!("{}", 9_000_000 + state.next_id);
        let instance = Instance {
            id: id.clone(),
            name: spec.name.clone(),
            zone: zone.to_string(),
            status: InstanceStatus::Running,
            machine_type: spec.machine_type.clone(),
            external_ip: Some(format!("35.204.0.{}", state.next_id % 250)),
            internal_ip: Some("10.164.0.9".to_string()),
            accelerator_count: spec.accelerator.as_ref().map_or(0, |a| a.count),
            boot_disk: Some(spec.boot_disk.clone()),
            created_at: None,
        };
        state.instances.insert((zone.to_string(), id), instance);
        Ok(Self::operation(&mut state, zone, Vec::new()))
    }

    async fn get_disk(&self, zone: &str, disk: &str) -> Result<Disk, ProviderError> {
        let mut state = self.state();
        Self::record(&mut state, "get_disk");
        state
            .disks
            .get(&(zone.to_string(), disk.to_string()))
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(format!("disk {zone}/{disk}")))
    }

    async fn insert_disk(&self, zone: &str, spec: &DiskSpec) -> Result<Operation, ProviderError> {
        let mut state = self.state();
        Self::record(&mut state, "insert_disk");
        if !state.snapshots.contains(&spec.source_snapshot) {
            return Err(ProviderError::NotFound(format!(
                "snapshot {}",
                spec.source_snapshot
            )));
        }
        state.disks.insert(
            (zone.to_string(), spec.name.clone()),
            Disk {
                name: spec.name.clone(),
                zone: zone.to_string(),
                status: "READY".to_string(),
                source_snapshot: Some(spec.source_snapshot.clone()),
            },
        );
        Ok(Self::operation(&mut state, zone, Vec::new()))
    }

    async fn delete_disk(&self, zone: &str, disk: &str) -> Result<Operation, ProviderError> {
        let mut state = self.state();
        Self::record(&mut state, "delete_disk");
        state
            .disks
            .remove(&(zone.to_string(), disk.to_string()))
            .ok_or_else(|| ProviderError::NotFound(format!("disk {zone}/{disk}")))?;
        Ok(Self::operation(&mut state, zone, Vec::new()))
    }

    async fn get_snapshot(&self, snapshot: &str) -> Result<Snapshot, ProviderError> {
        let mut state = self.state();
        Self::record(&mut state, "get_snapshot");
        if state.snapshots.contains(snapshot) {
            Ok(Snapshot {
                name: snapshot.to_string(),
                status: "READY".to_string(),
                source_disk: None,
            })
        } else {
            Err(ProviderError::NotFound(format!("snapshot {snapshot}")))
        }
    }

    async fn create_snapshot(
        &self,
        zone: &str,
        disk: &str,
        snapshot: &str,
    ) -> Result<Operation, ProviderError> {
        let mut state = self.state();
        Self::record(&mut state, "create_snapshot");
        if !state
            .disks
            .contains_key(&(zone.to_string(), disk.to_string()))
        {
            return Err(ProviderError::NotFound(format!("disk {zone}/{disk}")));
        }
        state.snapshots.insert(snapshot.to_string());
        Ok(Self::operation(&mut state, zone, Vec::new()))
    }

    async fn list_zones(&self) -> Result<Vec<String>, ProviderError> {
        let mut state = self.state();
        Self::record(&mut state, "list_zones");
        Ok(state.zones.clone())
    }

    async fn list_accelerator_types(&self, zone: &str) -> Result<Vec<String>, ProviderError> {
        let mut state = self.state();
        Self::record(&mut state, "list_accelerator_types");
        Ok(state.accelerators.get(zone).cloned().unwrap_or_default())
    }

    async fn list_machine_types(&self, zone: &str) -> Result<Vec<String>, ProviderError> {
        let mut state = self.state();
        Self::record(&mut state, "list_machine_types");
        Ok(state.machines.get(zone).cloned().unwrap_or_default())
    }

    async fn get_operation(
        &self,
        _scope: &OperationScope,
        name: &str,
    ) -> Result<Operation, ProviderError> {
        let mut state = self.state();
        Self::record(&mut state, "get_operation");
        state
            .operations
            .get(name)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(format!("operation {name}")))
    }
}

// =============================================================================
// Probes
// =============================================================================

/// Probe with a fixed answer.
pub struct StaticProbe(pub bool);

#[async_trait]
impl LivenessProbe for StaticProbe {
    async fn is_alive(&self, _port: u16) -> bool {
        self.0
    }
}

// =============================================================================
// Builders
// =============================================================================

pub fn config() -> KeeperConfig {
    let mut config = KeeperConfig::new(PROJECT, SERVER_TYPE);
    config.host_tag = "testhost".to_string();
    config
}

pub fn handle(zone: &str, id: &str) -> InstanceHandle {
    InstanceHandle::new(PROJECT, zone, id, SERVER_TYPE)
}

pub struct Harness {
    pub compute: FakeCompute,
    pub store: Arc<MemoryHandleStore>,
    pub manager: Arc<InstanceLifecycleManager>,
}

impl Harness {
    /// Manager over `compute` with an optional persisted handle.
    pub fn new(compute: FakeCompute, handle: Option<InstanceHandle>) -> Self {
        Self::with(compute, handle, config(), false)
    }

    pub fn with(
        compute: FakeCompute,
        handle: Option<InstanceHandle>,
        config: KeeperConfig,
        probe_alive: bool,
    ) -> Self {
        let store = Arc::new(match handle {
            Some(handle) => MemoryHandleStore::with_handle(handle),
            None => MemoryHandleStore::new(),
        });
        let manager = InstanceLifecycleManager::new(
            Arc::new(compute.clone()),
            store.clone(),
            Arc::new(StaticProbe(probe_alive)),
            config,
        )
        .unwrap();
        Self {
            compute,
            store,
            manager: Arc::new(manager),
        }
    }

    pub fn persisted(&self) -> Option<InstanceHandle> {
        self.store.load(SERVER_TYPE).unwrap()
    }
}
