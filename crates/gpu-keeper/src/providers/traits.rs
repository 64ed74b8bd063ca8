//! Compute provider trait and common types.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::classify::{Classify, ErrorKind};

/// Operation error codes the provider uses when a zone cannot satisfy the
/// requested machine shape.
pub const RESOURCE_EXHAUSTED_CODES: &[&str] = &[
    "ZONE_RESOURCE_POOL_EXHAUSTED",
    "ZONE_RESOURCE_POOL_EXHAUSTED_WITH_DETAILS",
];

/// Errors that can occur during compute provider operations.
#[derive(Error, Debug)]
pub enum ProviderError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// API returned an error response.
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    /// Resource not found.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Authentication error.
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The zone has no capacity left for the requested shape.
    #[error("Zone resources exhausted: {0}")]
    ResourceExhausted(String),

    /// A long-running operation finished with an error.
    #[error("Operation {operation} failed: {code} - {message}")]
    OperationFailed {
        operation: String,
        code: String,
        message: String,
    },

    /// Operation did not reach a terminal state within the poll bound.
    #[error("Operation {0} did not finish after {1} polls")]
    Timeout(String, u32),
}

impl ProviderError {
    /// Whether the provider itself rejected the request, as opposed to a
    /// transport, auth or decoding failure on our side.
    ///
    /// Zone failover moves on to the next zone for rejections and aborts
    /// for everything else.
    #[must_use]
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::Api { .. } | Self::NotFound(_) | Self::ResourceExhausted(_)
        )
    }

    /// Whether this is the provider's "no such resource" answer.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl Classify for ProviderError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Http(err) => err.kind(),
            Self::Api { status, .. } if *status == 429 || *status >= 500 => ErrorKind::Transient,
            Self::Timeout(..) => ErrorKind::Transient,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            Self::Api { .. }
            | Self::Auth(_)
            | Self::Config(_)
            | Self::Serialization(_)
            | Self::OperationFailed { .. } => ErrorKind::Fatal,
        }
    }
}

// ============================================================================
// Instance types
// ============================================================================

/// Instance (VM) status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Instance is being provisioned or staged.
    Pending,
    /// Instance is running.
    Running,
    /// Instance is stopping or suspending.
    Stopping,
    /// Instance is stopped or suspended.
    Stopped,
    /// Instance is terminated (the provider's "powered off").
    Terminated,
    /// Unknown status.
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
            Self::Terminated => write!(f, "terminated"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// A virtual machine instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    /// Numeric instance identifier.
    pub id: String,
    /// Instance name.
    pub name: String,
    /// Zone name (short form, e.g. `europe-west4-a`).
    pub zone: String,
    /// Current status.
    pub status: InstanceStatus,
    /// Machine type name.
    pub machine_type: String,
    /// External (NAT) IPv4 address of the primary interface.
    pub external_ip: Option<String>,
    /// Internal IPv4 address of the primary interface.
    pub internal_ip: Option<String>,
    /// Total number of attached accelerators.
    pub accelerator_count: u32,
    /// Name of the boot disk.
    pub boot_disk: Option<String>,
    /// When the instance was created.
    pub created_at: Option<DateTime<Utc>>,
}

impl Instance {
    /// Whether the instance is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.status == InstanceStatus::Running
    }
}

/// Service account attached to a new instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceAccount {
    /// Account email.
    pub email: String,
    /// OAuth scopes.
    pub scopes: Vec<String>,
}

/// Accelerator attachment for a new instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceleratorSpec {
    /// Accelerator type name (e.g. `nvidia-l4`).
    pub accelerator_type: String,
    /// Number of accelerators.
    pub count: u32,
}

/// Request to create a new instance booting from an existing disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceSpec {
    /// Instance name.
    pub name: String,
    /// Machine type name.
    pub machine_type: String,
    /// Name of the existing disk to boot from (auto-deleted with the instance).
    pub boot_disk: String,
    /// Accelerators to attach.
    pub accelerator: Option<AcceleratorSpec>,
    /// Network name.
    pub network: Option<String>,
    /// Subnetwork name.
    pub subnetwork: Option<String>,
    /// Network tags.
    pub tags: Vec<String>,
    /// Service account.
    pub service_account: Option<ServiceAccount>,
    /// Startup script metadata.
    pub startup_script: Option<String>,
}

// ============================================================================
// Disk and snapshot types
// ============================================================================

/// A block storage disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Disk {
    /// Disk name.
    pub name: String,
    /// Zone name.
    pub zone: String,
    /// Provider status (e.g. `READY`).
    pub status: String,
    /// Snapshot the disk was created from.
    pub source_snapshot: Option<String>,
}

/// Request to create a disk from a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskSpec {
    /// Disk name.
    pub name: String,
    /// Snapshot name.
    pub source_snapshot: String,
    /// Disk type name (e.g. `pd-ssd`).
    pub disk_type: String,
}

/// A disk snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// Snapshot name.
    pub name: String,
    /// Provider status (e.g. `READY`).
    pub status: String,
    /// Disk the snapshot was taken from.
    pub source_disk: Option<String>,
}

// ============================================================================
// Operation types
// ============================================================================

/// Where an operation lives, which decides the endpoint used to poll it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationScope {
    /// Zonal operation.
    Zone(String),
    /// Regional operation.
    Region(String),
    /// Global operation.
    Global,
}

/// Operation status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// Queued.
    Pending,
    /// In progress.
    Running,
    /// Terminal.
    Done,
}

/// One error reported by an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationErrorDetail {
    /// Error code.
    pub code: String,
    /// Error message.
    pub message: String,
}

/// A long-running provider operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    /// Operation name.
    pub name: String,
    /// Scope.
    pub scope: OperationScope,
    /// Status.
    pub status: OperationStatus,
    /// Errors, empty on success.
    pub errors: Vec<OperationErrorDetail>,
}

impl Operation {
    /// Whether the operation reached its terminal state.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.status == OperationStatus::Done
    }

    /// Whether any reported error is a zone capacity error.
    #[must_use]
    pub fn is_resource_exhausted(&self) -> bool {
        self.errors
            .iter()
            .any(|e| RESOURCE_EXHAUSTED_CODES.contains(&e.code.as_str()))
    }
}

/// Trait for compute providers.
///
/// Mutating calls return the provider operation without waiting for it;
/// see [`crate::operators::OperationWaiter`].
#[async_trait]
pub trait ComputeProvider: Send + Sync {
    // ========================================================================
    // Instance operations
    // ========================================================================

    /// Get an instance by name or numeric ID.
    async fn get_instance(&self, zone: &str, instance: &str) -> Result<Instance, ProviderError>;

    /// Start an instance. Safe to re-issue.
    async fn start_instance(&self, zone: &str, instance: &str)
        -> Result<Operation, ProviderError>;

    /// Stop an instance. Safe to re-issue.
    async fn stop_instance(&self, zone: &str, instance: &str) -> Result<Operation, ProviderError>;

    /// Create an instance.
    async fn insert_instance(
        &self,
        zone: &str,
        spec: &InstanceSpec,
    ) -> Result<Operation, ProviderError>;

    // ========================================================================
    // Disk and snapshot operations
    // ========================================================================

    /// Get a disk by name.
    async fn get_disk(&self, zone: &str, disk: &str) -> Result<Disk, ProviderError>;

    /// Create a disk.
    async fn insert_disk(&self, zone: &str, spec: &DiskSpec) -> Result<Operation, ProviderError>;

    /// Delete a disk.
    async fn delete_disk(&self, zone: &str, disk: &str) -> Result<Operation, ProviderError>;

    /// Get a snapshot by name.
    async fn get_snapshot(&self, snapshot: &str) -> Result<Snapshot, ProviderError>;

    /// Snapshot a disk.
    async fn create_snapshot(
        &self,
        zone: &str,
        disk: &str,
        snapshot: &str,
    ) -> Result<Operation, ProviderError>;

    // ========================================================================
    // Discovery
    // ========================================================================

    /// List every zone name in the project.
    async fn list_zones(&self) -> Result<Vec<String>, ProviderError>;

    /// List accelerator type names offered in a zone.
    async fn list_accelerator_types(&self, zone: &str) -> Result<Vec<String>, ProviderError>;

    /// List machine type names offered in a zone.
    async fn list_machine_types(&self, zone: &str) -> Result<Vec<String>, ProviderError>;

    // ========================================================================
    // Operations
    // ========================================================================

    /// Fetch the current state of an operation.
    async fn get_operation(
        &self,
        scope: &OperationScope,
        name: &str,
    ) -> Result<Operation, ProviderError>;
}
