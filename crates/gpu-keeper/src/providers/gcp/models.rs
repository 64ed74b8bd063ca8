//! GCP Compute Engine API request and response models.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// ============================================================================
// Instance types
// ============================================================================

/// Compute Engine instance.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GceInstance {
    /// Instance ID (uint64 encoded as a string).
    pub id: String,
    /// Instance name.
    pub name: String,
    /// Zone (URL).
    pub zone: String,
    /// Machine type (URL).
    pub machine_type: String,
    /// Status.
    pub status: String,
    /// Network interfaces.
    #[serde(default)]
    pub network_interfaces: Vec<NetworkInterface>,
    /// Disks.
    #[serde(default)]
    pub disks: Vec<AttachedDisk>,
    /// Attached accelerators.
    #[serde(default)]
    pub guest_accelerators: Vec<AcceleratorConfig>,
    /// Creation timestamp.
    pub creation_timestamp: Option<String>,
}

/// Network interface.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterface {
    /// Network (URL).
    pub network: Option<String>,
    /// Network IP (internal).
    pub network_i_p: Option<String>,
    /// Access configs (for external IP).
    #[serde(default)]
    pub access_configs: Vec<AccessConfig>,
}

/// Access configuration (external IP).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessConfig {
    /// Access type.
    #[serde(rename = "type")]
    pub access_type: Option<String>,
    /// External NAT IP.
    pub nat_i_p: Option<String>,
}

/// Attached disk.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachedDisk {
    /// Disk source (URL).
    pub source: Option<String>,
    /// Boot disk.
    pub boot: Option<bool>,
}

/// Accelerator attachment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceleratorConfig {
    /// Accelerator type (URL).
    pub accelerator_type: String,
    /// Count.
    pub accelerator_count: u32,
}

/// Create instance request.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateInstanceRequest {
    /// Instance name.
    pub name: String,
    /// Machine type (URL).
    pub machine_type: String,
    /// Disks.
    pub disks: Vec<AttachedDiskDefinition>,
    /// Network interfaces.
    pub network_interfaces: Vec<NetworkInterfaceDefinition>,
    /// Accelerators.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub guest_accelerators: Vec<AcceleratorConfig>,
    /// Network tags.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Tags>,
    /// Service accounts.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub service_accounts: Vec<ServiceAccountDefinition>,
    /// Scheduling.
    pub scheduling: Scheduling,
    /// Labels.
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
    /// Metadata.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

/// Attached disk definition for creation, pointing at an existing disk.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachedDiskDefinition {
    /// Boot disk.
    pub boot: bool,
    /// Auto delete.
    pub auto_delete: bool,
    /// Disk source (URL).
    pub source: String,
    /// Device name.
    pub device_name: String,
}

/// Network interface definition for creation.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterfaceDefinition {
    /// Network (URL).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    /// Subnetwork (URL).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subnetwork: Option<String>,
    /// Access configs.
    pub access_configs: Vec<AccessConfigDefinition>,
}

/// Access config definition.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessConfigDefinition {
    /// Access type.
    #[serde(rename = "type")]
    pub access_type: String,
    /// Name.
    pub name: String,
}

/// Network tags.
#[derive(Debug, Serialize)]
pub struct Tags {
    /// Tag values.
    pub items: Vec<String>,
}

/// Service account definition.
#[derive(Debug, Serialize)]
pub struct ServiceAccountDefinition {
    /// Email.
    pub email: String,
    /// Scopes.
    pub scopes: Vec<String>,
}

/// Scheduling options. GPU instances cannot live-migrate.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Scheduling {
    /// Host maintenance behaviour.
    pub on_host_maintenance: String,
    /// Restart after host failure.
    pub automatic_restart: bool,
    /// Preemptible.
    pub preemptible: bool,
    /// Provisioning model.
    pub provisioning_model: String,
}

impl Default for Scheduling {
    fn default() -> Self {
        Self {
            on_host_maintenance: "TERMINATE".to_string(),
            automatic_restart: true,
            preemptible: false,
            provisioning_model: "STANDARD".to_string(),
        }
    }
}

/// Metadata for instance.
#[derive(Debug, Serialize)]
pub struct Metadata {
    /// Metadata items.
    pub items: Vec<MetadataItem>,
}

/// Metadata item.
#[derive(Debug, Serialize)]
pub struct MetadataItem {
    /// Key.
    pub key: String,
    /// Value.
    pub value: String,
}

// ============================================================================
// Disk and snapshot types
// ============================================================================

/// Persistent disk.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GceDisk {
    /// Disk name.
    pub name: String,
    /// Zone (URL).
    pub zone: String,
    /// Status.
    pub status: Option<String>,
    /// Source snapshot (URL).
    pub source_snapshot: Option<String>,
}

/// Create disk request.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDiskRequest {
    /// Disk name.
    pub name: String,
    /// Source snapshot (URL).
    pub source_snapshot: String,
    /// Disk type (URL).
    #[serde(rename = "type")]
    pub disk_type: String,
}

/// Snapshot.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GceSnapshot {
    /// Snapshot name.
    pub name: String,
    /// Status.
    pub status: Option<String>,
    /// Source disk (URL).
    pub source_disk: Option<String>,
}

/// Create snapshot request.
#[derive(Debug, Serialize)]
pub struct CreateSnapshotRequest {
    /// Snapshot name.
    pub name: String,
}

// ============================================================================
// List types
// ============================================================================

/// Any resource list where only names matter (zones, accelerator types,
/// machine types).
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamedList {
    /// Items.
    #[serde(default)]
    pub items: Vec<Named>,
    /// Token of the next page.
    pub next_page_token: Option<String>,
}

/// A named resource.
#[derive(Debug, Deserialize)]
pub struct Named {
    /// Resource name.
    pub name: String,
}

// ============================================================================
// Operation types
// ============================================================================

/// GCP operation (async task).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GceOperation {
    /// Operation name.
    pub name: String,
    /// Status: `PENDING`, `RUNNING` or `DONE`.
    pub status: String,
    /// Zone (URL), for zonal operations.
    pub zone: Option<String>,
    /// Region (URL), for regional operations.
    pub region: Option<String>,
    /// Error.
    pub error: Option<OperationError>,
}

/// Operation error.
#[derive(Debug, Clone, Deserialize)]
pub struct OperationError {
    /// Errors.
    #[serde(default)]
    pub errors: Vec<OperationErrorDetail>,
}

/// Operation error detail.
#[derive(Debug, Clone, Deserialize)]
pub struct OperationErrorDetail {
    /// Error code.
    pub code: Option<String>,
    /// Error message.
    pub message: Option<String>,
}

/// Error body returned with non-2xx responses.
#[derive(Debug, Deserialize)]
pub struct ErrorResponse {
    /// Error.
    pub error: ErrorBody,
}

/// Error body details.
#[derive(Debug, Deserialize)]
pub struct ErrorBody {
    /// Message.
    pub message: Option<String>,
    /// Individual errors.
    #[serde(default)]
    pub errors: Vec<ErrorReason>,
}

/// Individual error reason.
#[derive(Debug, Deserialize)]
pub struct ErrorReason {
    /// Reason code.
    pub reason: Option<String>,
    /// Message.
    pub message: Option<String>,
}
