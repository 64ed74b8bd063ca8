//! Keeper configuration.
//!
//! Everything the lifecycle needs to know about the workload, the instance
//! shape it recreates during failover, and the intervals and bounds of
//! every wait. The binary fills this from CLI flags, environment variables
//! and an optional config file.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::providers::traits::{AcceleratorSpec, ServiceAccount};
use crate::retry::{DelayPolicy, RetryPolicy};

/// Default region prefix candidate zones must start with.
pub const DEFAULT_REGION: &str = "europe-west4";

/// Default accelerator type.
pub const DEFAULT_ACCELERATOR_TYPE: &str = "nvidia-l4";

/// Default machine type.
pub const DEFAULT_MACHINE_TYPE: &str = "g2-standard-4";

/// Default disk type for failover disks.
pub const DEFAULT_DISK_TYPE: &str = "pd-ssd";

/// Default scopes for the instance service account.
pub const DEFAULT_SCOPES: &[&str] = &[
    "https://www.googleapis.com/auth/devstorage.read_only",
    "https://www.googleapis.com/auth/logging.write",
    "https://www.googleapis.com/auth/monitoring.write",
    "https://www.googleapis.com/auth/service.management.readonly",
    "https://www.googleapis.com/auth/servicecontrol",
    "https://www.googleapis.com/auth/trace.append",
];

/// Errors raised by [`KeeperConfig::validate`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required field is empty.
    #[error("missing required setting: {0}")]
    Missing(&'static str),

    /// The server type cannot be embedded in resource names.
    #[error("server type '{0}' must be lowercase letters, digits and dashes")]
    InvalidServerType(String),

    /// A timing value is out of range.
    #[error("invalid timing {name}: {reason}")]
    InvalidTiming {
        name: &'static str,
        reason: &'static str,
    },
}

/// Keeper configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeeperConfig {
    /// Provider project ID.
    pub project_id: String,
    /// Workload type; one managed instance per server type.
    pub server_type: String,
    /// Candidate zones must start with this prefix.
    pub region: String,
    /// Accelerator type required in candidate zones.
    pub accelerator_type: String,
    /// Accelerators attached to recreated instances.
    pub accelerator_count: u32,
    /// Machine type required in candidate zones.
    pub machine_type: String,
    /// Disk type for failover disks.
    pub disk_type: String,
    /// Network name.
    pub network: Option<String>,
    /// Subnetwork name.
    pub subnetwork: Option<String>,
    /// Service account email; no account is attached when unset.
    pub service_account: Option<String>,
    /// Service account scopes.
    pub scopes: Vec<String>,
    /// Network tags for recreated instances.
    pub tags: Vec<String>,
    /// Startup script for recreated instances.
    pub startup_script: Option<String>,
    /// Host fragment embedded in disk and instance names.
    pub host_tag: String,
    /// Directory holding the handle and IP cache files.
    pub cache_dir: PathBuf,
    /// Zone of an existing instance to adopt when nothing is cached.
    pub seed_zone: Option<String>,
    /// ID of an existing instance to adopt when nothing is cached.
    pub seed_instance: Option<String>,
    /// Intervals and bounds.
    pub timings: Timings,
}

impl Default for KeeperConfig {
    fn default() -> Self {
        Self {
            project_id: String::new(),
            server_type: String::new(),
            region: DEFAULT_REGION.to_string(),
            accelerator_type: DEFAULT_ACCELERATOR_TYPE.to_string(),
            accelerator_count: 1,
            machine_type: DEFAULT_MACHINE_TYPE.to_string(),
            disk_type: DEFAULT_DISK_TYPE.to_string(),
            network: None,
            subnetwork: None,
            service_account: None,
            scopes: DEFAULT_SCOPES.iter().map(ToString::to_string).collect(),
            tags: vec!["http-server".to_string(), "https-server".to_string()],
            startup_script: None,
            host_tag: default_host_tag(),
            cache_dir: std::env::temp_dir(),
            seed_zone: None,
            seed_instance: None,
            timings: Timings::default(),
        }
    }
}

impl KeeperConfig {
    /// Create a config for a project and server type with defaults elsewhere.
    #[must_use]
    pub fn new(project_id: impl Into<String>, server_type: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            server_type: server_type.into(),
            ..Self::default()
        }
    }

    /// Check required fields.
    ///
    /// # Errors
    /// Returns an error if the project ID or server type is empty, the
    /// server type is not a valid resource name fragment, or the timings
    /// are out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.project_id.trim().is_empty() {
            return Err(ConfigError::Missing("project_id"));
        }
        if self.server_type.trim().is_empty() {
            return Err(ConfigError::Missing("server_type"));
        }
        let valid = self
            .server_type
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
            && self.server_type.starts_with(|c: char| c.is_ascii_lowercase());
        if !valid {
            return Err(ConfigError::InvalidServerType(self.server_type.clone()));
        }
        self.timings.validate()
    }

    /// Name of the golden snapshot for this server type.
    #[must_use]
    pub fn snapshot_name(&self) -> String {
        format!("{}-server-snapshot", self.server_type)
    }

    /// Accelerator attachment for recreated instances.
    #[must_use]
    pub fn accelerator(&self) -> Option<AcceleratorSpec> {
        (!self.accelerator_type.is_empty() && self.accelerator_count > 0).then(|| {
            AcceleratorSpec {
                accelerator_type: self.accelerator_type.clone(),
                count: self.accelerator_count,
            }
        })
    }

    /// Service account for recreated instances.
    #[must_use]
    pub fn service_account(&self) -> Option<ServiceAccount> {
        self.service_account.as_ref().map(|email| ServiceAccount {
            email: email.clone(),
            scopes: self.scopes.clone(),
        })
    }
}

/// Intervals and bounds for every wait the keeper performs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Timings {
    /// Delay between instance status polls during start/stop.
    #[serde(with = "secs")]
    pub status_poll_interval: Duration,
    /// Status polls after the first check before start/stop give up.
    pub status_poll_retries: u32,
    /// Delay between operation polls.
    #[serde(with = "secs")]
    pub operation_poll_interval: Duration,
    /// Operation polls before the waiter gives up.
    pub operation_max_polls: u32,
    /// Delay before re-issuing an instance insert after resource exhaustion.
    #[serde(with = "secs")]
    pub insert_retry_delay: Duration,
    /// Re-issues of an instance insert after the first attempt.
    pub insert_retries: u32,
    /// Delay before deleting a disk left by a failed instance insert.
    #[serde(with = "secs")]
    pub disk_delete_settle: Duration,
    /// Wait after a successful zone switch before starting again.
    #[serde(with = "secs")]
    pub failover_cooldown: Duration,
    /// Wait after a zone switch found no zone, or acquisition failed.
    #[serde(with = "secs")]
    pub acquisition_cooldown: Duration,
    /// Delay between retries of a timed-out request.
    #[serde(with = "secs")]
    pub request_retry_delay: Duration,
    /// Retries of timed-out requests before giving up.
    pub request_retries: u32,
    /// First wait after stopping an unreachable instance.
    #[serde(with = "secs")]
    pub reconnect_base_wait: Duration,
    /// Growth of the reconnect wait per attempt.
    pub reconnect_multiplier: f64,
    /// Ceiling of the reconnect wait.
    #[serde(with = "secs")]
    pub reconnect_max_wait: Duration,
    /// Reconnects before giving up.
    pub reconnect_retries: u32,
    /// Wait after a reconnect before retrying the call.
    #[serde(with = "secs")]
    pub reconnect_settle: Duration,
    /// Timeout of the local liveness probe.
    #[serde(with = "secs")]
    pub probe_timeout: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            status_poll_interval: Duration::from_secs(5),
            status_poll_retries: 100,
            operation_poll_interval: Duration::from_secs(5),
            operation_max_polls: 720,
            insert_retry_delay: Duration::from_secs(60),
            insert_retries: 2,
            disk_delete_settle: Duration::from_secs(10),
            failover_cooldown: Duration::from_secs(120),
            acquisition_cooldown: Duration::from_secs(300),
            request_retry_delay: Duration::from_secs(30),
            request_retries: 20,
            reconnect_base_wait: Duration::from_secs(180),
            reconnect_multiplier: 1.5,
            reconnect_max_wait: Duration::from_secs(900),
            reconnect_retries: 10,
            reconnect_settle: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(3),
        }
    }
}

impl Timings {
    /// Check values the retry schedules cannot work with.
    ///
    /// # Errors
    /// Returns [`ConfigError::InvalidTiming`] for a reconnect multiplier
    /// that is not finite or below 1, or a reconnect ceiling below the
    /// base wait.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.reconnect_multiplier.is_finite() || self.reconnect_multiplier < 1.0 {
            return Err(ConfigError::InvalidTiming {
                name: "reconnect_multiplier",
                reason: "must be a finite number of at least 1",
            });
        }
        if self.reconnect_max_wait < self.reconnect_base_wait {
            return Err(ConfigError::InvalidTiming {
                name: "reconnect_max_wait",
                reason: "must not be below reconnect_base_wait",
            });
        }
        Ok(())
    }

    /// Start/stop status polling.
    #[must_use]
    pub fn status_poll(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.status_poll_retries, self.status_poll_interval)
    }

    /// Operation polling.
    #[must_use]
    pub fn operation_poll(&self) -> RetryPolicy {
        RetryPolicy::fixed(
            self.operation_max_polls.saturating_sub(1),
            self.operation_poll_interval,
        )
    }

    /// Instance insert retries on resource exhaustion.
    #[must_use]
    pub fn insert_retry(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.insert_retries, self.insert_retry_delay)
    }

    /// Executor retries of timed-out requests.
    #[must_use]
    pub fn request_retry(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.request_retries, self.request_retry_delay)
    }

    /// Executor reconnect waits.
    #[must_use]
    pub fn reconnect(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.reconnect_retries,
            delay: DelayPolicy::Backoff {
                initial: self.reconnect_base_wait,
                multiplier: self.reconnect_multiplier,
                max: self.reconnect_max_wait,
            },
        }
    }
}

/// Host fragment for resource names: `HOSTNAME` reduced to `[a-z0-9-]`.
#[must_use]
pub fn default_host_tag() -> String {
    let raw = std::env::var("HOSTNAME").unwrap_or_default();
    let tag = sanitize_name_fragment(&raw);
    if tag.is_empty() {
        "local".to_string()
    } else {
        tag
    }
}

/// Lowercase a string and replace anything outside `[a-z0-9-]` with `-`,
/// trimming dashes and capping the length so names stay under provider limits.
#[must_use]
pub fn sanitize_name_fragment(raw: &str) -> String {
    let mapped: String = raw
        .to_ascii_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() {
                c
            } else {
                '-'
            }
        })
        .collect();
    let capped: String = mapped.trim_matches('-').chars().take(20).collect();
    capped.trim_end_matches('-').to_string()
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
