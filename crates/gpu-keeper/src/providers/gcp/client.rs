//! GCP Compute Engine API client implementation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use tracing::{debug, info, warn};

use super::auth::{StaticToken, TokenSource};
use super::models::{
    AccessConfigDefinition, AcceleratorConfig, AttachedDiskDefinition, CreateDiskRequest,
    CreateInstanceRequest as GceCreateRequest, CreateSnapshotRequest, ErrorResponse, GceDisk,
    GceInstance, GceOperation, GceSnapshot, Metadata, MetadataItem, NamedList,
    NetworkInterfaceDefinition, Scheduling, ServiceAccountDefinition, Tags,
};
use crate::providers::traits::{
    ComputeProvider, Disk, DiskSpec, Instance, InstanceSpec, InstanceStatus, Operation,
    OperationErrorDetail, OperationScope, OperationStatus, ProviderError, Snapshot,
    RESOURCE_EXHAUSTED_CODES,
};

/// Base URL for the Compute Engine v1 API.
const API_BASE_URL: &str = "https://compute.googleapis.com/compute/v1";

/// Default timeout for API requests.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// GCP Compute Engine provider.
#[derive(Clone)]
pub struct Gcp {
    /// HTTP client.
    client: Client,
    /// Project ID.
    project_id: String,
    /// Bearer tokens, refreshed when the API rejects one.
    tokens: Arc<dyn TokenSource>,
    /// API base URL.
    base_url: String,
}

impl Gcp {
    /// Create a new GCP provider with a fixed access token.
    ///
    /// # Arguments
    /// * `project_id` - GCP project ID
    /// * `access_token` - `OAuth2` access token
    ///
    /// # Errors
    /// Returns error if HTTP client cannot be created.
    pub fn new(
        project_id: impl Into<String>,
        access_token: impl Into<String>,
    ) -> Result<Self, ProviderError> {
        Self::with_base_url(project_id, access_token, API_BASE_URL)
    }

    /// Create a provider talking to a different endpoint (emulators, tests).
    ///
    /// # Errors
    /// Returns error if HTTP client cannot be created.
    pub fn with_base_url(
        project_id: impl Into<String>,
        access_token: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Result<Self, ProviderError> {
        Self::with_token_source(project_id, Arc::new(StaticToken::new(access_token)), base_url)
    }

    /// Create a provider drawing tokens from `tokens`.
    ///
    /// # Errors
    /// Returns error if HTTP client cannot be created.
    pub fn with_token_source(
        project_id: impl Into<String>,
        tokens: Arc<dyn TokenSource>,
        base_url: impl Into<String>,
    ) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .map_err(ProviderError::Http)?;

        Ok(Self {
            client,
            project_id: project_id.into(),
            tokens,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Create a provider against the public endpoint drawing tokens from
    /// `tokens`.
    ///
    /// # Errors
    /// Returns error if HTTP client cannot be created.
    pub fn with_tokens(
        project_id: impl Into<String>,
        tokens: Arc<dyn TokenSource>,
    ) -> Result<Self, ProviderError> {
        Self::with_token_source(project_id, tokens, API_BASE_URL)
    }

    /// Get region from zone.
    fn zone_to_region(zone: &str) -> String {
        // Remove the zone suffix (e.g., "us-central1-a" -> "us-central1")
        zone.rsplit_once('-')
            .map_or_else(|| zone.to_string(), |(region, _)| region.to_string())
    }

    /// Last path segment of a resource URL.
    fn short_name(url: &str) -> String {
        url.rsplit('/').next().unwrap_or(url).to_string()
    }

    fn project_url(&self) -> String {
        format!("{}/projects/{}", self.base_url, self.project_id)
    }

    fn zone_url(&self, zone: &str) -> String {
        format!("{}/zones/{zone}", self.project_url())
    }

    /// Send an authenticated request built by `build`.
    ///
    /// A 401 invalidates the token and the request is sent once more with
    /// a fresh one.
    async fn send<T, F>(&self, build: F) -> Result<T, ProviderError>
    where
        T: serde::de::DeserializeOwned,
        F: Fn() -> RequestBuilder,
    {
        let token = self.tokens.token().await?;
        let response = build().bearer_auth(&token).send().await?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return self.handle_response(response).await;
        }

        warn!("Access token rejected, refreshing");
        self.tokens.invalidate();
        let token = self.tokens.token().await?;
        let response = build().bearer_auth(&token).send().await?;
        self.handle_response(response).await
    }

    /// Make an authenticated GET request.
    async fn get<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, ProviderError> {
        debug!(url = %url, "GET request");
        self.send(|| self.client.get(url)).await
    }

    /// Make an authenticated POST request.
    async fn post<T, B>(&self, url: &str, body: &B) -> Result<T, ProviderError>
    where
        T: serde::de::DeserializeOwned,
        B: serde::Serialize + ?Sized,
    {
        debug!(url = %url, "POST request");
        self.send(|| self.client.post(url).json(body)).await
    }

    /// Make an authenticated DELETE request.
    async fn delete<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, ProviderError> {
        debug!(url = %url, "DELETE request");
        self.send(|| self.client.delete(url)).await
    }

    /// Handle API response.
    async fn handle_response<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, ProviderError> {
        let status = response.status();
        let text = response.text().await?;

        if status.is_success() {
            serde_json::from_str(&text).map_err(|e| {
                warn!(error = %e, body = %text, "Failed to parse response");
                ProviderError::Serialization(e)
            })
        } else if status == StatusCode::NOT_FOUND {
            Err(ProviderError::NotFound(Self::error_message(&text)))
        } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            Err(ProviderError::Auth(Self::error_message(&text)))
        } else if RESOURCE_EXHAUSTED_CODES
            .iter()
            .any(|code| text.contains(code))
        {
            Err(ProviderError::ResourceExhausted(Self::error_message(&text)))
        } else {
            Err(ProviderError::Api {
                status: status.as_u16(),
                message: Self::error_message(&text),
            })
        }
    }

    /// Pull the human-readable message out of a GCP error body, falling
    /// back to the raw body.
    fn error_message(body: &str) -> String {
        serde_json::from_str::<ErrorResponse>(body)
            .ok()
            .and_then(|r| {
                r.error.message.or_else(|| {
                    r.error
                        .errors
                        .into_iter()
                        .find_map(|e| e.message.or(e.reason))
                })
            })
            .unwrap_or_else(|| body.to_string())
    }

    /// Follow `nextPageToken` until every name is collected.
    async fn list_names(&self, url: &str) -> Result<Vec<String>, ProviderError> {
        let mut names = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            debug!(url = %url, page_token = ?page_token, "GET request");
            let page: NamedList = self
                .send(|| {
                    let request = self.client.get(url);
                    match &page_token {
                        Some(token) => request.query(&[("pageToken", token)]),
                        None => request,
                    }
                })
                .await?;
            names.extend(page.items.into_iter().map(|item| item.name));

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => return Ok(names),
            }
        }
    }

    /// Convert GCE instance to our type.
    fn to_instance(instance: &GceInstance) -> Instance {
        let status = match instance.status.as_str() {
            "PROVISIONING" | "STAGING" | "REPAIRING" => InstanceStatus::Pending,
            "RUNNING" => InstanceStatus::Running,
            "STOPPING" | "SUSPENDING" => InstanceStatus::Stopping,
            "STOPPED" | "SUSPENDED" => InstanceStatus::Stopped,
            "TERMINATED" => InstanceStatus::Terminated,
            _ => InstanceStatus::Unknown,
        };

        let external_ip = instance
            .network_interfaces
            .first()
            .and_then(|ni| ni.access_configs.first())
            .and_then(|ac| ac.nat_i_p.clone());

        let internal_ip = instance
            .network_interfaces
            .first()
            .and_then(|ni| ni.network_i_p.clone());

        let boot_disk = instance
            .disks
            .iter()
            .find(|d| d.boot == Some(true))
            .and_then(|d| d.source.as_deref())
            .map(Self::short_name);

        Instance {
            id: instance.id.clone(),
            name: instance.name.clone(),
            zone: Self::short_name(&instance.zone),
            status,
            machine_type: Self::short_name(&instance.machine_type),
            external_ip,
            internal_ip,
            accelerator_count: instance
                .guest_accelerators
                .iter()
                .map(|a| a.accelerator_count)
                .sum(),
            boot_disk,
            created_at: instance
                .creation_timestamp
                .as_ref()
                .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&chrono::Utc)),
        }
    }

    /// Convert GCE operation to our type.
    fn to_operation(op: &GceOperation) -> Operation {
        let scope = if let Some(zone) = &op.zone {
            OperationScope::Zone(Self::short_name(zone))
        } else if let Some(region) = &op.region {
            OperationScope::Region(Self::short_name(region))
        } else {
            OperationScope::Global
        };

        let status = match op.status.as_str() {
            "DONE" => OperationStatus::Done,
            "RUNNING" => OperationStatus::Running,
            _ => OperationStatus::Pending,
        };

        let errors = op
            .error
            .as_ref()
            .map(|e| {
                e.errors
                    .iter()
                    .map(|d| OperationErrorDetail {
                        code: d.code.clone().unwrap_or_default(),
                        message: d.message.clone().unwrap_or_default(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        Operation {
            name: op.name.clone(),
            scope,
            status,
            errors,
        }
    }

    /// Build the insert body for an instance booting from an existing disk.
    fn instance_body(&self, zone: &str, spec: &InstanceSpec) -> GceCreateRequest {
        let project = &self.project_id;

        let guest_accelerators = spec
            .accelerator
            .iter()
            .filter(|a| a.count > 0)
            .map(|a| AcceleratorConfig {
                accelerator_type: format!(
                    "projects/{project}/zones/{zone}/acceleratorTypes/{}",
                    a.accelerator_type
                ),
                accelerator_count: a.count,
            })
            .collect();

        let region = Self::zone_to_region(zone);

        GceCreateRequest {
            name: spec.name.clone(),
            machine_type: format!("zones/{zone}/machineTypes/{}", spec.machine_type),
            disks: vec![AttachedDiskDefinition {
                boot: true,
                auto_delete: true,
                source: format!("projects/{project}/zones/{zone}/disks/{}", spec.boot_disk),
                device_name: spec.boot_disk.clone(),
            }],
            network_interfaces: vec![NetworkInterfaceDefinition {
                network: spec
                    .network
                    .as_ref()
                    .map(|n| format!("projects/{project}/global/networks/{n}")),
                subnetwork: spec
                    .subnetwork
                    .as_ref()
                    .map(|s| format!("projects/{project}/regions/{region}/subnetworks/{s}")),
                access_configs: vec![AccessConfigDefinition {
                    access_type: "ONE_TO_ONE_NAT".to_string(),
                    name: "External NAT".to_string(),
                }],
            }],
            guest_accelerators,
            tags: (!spec.tags.is_empty()).then(|| Tags {
                items: spec.tags.clone(),
            }),
            service_accounts: spec
                .service_account
                .iter()
                .map(|sa| ServiceAccountDefinition {
                    email: sa.email.clone(),
                    scopes: sa.scopes.clone(),
                })
                .collect(),
            scheduling: Scheduling::default(),
            labels: HashMap::from([("managed-by".to_string(), "gpu-keeper".to_string())]),
            metadata: spec.startup_script.as_ref().map(|script| Metadata {
                items: vec![MetadataItem {
                    key: "startup-script".to_string(),
                    value: script.clone(),
                }],
            }),
        }
    }
}

#[async_trait]
impl ComputeProvider for Gcp {
    // ========================================================================
    // Instance operations
    // ========================================================================

    async fn get_instance(&self, zone: &str, instance: &str) -> Result<Instance, ProviderError> {
        let url = format!("{}/instances/{instance}", self.zone_url(zone));
        let instance: GceInstance = self.get(&url).await?;
        Ok(Self::to_instance(&instance))
    }

    async fn start_instance(
        &self,
        zone: &str,
        instance: &str,
    ) -> Result<Operation, ProviderError> {
        info!(zone = %zone, instance_id = %instance, "Starting instance");
        let url = format!("{}/instances/{instance}/start", self.zone_url(zone));
        let op: GceOperation = self.post(&url, &serde_json::json!({})).await?;
        Ok(Self::to_operation(&op))
    }

    async fn stop_instance(&self, zone: &str, instance: &str) -> Result<Operation, ProviderError> {
        info!(zone = %zone, instance_id = %instance, "Stopping instance");
        let url = format!("{}/instances/{instance}/stop", self.zone_url(zone));
        let op: GceOperation = self.post(&url, &serde_json::json!({})).await?;
        Ok(Self::to_operation(&op))
    }

    async fn insert_instance(
        &self,
        zone: &str,
        spec: &InstanceSpec,
    ) -> Result<Operation, ProviderError> {
        info!(
            zone = %zone,
            name = %spec.name,
            machine_type = %spec.machine_type,
            boot_disk = %spec.boot_disk,
            "Creating Compute Engine instance"
        );
        let url = format!("{}/instances", self.zone_url(zone));
        let body = self.instance_body(zone, spec);
        let op: GceOperation = self.post(&url, &body).await?;
        Ok(Self::to_operation(&op))
    }

    // ========================================================================
    // Disk and snapshot operations
    // ========================================================================

    async fn get_disk(&self, zone: &str, disk: &str) -> Result<Disk, ProviderError> {
        let url = format!("{}/disks/{disk}", self.zone_url(zone));
        let disk: GceDisk = self.get(&url).await?;
        Ok(Disk {
            name: disk.name,
            zone: Self::short_name(&disk.zone),
            status: disk.status.unwrap_or_default(),
            source_snapshot: disk.source_snapshot.as_deref().map(Self::short_name),
        })
    }

    async fn insert_disk(&self, zone: &str, spec: &DiskSpec) -> Result<Operation, ProviderError> {
        info!(zone = %zone, disk = %spec.name, snapshot = %spec.source_snapshot, "Creating disk");
        let project = &self.project_id;
        let body = CreateDiskRequest {
            name: spec.name.clone(),
            source_snapshot: format!("projects/{project}/global/snapshots/{}", spec.source_snapshot),
            disk_type: format!("projects/{project}/zones/{zone}/diskTypes/{}", spec.disk_type),
        };
        let url = format!("{}/disks", self.zone_url(zone));
        let op: GceOperation = self.post(&url, &body).await?;
        Ok(Self::to_operation(&op))
    }

    async fn delete_disk(&self, zone: &str, disk: &str) -> Result<Operation, ProviderError> {
        info!(zone = %zone, disk = %disk, "Deleting disk");
        let url = format!("{}/disks/{disk}", self.zone_url(zone));
        let op: GceOperation = self.delete(&url).await?;
        Ok(Self::to_operation(&op))
    }

    async fn get_snapshot(&self, snapshot: &str) -> Result<Snapshot, ProviderError> {
        let url = format!("{}/global/snapshots/{snapshot}", self.project_url());
        let snapshot: GceSnapshot = self.get(&url).await?;
        Ok(Snapshot {
            name: snapshot.name,
            status: snapshot.status.unwrap_or_default(),
            source_disk: snapshot.source_disk.as_deref().map(Self::short_name),
        })
    }

    async fn create_snapshot(
        &self,
        zone: &str,
        disk: &str,
        snapshot: &str,
    ) -> Result<Operation, ProviderError> {
        info!(zone = %zone, disk = %disk, snapshot = %snapshot, "Creating snapshot");
        let url = format!("{}/disks/{disk}/createSnapshot", self.zone_url(zone));
        let body = CreateSnapshotRequest {
            name: snapshot.to_string(),
        };
        let op: GceOperation = self.post(&url, &body).await?;
        Ok(Self::to_operation(&op))
    }

    // ========================================================================
    // Discovery
    // ========================================================================

    async fn list_zones(&self) -> Result<Vec<String>, ProviderError> {
        self.list_names(&format!("{}/zones", self.project_url()))
            .await
    }

    async fn list_accelerator_types(&self, zone: &str) -> Result<Vec<String>, ProviderError> {
        self.list_names(&format!("{}/acceleratorTypes", self.zone_url(zone)))
            .await
    }

    async fn list_machine_types(&self, zone: &str) -> Result<Vec<String>, ProviderError> {
        self.list_names(&format!("{}/machineTypes", self.zone_url(zone)))
            .await
    }

    // ========================================================================
    // Operations
    // ========================================================================

    async fn get_operation(
        &self,
        scope: &OperationScope,
        name: &str,
    ) -> Result<Operation, ProviderError> {
        let url = match scope {
            OperationScope::Zone(zone) => format!("{}/operations/{name}", self.zone_url(zone)),
            OperationScope::Region(region) => format!(
                "{}/regions/{region}/operations/{name}",
                self.project_url()
            ),
            OperationScope::Global => {
                format!("{}/global/operations/{name}", self.project_url())
            }
        };
        let op: GceOperation = self.get(&url).await?;
        Ok(Self::to_operation(&op))
    }
}
