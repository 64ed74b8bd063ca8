//! GCP Compute Engine client against a mock HTTP server.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gpu_keeper::operators::OperationWaiter;
use gpu_keeper::providers::gcp::TokenSource;
use gpu_keeper::providers::traits::{
    AcceleratorSpec, ComputeProvider, InstanceSpec, InstanceStatus, OperationScope,
    OperationStatus, ProviderError, ServiceAccount,
};
use gpu_keeper::{Classify, ErrorKind, Gcp, RetryPolicy};
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const PROJECT: &str = "my-project";
const ZONE: &str = "europe-west4-a";

fn provider(server: &MockServer) -> Gcp {
    Gcp::with_base_url(PROJECT, "test-token", server.uri()).unwrap()
}

fn zone_path(rest: &str) -> String {
    format!("/projects/{PROJECT}/zones/{ZONE}/{rest}")
}

fn operation(name: &str, status: &str) -> serde_json::Value {
    json!({
        "name": name,
        "status": status,
        "zone": format!("https://www.googleapis.com/compute/v1/projects/{PROJECT}/zones/{ZONE}"),
        "operationType": "insert"
    })
}

// =============================================================================
// Instances
// =============================================================================

#[tokio::test]
async fn test_get_instance() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(zone_path("instances/4242")))
        .and(header("authorization", "Bearer test-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "4242",
            "name": "translation-instance",
            "zone": format!("https://www.googleapis.com/compute/v1/projects/{PROJECT}/zones/{ZONE}"),
            "machineType": format!("https://www.googleapis.com/compute/v1/projects/{PROJECT}/zones/{ZONE}/machineTypes/g2-standard-4"),
            "status": "RUNNING",
            "networkInterfaces": [{
                "networkIP": "10.164.0.5",
                "accessConfigs": [{ "type": "ONE_TO_ONE_NAT", "natIP": "34.90.12.34" }]
            }],
            "disks": [{
                "boot": true,
                "source": format!("https://www.googleapis.com/compute/v1/projects/{PROJECT}/zones/{ZONE}/disks/translation-disk")
            }],
            "guestAccelerators": [{
                "acceleratorType": "nvidia-l4",
                "acceleratorCount": 1
            }]
        })))
        .mount(&server)
        .await;

    let instance = provider(&server).get_instance(ZONE, "4242").await.unwrap();

    assert_eq!(instance.id, "4242");
    assert_eq!(instance.zone, ZONE);
    assert_eq!(instance.status, InstanceStatus::Running);
    assert_eq!(instance.machine_type, "g2-standard-4");
    assert_eq!(instance.external_ip.as_deref(), Some("34.90.12.34"));
    assert_eq!(instance.internal_ip.as_deref(), Some("10.164.0.5"));
    assert_eq!(instance.boot_disk.as_deref(), Some("translation-disk"));
    assert_eq!(instance.accelerator_count, 1);
}

#[tokio::test]
async fn test_start_instance_returns_zonal_operation() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(zone_path("instances/4242/start")))
        .respond_with(ResponseTemplate::new(200).set_body_json(operation("operation-start", "RUNNING")))
        .expect(1)
        .mount(&server)
        .await;

    let op = provider(&server).start_instance(ZONE, "4242").await.unwrap();

    assert_eq!(op.name, "operation-start");
    assert_eq!(op.scope, OperationScope::Zone(ZONE.to_string()));
    assert_eq!(op.status, OperationStatus::Running);
}

#[tokio::test]
async fn test_insert_instance_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(zone_path("instances")))
        .and(body_partial_json(json!({
            "name": "translation-instance-host-20240101-000000",
            "machineType": format!("zones/{ZONE}/machineTypes/g2-standard-4"),
            "disks": [{
                "boot": true,
                "autoDelete": true,
                "source": format!("projects/{PROJECT}/zones/{ZONE}/disks/translation-disk-host-20240101-000000")
            }],
            "guestAccelerators": [{
                "acceleratorType": format!("projects/{PROJECT}/zones/{ZONE}/acceleratorTypes/nvidia-l4"),
                "acceleratorCount": 1
            }],
            "scheduling": {
                "onHostMaintenance": "TERMINATE",
                "automaticRestart": true
            },
            "tags": { "items": ["http-server"] },
            "serviceAccounts": [{ "email": "svc@my-project.iam.gserviceaccount.com" }],
            "metadata": { "items": [{ "key": "startup-script", "value": "#!/bin/bash\necho up\n" }] }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(operation("operation-insert", "PENDING")))
        .expect(1)
        .mount(&server)
        .await;

    let spec = InstanceSpec {
        name: "translation-instance-host-20240101-000000".to_string(),
        machine_type: "g2-standard-4".to_string(),
        boot_disk: "translation-disk-host-20240101-000000".to_string(),
        accelerator: Some(AcceleratorSpec {
            accelerator_type: "nvidia-l4".to_string(),
            count: 1,
        }),
        network: None,
        subnetwork: None,
        tags: vec!["http-server".to_string()],
        service_account: Some(ServiceAccount {
            email: "svc@my-project.iam.gserviceaccount.com".to_string(),
            scopes: vec!["https://www.googleapis.com/auth/cloud-platform".to_string()],
        }),
        startup_script: Some("#!/bin/bash\necho up\n".to_string()),
    };

    let op = provider(&server).insert_instance(ZONE, &spec).await.unwrap();
    assert_eq!(op.status, OperationStatus::Pending);
}

// =============================================================================
// Token refresh
// =============================================================================

/// Hands out `token-1`, `token-2`, ... advancing on every invalidation.
#[derive(Default)]
struct RotatingToken {
    generation: AtomicUsize,
    invalidations: AtomicUsize,
}

#[async_trait]
impl TokenSource for RotatingToken {
    async fn token(&self) -> Result<String, ProviderError> {
        Ok(format!("token-{}", self.generation.load(Ordering::SeqCst) + 1))
    }

    fn invalidate(&self) {
        self.invalidations.fetch_add(1, Ordering::SeqCst);
        self.generation.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn test_expired_token_is_refreshed_and_request_resent() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(zone_path("instances/4242")))
        .and(header("authorization", "Bearer token-1"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "error": { "code": 401, "message": "Request had invalid authentication credentials" }
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(zone_path("instances/4242")))
        .and(header("authorization", "Bearer token-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "4242",
            "name": "translation-instance",
            "zone": ZONE,
            "machineType": "g2-standard-4",
            "status": "TERMINATED"
        })))
        .expect(2)
        .mount(&server)
        .await;

    let tokens = Arc::new(RotatingToken::default());
    let gcp = Gcp::with_token_source(PROJECT, tokens.clone(), server.uri()).unwrap();

    let instance = gcp.get_instance(ZONE, "4242").await.unwrap();
    assert_eq!(instance.status, InstanceStatus::Terminated);
    assert_eq!(tokens.invalidations.load(Ordering::SeqCst), 1);

    // The refreshed token is kept for later requests.
    gcp.get_instance(ZONE, "4242").await.unwrap();
    assert_eq!(tokens.invalidations.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unauthorized_after_refresh_is_auth_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "error": { "code": 401, "message": "Request had invalid authentication credentials" }
        })))
        .expect(2)
        .mount(&server)
        .await;

    let tokens = Arc::new(RotatingToken::default());
    let gcp = Gcp::with_token_source(PROJECT, tokens.clone(), server.uri()).unwrap();

    let err = gcp.get_instance(ZONE, "4242").await.unwrap_err();
    assert!(matches!(err, ProviderError::Auth(_)));
    assert_eq!(tokens.invalidations.load(Ordering::SeqCst), 1);
}

// =============================================================================
// Error mapping
// =============================================================================

async fn error_for(status: u16, body: serde_json::Value) -> ProviderError {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(status).set_body_json(body))
        .mount(&server)
        .await;

    provider(&server).get_instance(ZONE, "4242").await.unwrap_err()
}

#[tokio::test]
async fn test_not_found() {
    let err = error_for(
        404,
        json!({ "error": { "code": 404, "message": "The resource 'instances/4242' was not found" } }),
    )
    .await;

    assert!(matches!(err, ProviderError::NotFound(ref m) if m.contains("was not found")));
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_forbidden_is_auth() {
    let err = error_for(403, json!({ "error": { "code": 403, "message": "Permission denied" } })).await;
    assert!(matches!(err, ProviderError::Auth(_)));
    assert_eq!(err.kind(), ErrorKind::Fatal);
}

#[tokio::test]
async fn test_exhausted_body_is_resource_exhausted() {
    let err = error_for(
        400,
        json!({ "error": {
            "code": 400,
            "message": "The zone does not have enough resources available",
            "errors": [{ "reason": "ZONE_RESOURCE_POOL_EXHAUSTED" }]
        } }),
    )
    .await;

    assert!(matches!(err, ProviderError::ResourceExhausted(_)));
    assert!(err.is_rejection());
}

#[tokio::test]
async fn test_server_error_is_transient() {
    let err = error_for(503, json!({ "error": { "code": 503, "message": "Backend unavailable" } })).await;
    assert!(matches!(err, ProviderError::Api { status: 503, .. }));
    assert_eq!(err.kind(), ErrorKind::Transient);
}

// =============================================================================
// Discovery
// =============================================================================

#[tokio::test]
async fn test_list_zones_follows_pages() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("/projects/{PROJECT}/zones")))
        .and(query_param("pageToken", "page 2+/="))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [{ "name": "us-central1-a" }]
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/projects/{PROJECT}/zones")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [{ "name": "europe-west4-a" }, { "name": "europe-west4-b" }],
            "nextPageToken": "page 2+/="
        })))
        .mount(&server)
        .await;

    let zones = provider(&server).list_zones().await.unwrap();
    assert_eq!(zones, vec!["europe-west4-a", "europe-west4-b", "us-central1-a"]);
}

#[tokio::test]
async fn test_list_accelerator_types_empty() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(zone_path("acceleratorTypes")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;

    assert!(provider(&server)
        .list_accelerator_types(ZONE)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_get_region_operation() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("/projects/{PROJECT}/regions/europe-west4/operations/operation-9")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "name": "operation-9",
            "status": "DONE",
            "region": format!("https://www.googleapis.com/compute/v1/projects/{PROJECT}/regions/europe-west4")
        })))
        .mount(&server)
        .await;

    let op = provider(&server)
        .get_operation(&OperationScope::Region("europe-west4".to_string()), "operation-9")
        .await
        .unwrap();

    assert!(op.is_done());
    assert_eq!(op.scope, OperationScope::Region("europe-west4".to_string()));
}

// =============================================================================
// Operation waiting
// =============================================================================

#[tokio::test]
async fn test_waiter_reports_resource_exhaustion() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(zone_path("instances/4242/start")))
        .respond_with(ResponseTemplate::new(200).set_body_json(operation("operation-1", "RUNNING")))
        .mount(&server)
        .await;
    let mut done = operation("operation-1", "DONE");
    done["error"] = json!({ "errors": [{
        "code": "ZONE_RESOURCE_POOL_EXHAUSTED_WITH_DETAILS",
        "message": "The zone 'europe-west4-a' does not have enough resources available"
    }] });
    Mock::given(method("GET"))
        .and(path(zone_path("operations/operation-1")))
        .respond_with(ResponseTemplate::new(200).set_body_json(done))
        .expect(1)
        .mount(&server)
        .await;

    let gcp: Arc<dyn ComputeProvider> = Arc::new(provider(&server));
    let waiter = OperationWaiter::new(gcp.clone(), RetryPolicy::fixed(5, Duration::from_millis(10)));

    let op = gcp.start_instance(ZONE, "4242").await.unwrap();
    let err = waiter.wait(op).await.unwrap_err();

    assert!(matches!(err, ProviderError::ResourceExhausted(ref m) if m.contains("enough resources")));
}

#[tokio::test]
async fn test_waiter_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(zone_path("operations/operation-1")))
        .respond_with(ResponseTemplate::new(200).set_body_json(operation("operation-1", "RUNNING")))
        .expect(3)
        .mount(&server)
        .await;

    let gcp: Arc<dyn ComputeProvider> = Arc::new(provider(&server));
    let waiter = OperationWaiter::new(gcp.clone(), RetryPolicy::fixed(2, Duration::from_millis(1)));

    let op = gcp
        .get_operation(&OperationScope::Zone(ZONE.to_string()), "operation-1")
        .await
        .unwrap();
    let err = waiter.wait(op).await.unwrap_err();

    // The first poll was made by the test itself.
    assert!(matches!(err, ProviderError::Timeout(ref name, 3) if name == "operation-1"));
}
