//! Local liveness probe.
//!
//! A workload that already reaches its remote service through a local
//! port (a tunnel or proxy) answers 200 there; in that case the cached IP
//! is trusted without asking the provider.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::debug;

/// Checks whether the service is already reachable on a local port.
#[async_trait]
pub trait LivenessProbe: Send + Sync {
    /// Whether `GET http://localhost:{port}` answers 200.
    async fn is_alive(&self, port: u16) -> bool;
}

/// HTTP implementation of [`LivenessProbe`].
#[derive(Clone)]
pub struct HttpProbe {
    client: Client,
    host: String,
}

impl HttpProbe {
    /// Create a probe against `localhost`.
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be created.
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        Self::with_host("localhost", timeout)
    }

    /// Create a probe against another host.
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be created.
    pub fn with_host(host: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            host: host.into(),
        })
    }
}

#[async_trait]
impl LivenessProbe for HttpProbe {
    async fn is_alive(&self, port: u16) -> bool {
        let url = format!("http://{}:{port}", self.host);
        match self.client.get(&url).send().await {
            Ok(response) => {
                debug!(url = %url, status = %response.status(), "Liveness probe answered");
                response.status() == StatusCode::OK
            }
            Err(e) => {
                debug!(url = %url, error = %e, "Liveness probe failed");
                false
            }
        }
    }
}

/// Probe that never succeeds, for callers without a local port.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProbe;

#[async_trait]
impl LivenessProbe for NoProbe {
    async fn is_alive(&self, _port: u16) -> bool {
        false
    }
}
