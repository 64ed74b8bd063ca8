//! Resilient calls against the managed instance.
//!
//! [`ResilientExecutor::execute`] runs a caller-supplied async call and
//! classifies its failures:
//!
//! - [`ErrorKind::Transient`]: retried in place after a short fixed delay.
//!   Exhausting the bound yields [`Outcome::ResponseProblem`].
//! - [`ErrorKind::Connectivity`]: the instance is stopped, the executor
//!   waits (growing per reconnect, capped), brings the instance back with
//!   [`InstanceControl::ensure_ready`], settles and retries. Exhausting the
//!   bound yields [`Outcome::ServerError`].
//! - Anything else is returned as [`ExecutorError::Call`].

use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::classify::{Classify, ErrorKind};
use crate::config::Timings;
use crate::lifecycle::LifecycleError;

/// Message for an exhausted transient retry bound.
pub const RESPONSE_PROBLEM: &str = "There is a problem with getting the response.";

/// Message for an exhausted reconnect bound.
pub const SERVER_ERROR: &str = "Response not returned. Server error.";

/// What the executor needs from the lifecycle manager.
#[async_trait]
pub trait InstanceControl: Send + Sync {
    /// Stop the instance.
    async fn stop(&self) -> Result<bool, LifecycleError>;

    /// Bring the instance up, relocating it if needed.
    async fn ensure_ready(&self) -> Result<IpAddr, LifecycleError>;
}

/// Errors that end an execution early.
#[derive(Error, Debug)]
pub enum ExecutorError<E: std::error::Error + 'static> {
    /// The call failed with an error that is not retried.
    #[error("Error in executing the function: {0}")]
    Call(#[source] E),

    /// Bringing the instance back failed.
    #[error("Instance recovery failed: {0}")]
    Recovery(#[from] LifecycleError),
}

/// Result of an execution that did not end in an [`ExecutorError`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    /// The call succeeded.
    Completed(T),
    /// Transient failures outlasted the retry bound.
    ResponseProblem,
    /// Connection failures outlasted the reconnect bound.
    ServerError,
}

impl<T> Outcome<T> {
    /// Whether the call succeeded.
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    /// Failure message, empty on success.
    pub fn message(&self) -> &'static str {
        match self {
            Self::Completed(_) => "",
            Self::ResponseProblem => RESPONSE_PROBLEM,
            Self::ServerError => SERVER_ERROR,
        }
    }

    /// The call's value, if it succeeded.
    pub fn into_value(self) -> Option<T> {
        match self {
            Self::Completed(value) => Some(value),
            _ => None,
        }
    }
}

/// Runs calls against the managed instance through network failures and
/// instance restarts.
pub struct ResilientExecutor {
    control: Arc<dyn InstanceControl>,
    timings: Timings,
}

impl ResilientExecutor {
    /// Create an executor.
    #[must_use]
    pub fn new(control: Arc<dyn InstanceControl>, timings: Timings) -> Self {
        Self { control, timings }
    }

    /// Run `call` until it succeeds or a retry bound is exhausted.
    ///
    /// The transient and reconnect bounds are counted independently over
    /// the whole execution.
    ///
    /// # Errors
    /// - [`ExecutorError::Call`] for a failure classified neither transient
    ///   nor connectivity.
    /// - [`ExecutorError::Recovery`] if restarting the instance fails with
    ///   a non-recoverable error.
    pub async fn execute<T, E, F, Fut>(&self, mut call: F) -> Result<Outcome<T>, ExecutorError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + std::error::Error + 'static,
    {
        let mut requests = self.timings.request_retry().schedule();
        let mut reconnects = self.timings.reconnect().schedule();
        let mut request_trial: u32 = 0;
        let mut reconnect_trial: u32 = 0;

        loop {
            let err = match call().await {
                Ok(value) => return Ok(Outcome::Completed(value)),
                Err(err) => err,
            };

            match err.kind() {
                ErrorKind::Transient => {
                    let Some(delay) = requests.next() else {
                        warn!(trials = request_trial, error = %err, "Response retries exhausted");
                        return Ok(Outcome::ResponseProblem);
                    };
                    request_trial += 1;
                    warn!(
                        trial = request_trial,
                        delay_secs = delay.as_secs_f64(),
                        error = %err,
                        "Response timeout, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                ErrorKind::Connectivity => {
                    let Some(wait) = reconnects.next() else {
                        error!(trials = reconnect_trial, error = %err, "Reconnect retries exhausted");
                        return Ok(Outcome::ServerError);
                    };
                    reconnect_trial += 1;
                    error!(
                        trial = reconnect_trial,
                        wait_secs = wait.as_secs_f64(),
                        error = %err,
                        "Connection failed, restarting instance"
                    );
                    self.reconnect(wait).await?;
                }
                _ => return Err(ExecutorError::Call(err)),
            }
        }
    }

    async fn reconnect(&self, wait: std::time::Duration) -> Result<(), LifecycleError> {
        if let Err(e) = self.control.stop().await {
            warn!(error = %e, "Stopping instance failed");
        }
        tokio::time::sleep(wait).await;

        let ip = self.control.ensure_ready().await?;
        info!(ip = %ip, settle_secs = self.timings.reconnect_settle.as_secs_f64(), "Instance back, settling");
        tokio::time::sleep(self.timings.reconnect_settle).await;
        Ok(())
    }
}
