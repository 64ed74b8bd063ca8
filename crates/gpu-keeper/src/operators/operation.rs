//! Waiting on long-running provider operations.

use std::sync::Arc;

use tracing::{debug, info};

use crate::providers::traits::{ComputeProvider, Operation, ProviderError};
use crate::retry::RetryPolicy;

/// Polls an operation until it is done and turns operation errors into
/// [`ProviderError`]s.
#[derive(Clone)]
pub struct OperationWaiter {
    provider: Arc<dyn ComputeProvider>,
    policy: RetryPolicy,
}

impl OperationWaiter {
    /// Create a waiter. `policy` bounds the number of polls after the
    /// first look at the operation.
    #[must_use]
    pub fn new(provider: Arc<dyn ComputeProvider>, policy: RetryPolicy) -> Self {
        Self { provider, policy }
    }

    /// Block until `operation` is done.
    ///
    /// # Errors
    /// - [`ProviderError::ResourceExhausted`] if the operation failed for
    ///   lack of zone capacity.
    /// - [`ProviderError::OperationFailed`] for any other operation error.
    /// - [`ProviderError::Timeout`] if the poll bound is exhausted.
    /// - Any error from polling itself.
    pub async fn wait(&self, operation: Operation) -> Result<(), ProviderError> {
        info!(operation = %operation.name, scope = ?operation.scope, "Waiting for operation to finish");

        let mut schedule = self.policy.schedule();
        let mut current = operation;

        loop {
            Self::check(&current)?;

            if current.is_done() {
                info!(operation = %current.name, "Operation completed");
                return Ok(());
            }

            let Some(delay) = schedule.next() else {
                return Err(ProviderError::Timeout(
                    current.name,
                    self.policy.max_retries + 1,
                ));
            };

            debug!(operation = %current.name, status = ?current.status, "Polling operation");
            tokio::time::sleep(delay).await;
            current = self
                .provider
                .get_operation(&current.scope, &current.name)
                .await?;
        }
    }

    fn check(operation: &Operation) -> Result<(), ProviderError> {
        let Some(first) = operation.errors.first() else {
            return Ok(());
        };

        if operation.is_resource_exhausted() {
            return Err(ProviderError::ResourceExhausted(first.message.clone()));
        }

        Err(ProviderError::OperationFailed {
            operation: operation.name.clone(),
            code: first.code.clone(),
            message: first.message.clone(),
        })
    }
}
