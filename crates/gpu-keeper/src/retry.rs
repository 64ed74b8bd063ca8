//! Bounded retry policies.
//!
//! Every wait in the keeper is attempt-count based: a [`RetryPolicy`]
//! yields a finite [`RetrySchedule`] of delays, and callers stop when the
//! schedule runs dry. [`with_retry`] wraps the common "call, classify,
//! sleep, call again" loop on top of it.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::classify::{Classify, ErrorKind};

/// How the delay between attempts evolves.
#[derive(Debug, Clone, PartialEq)]
pub enum DelayPolicy {
    /// Same delay every time.
    Fixed(Duration),
    /// Delay grows by `multiplier` per attempt, capped at `max`.
    Backoff {
        /// First delay.
        initial: Duration,
        /// Growth factor.
        multiplier: f64,
        /// Ceiling.
        max: Duration,
    },
}

/// Retry configuration: how many retries after the first attempt, and
/// how long to wait before each.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay between attempts.
    pub delay: DelayPolicy,
}

impl RetryPolicy {
    /// A policy with a fixed delay.
    #[must_use]
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            delay: DelayPolicy::Fixed(delay),
        }
    }

    /// A policy that never retries.
    #[must_use]
    pub fn none() -> Self {
        Self::fixed(0, Duration::ZERO)
    }

    /// Start a fresh schedule.
    #[must_use]
    pub fn schedule(&self) -> RetrySchedule {
        let next_delay = match &self.delay {
            DelayPolicy::Fixed(delay) => *delay,
            DelayPolicy::Backoff { initial, max, .. } => (*initial).min(*max),
        };
        RetrySchedule {
            remaining: self.max_retries,
            next_delay,
            delay: self.delay.clone(),
        }
    }
}

/// The delays still available under a [`RetryPolicy`].
///
/// Each call to [`Iterator::next`] consumes one retry; `None` means the
/// bound is exhausted.
#[derive(Debug, Clone)]
pub struct RetrySchedule {
    remaining: u32,
    next_delay: Duration,
    delay: DelayPolicy,
}

impl Iterator for RetrySchedule {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        let current = self.next_delay;
        if let DelayPolicy::Backoff {
            multiplier, max, ..
        } = &self.delay
        {
            // Products that are not a valid duration saturate at the ceiling.
            self.next_delay = Duration::try_from_secs_f64(current.as_secs_f64() * multiplier)
                .map_or(*max, |next| next.min(*max));
        }
        Some(current)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.remaining as usize;
        (n, Some(n))
    }
}

/// Predicate retrying errors whose kind is one of `kinds`.
pub fn on_kinds<E: Classify>(kinds: &'static [ErrorKind]) -> impl Fn(&E) -> bool {
    move |err: &E| kinds.contains(&err.kind())
}

/// Run `f` until it succeeds, fails with a non-retryable error, or the
/// policy runs out of retries. The last error is returned in the latter
/// two cases.
///
/// # Errors
/// Returns the error of the final attempt.
pub async fn with_retry<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    operation_name: &str,
    retryable: P,
    mut f: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut schedule = policy.schedule();
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) if retryable(&err) => {
                let Some(delay) = schedule.next() else {
                    warn!(
                        operation = operation_name,
                        attempt,
                        error = %err,
                        "Retries exhausted"
                    );
                    return Err(err);
                };
                warn!(
                    operation = operation_name,
                    attempt,
                    max_attempts = policy.max_retries + 1,
                    delay_secs = delay.as_secs_f64(),
                    error = %err,
                    "Attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}
