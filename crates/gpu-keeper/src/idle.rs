//! Idle-shutdown watcher, run on the managed instance itself.
//!
//! Every interval the watcher samples accelerator memory in use. Memory
//! above the threshold means the GPU is busy and any pending shutdown is
//! cancelled; below it, a delayed shutdown is scheduled once. The
//! lifecycle manager never calls into this module; it only relies on an
//! idle instance eventually stopping itself.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// One GiB.
pub const GIB: u64 = 1024 * 1024 * 1024;

/// Errors from sampling or scheduling.
#[derive(Error, Debug)]
pub enum IdleError {
    /// A command could not be spawned.
    #[error("Failed to run {program}: {source}")]
    Spawn {
        /// Program name.
        program: &'static str,
        /// Spawn error.
        #[source]
        source: std::io::Error,
    },

    /// A command exited unsuccessfully.
    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        /// Program name.
        program: &'static str,
        /// Exit status.
        status: std::process::ExitStatus,
        /// Captured stderr.
        stderr: String,
    },

    /// Command output could not be parsed.
    #[error("Unexpected {program} output: {output:?}")]
    Parse {
        /// Program name.
        program: &'static str,
        /// Offending output.
        output: String,
    },
}

/// Watcher state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdleState {
    /// No shutdown pending.
    #[default]
    ActiveOrUnknown,
    /// A delayed shutdown has been scheduled.
    ShutdownScheduled,
}

/// Side effect requested by a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleAction {
    /// Nothing to do.
    None,
    /// Schedule the delayed shutdown.
    Schedule,
    /// Cancel the pending shutdown.
    Cancel,
}

/// Next state and action for a sample.
#[must_use]
pub fn transition(state: IdleState, in_use: bool) -> (IdleState, IdleAction) {
    match (state, in_use) {
        (IdleState::ShutdownScheduled, true) => (IdleState::ActiveOrUnknown, IdleAction::Cancel),
        (IdleState::ActiveOrUnknown, false) => (IdleState::ShutdownScheduled, IdleAction::Schedule),
        (state, _) => (state, IdleAction::None),
    }
}

/// Reads accelerator memory in use.
#[async_trait]
pub trait GpuMemorySampler: Send + Sync {
    /// Bytes in use across all GPUs, or `None` when there is no GPU.
    async fn memory_used(&self) -> Result<Option<u64>, IdleError>;
}

/// Schedules and cancels the machine shutdown.
#[async_trait]
pub trait ShutdownScheduler: Send + Sync {
    /// Shut down after `delay`.
    async fn schedule(&self, delay: Duration) -> Result<(), IdleError>;

    /// Cancel a scheduled shutdown.
    async fn cancel(&self) -> Result<(), IdleError>;
}

/// Samples with `nvidia-smi`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NvidiaSmi;

impl NvidiaSmi {
    /// Sum of per-GPU `memory.used` values (MiB) in bytes.
    fn parse(output: &str) -> Result<Option<u64>, IdleError> {
        let mut total = None;
        for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let mib: u64 = line.parse().map_err(|_| IdleError::Parse {
                program: "nvidia-smi",
                output: output.to_string(),
            })?;
            total = Some(total.unwrap_or(0) + mib * 1024 * 1024);
        }
        Ok(total)
    }
}

#[async_trait]
impl GpuMemorySampler for NvidiaSmi {
    async fn memory_used(&self) -> Result<Option<u64>, IdleError> {
        let output = Command::new("nvidia-smi")
            .args(["--query-gpu=memory.used", "--format=csv,noheader,nounits"])
            .output()
            .await;

        let output = match output {
            Ok(output) => output,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("nvidia-smi not installed, assuming no GPU");
                return Ok(None);
            }
            Err(source) => {
                return Err(IdleError::Spawn {
                    program: "nvidia-smi",
                    source,
                })
            }
        };

        if !output.status.success() {
            return Err(IdleError::Failed {
                program: "nvidia-smi",
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Self::parse(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Schedules with the system `shutdown` command.
#[derive(Debug, Clone, Default)]
pub struct SystemShutdown {
    sudo: bool,
}

impl SystemShutdown {
    /// Create a scheduler. With `sudo`, commands are run through `sudo`.
    #[must_use]
    pub fn new(sudo: bool) -> Self {
        Self { sudo }
    }

    async fn run(&self, args: &[String]) -> Result<(), IdleError> {
        let mut cmd = if self.sudo {
            let mut cmd = Command::new("sudo");
            cmd.arg("shutdown");
            cmd
        } else {
            Command::new("shutdown")
        };

        let output = cmd
            .args(args)
            .output()
            .await
            .map_err(|source| IdleError::Spawn {
                program: "shutdown",
                source,
            })?;

        if !output.status.success() {
            return Err(IdleError::Failed {
                program: "shutdown",
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ShutdownScheduler for SystemShutdown {
    async fn schedule(&self, delay: Duration) -> Result<(), IdleError> {
        // shutdown takes whole minutes; round up so a short delay still waits.
        let minutes = delay.as_secs().div_ceil(60).max(1);
        self.run(&[format!("+{minutes}")]).await
    }

    async fn cancel(&self) -> Result<(), IdleError> {
        self.run(&["-c".to_string()]).await
    }
}

/// Watcher settings.
#[derive(Debug, Clone)]
pub struct IdleConfig {
    /// Memory in use at or above which the GPU counts as busy.
    pub threshold_bytes: u64,
    /// Time between samples.
    pub interval: Duration,
    /// Delay passed to the shutdown scheduler.
    pub shutdown_delay: Duration,
}

impl Default for IdleConfig {
    fn default() -> Self {
        Self {
            threshold_bytes: GIB,
            interval: Duration::from_secs(60),
            shutdown_delay: Duration::from_secs(300),
        }
    }
}

impl IdleConfig {
    /// Build from whole gibibytes, seconds and minutes. `None` if a
    /// value does not fit once converted.
    #[must_use]
    pub fn from_units(threshold_gib: u64, interval_secs: u64, delay_minutes: u64) -> Option<Self> {
        Some(Self {
            threshold_bytes: threshold_gib.checked_mul(GIB)?,
            interval: Duration::from_secs(interval_secs),
            shutdown_delay: Duration::from_secs(delay_minutes.checked_mul(60)?),
        })
    }
}

/// Samples, transitions and acts.
pub struct IdleWatcher<S, D> {
    sampler: S,
    scheduler: D,
    config: IdleConfig,
    state: IdleState,
}

impl<S: GpuMemorySampler, D: ShutdownScheduler> IdleWatcher<S, D> {
    /// Create a watcher in [`IdleState::ActiveOrUnknown`].
    pub fn new(sampler: S, scheduler: D, config: IdleConfig) -> Self {
        Self {
            sampler,
            scheduler,
            config,
            state: IdleState::ActiveOrUnknown,
        }
    }

    /// Current state.
    pub fn state(&self) -> IdleState {
        self.state
    }

    /// Take one sample and apply the resulting transition.
    ///
    /// The state only changes once the action succeeded, so a failed
    /// schedule or cancel is retried on the next tick. A failed sample
    /// leaves the state alone.
    ///
    /// # Errors
    /// Returns sampling or scheduling errors.
    pub async fn tick(&mut self) -> Result<IdleAction, IdleError> {
        let used = self.sampler.memory_used().await?;
        let in_use = used.is_some_and(|bytes| bytes >= self.config.threshold_bytes);
        debug!(used_bytes = ?used, in_use, state = ?self.state, "Sampled GPU memory");

        let (next, action) = transition(self.state, in_use);
        match action {
            IdleAction::None => {}
            IdleAction::Schedule => {
                self.scheduler.schedule(self.config.shutdown_delay).await?;
                info!(
                    delay_secs = self.config.shutdown_delay.as_secs(),
                    "GPU idle, shutdown scheduled"
                );
            }
            IdleAction::Cancel => {
                self.scheduler.cancel().await?;
                info!("GPU in use, shutdown cancelled");
            }
        }
        self.state = next;
        Ok(action)
    }

    /// Tick forever, one sample per interval.
    pub async fn run(&mut self) {
        info!(
            threshold_bytes = self.config.threshold_bytes,
            interval_secs = self.config.interval.as_secs(),
            "Watching GPU usage"
        );
        loop {
            if let Err(e) = self.tick().await {
                warn!(error = %e, "Idle check failed");
            }
            tokio::time::sleep(self.config.interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_transitions() {
        use IdleAction as A;
        use IdleState as S;

        assert_eq!(transition(S::ActiveOrUnknown, true), (S::ActiveOrUnknown, A::None));
        assert_eq!(transition(S::ActiveOrUnknown, false), (S::ShutdownScheduled, A::Schedule));
        assert_eq!(transition(S::ShutdownScheduled, false), (S::ShutdownScheduled, A::None));
        assert_eq!(transition(S::ShutdownScheduled, true), (S::ActiveOrUnknown, A::Cancel));
    }

    #[test]
    fn test_parse_nvidia_smi() {
        assert_eq!(NvidiaSmi::parse("512\n1024\n").unwrap(), Some(1536 * 1024 * 1024));
        assert_eq!(NvidiaSmi::parse("").unwrap(), None);
        assert!(NvidiaSmi::parse("N/A\n").is_err());
    }

    #[derive(Clone)]
    struct FixedSampler(Arc<AtomicU64>);

    #[async_trait]
    impl GpuMemorySampler for FixedSampler {
        async fn memory_used(&self) -> Result<Option<u64>, IdleError> {
            Ok(Some(self.0.load(Ordering::SeqCst)))
        }
    }

    #[derive(Clone, Default)]
    struct CountingScheduler {
        scheduled: Arc<AtomicUsize>,
        cancelled: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ShutdownScheduler for CountingScheduler {
        async fn schedule(&self, _delay: Duration) -> Result<(), IdleError> {
            self.scheduled.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn cancel(&self) -> Result<(), IdleError> {
            self.cancelled.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_watcher_schedules_once_and_cancels_on_use() {
        let used = Arc::new(AtomicU64::new(0));
        let scheduler = CountingScheduler::default();
        let mut watcher = IdleWatcher::new(
            FixedSampler(used.clone()),
            scheduler.clone(),
            IdleConfig::default(),
        );

        assert_eq!(watcher.tick().await.unwrap(), IdleAction::Schedule);
        assert_eq!(watcher.tick().await.unwrap(), IdleAction::None);
        assert_eq!(watcher.state(), IdleState::ShutdownScheduled);
        assert_eq!(scheduler.scheduled.load(Ordering::SeqCst), 1);

        used.store(2 * GIB, Ordering::SeqCst);
        assert_eq!(watcher.tick().await.unwrap(), IdleAction::Cancel);
        assert_eq!(watcher.state(), IdleState::ActiveOrUnknown);
        assert_eq!(scheduler.cancelled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exact_threshold_counts_as_in_use() {
        let used = Arc::new(AtomicU64::new(GIB));
        let mut watcher = IdleWatcher::new(
            FixedSampler(used),
            CountingScheduler::default(),
            IdleConfig::default(),
        );

        assert_eq!(watcher.tick().await.unwrap(), IdleAction::None);
        assert_eq!(watcher.state(), IdleState::ActiveOrUnknown);
    }

    #[test]
    fn test_config_from_units() {
        let config = IdleConfig::from_units(2, 30, 5).unwrap();
        assert_eq!(config.threshold_bytes, 2 * GIB);
        assert_eq!(config.interval, Duration::from_secs(30));
        assert_eq!(config.shutdown_delay, Duration::from_secs(300));

        assert!(IdleConfig::from_units(u64::MAX / 2, 60, 5).is_none());
        assert!(IdleConfig::from_units(1, 60, u64::MAX).is_none());
    }
}
