//! Keep one GPU instance available for a workload.
//!
//! GPU capacity in a single cloud zone runs out regularly. This crate keeps
//! one logical GPU instance per server type reachable: it starts the
//! instance on demand, and when the zone cannot start it, recreates the
//! instance from a golden disk snapshot in another zone of the preferred
//! region.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                           Workload                           │
//! │        get_ip()                         execute(call)        │
//! └──────────┬──────────────────────────────────┬────────────────┘
//!            ▼                                  ▼
//! ┌──────────────────────────┐   stop / ┌──────────────────────┐
//! │ InstanceLifecycleManager │◄─────────│  ResilientExecutor   │
//! │  • handle + IP cache     │ ensure_  │  • transient retry   │
//! │  • start / stop          │  ready   │  • reconnect backoff │
//! │  • zone failover         │          └──────────────────────┘
//! └──────────┬───────────────┘
//!            ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │  OperationWaiter · DiskOperator · SnapshotOperator ·         │
//! │  InstanceOperator                                            │
//! └──────────┬───────────────────────────────────────────────────┘
//!            ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │        ComputeProvider (GCP Compute Engine REST API)         │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The [`idle`] watcher runs on the instance itself and shuts it down once
//! the GPU has been idle for a while.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use gpu_keeper::{FileHandleStore, Gcp, HttpProbe, InstanceLifecycleManager, KeeperConfig};
//!
//! let config = KeeperConfig::new("my-project", "asr");
//! let provider = Arc::new(Gcp::new(&config.project_id, token)?);
//! let store = Arc::new(FileHandleStore::new(&config.cache_dir, &config.project_id));
//! let probe = Arc::new(HttpProbe::new(config.timings.probe_timeout)?);
//!
//! let manager = InstanceLifecycleManager::new(provider, store, probe, config)?;
//! let ip = manager.get_ip(Some(8000)).await?;
//! ```

pub mod cache;
pub mod classify;
pub mod config;
pub mod executor;
pub mod failover;
pub mod idle;
pub mod lifecycle;
pub mod operators;
pub mod probe;
pub mod providers;
pub mod retry;

pub use cache::{CacheError, FileHandleStore, HandleStore, InstanceHandle, MemoryHandleStore};
pub use classify::{Classify, ErrorKind};
pub use config::{ConfigError, KeeperConfig, Timings};
pub use executor::{ExecutorError, InstanceControl, Outcome, ResilientExecutor};
pub use lifecycle::{InstanceLifecycleManager, LifecycleError};
pub use probe::{HttpProbe, LivenessProbe, NoProbe};
pub use providers::gcp::Gcp;
pub use providers::traits::{ComputeProvider, Instance, InstanceStatus, ProviderError};
pub use retry::{DelayPolicy, RetryPolicy};
