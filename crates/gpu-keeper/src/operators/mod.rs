//! Idempotent building blocks over a [`ComputeProvider`](crate::providers::ComputeProvider).
//!
//! Each operator checks before it creates, so re-running a half-finished
//! failover reuses what already exists.

mod disk;
mod instance;
mod operation;
mod snapshot;

pub use disk::DiskOperator;
pub use instance::InstanceOperator;
pub use operation::OperationWaiter;
pub use snapshot::SnapshotOperator;
