//! Compute provider implementations.
//!
//! This module contains the [`ComputeProvider`] trait and the GCP
//! Compute Engine implementation.

pub mod gcp;
pub mod traits;

pub use gcp::Gcp;
pub use traits::{
    AcceleratorSpec, ComputeProvider, Disk, DiskSpec, Instance, InstanceSpec, InstanceStatus,
    Operation, OperationErrorDetail, OperationScope, OperationStatus, ProviderError,
    ServiceAccount, Snapshot,
};
