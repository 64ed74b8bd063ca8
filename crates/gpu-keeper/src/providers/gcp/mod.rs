//! GCP (Google Cloud Platform) Compute Engine provider.
//!
//! Implements the [`ComputeProvider`](crate::providers::ComputeProvider)
//! trait over the Compute Engine v1 REST API.
//!
//! ## GPU shapes
//!
//! - **g2-standard-4** + **nvidia-l4**: 4 vCPU, 16GB RAM, 1x L4 24GB
//! - **g2-standard-8** + **nvidia-l4**: 8 vCPU, 32GB RAM, 1x L4 24GB
//! - **n1-standard-8** + **nvidia-tesla-t4**: 8 vCPU, 30GB RAM, 1x T4 16GB
//!
//! L4 capacity in a single zone is regularly exhausted, which is why the
//! keeper relocates instances across zones instead of waiting.

mod auth;
mod client;
mod models;

pub use auth::{GcloudToken, StaticToken, TokenSource};
pub use client::Gcp;
pub use models::*;
