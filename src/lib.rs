//! CodeServer operator - CRD-driven lifecycle management for code-server instances
//!
//! Each `CodeServer` resource gets a Service and a workload (Deployment or
//! bare Pod) running the requested image. Instances carry a lease; once it
//! runs out they are recycled and their children deleted.
//!
//! # Architecture
//!
//! - The reconciler drives a CodeServer through its lifecycle conditions and
//!   keeps its children in line with the spec
//! - After every successful pass it reports the lease to the tracker over a
//!   bounded channel
//! - The tracker owns the lease registry and periodically marks expired
//!   CodeServers as recycled, which triggers teardown on the next pass
//!
//! # Modules
//!
//! - [`crd`] - Custom Resource Definitions and the condition store
//! - [`controller`] - Kubernetes controller reconciliation logic
//! - [`workload`] - Desired child resources and drift detection
//! - [`lease`] - Lease registry and expiration tracker
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod controller;
pub mod crd;
pub mod error;
pub mod lease;
pub mod workload;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
