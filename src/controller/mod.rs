//! Controller implementations for the CodeServer CRD
//!
//! This module contains the reconciliation logic for CodeServer resources.
//! Controllers follow the Kubernetes controller pattern with observe-diff-act loops.

mod client;
mod codeserver;

pub use client::{KubeClient, KubeClientImpl, FIELD_MANAGER};
pub use codeserver::{error_policy, reconcile, Context, ControllerConfig};

#[cfg(test)]
pub use client::MockKubeClient;
