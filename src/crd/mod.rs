//! Custom Resource Definitions for the CodeServer operator
//!
//! This module contains the CodeServer CRD and its condition store.

mod codeserver;
mod types;

pub use codeserver::{CodeServer, CodeServerSpec, CodeServerStatus, DEFAULT_LEASE_SECONDS};
pub use types::{
    add_if_absent, find, has_true, Condition, ConditionStatus, ConditionType, WorkloadRuntime,
};
