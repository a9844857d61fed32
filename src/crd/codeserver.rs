//! CodeServer Custom Resource Definition
//!
//! A CodeServer is a single browser IDE instance backed by a Deployment (or a
//! bare Pod) plus a Service. Each instance holds a lease and is recycled once
//! the lease runs out.

use k8s_openapi::api::core::v1::EnvVar;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{self, Condition, ConditionType, WorkloadRuntime};

/// Lease applied when `recycleAfterSeconds` is absent or not positive
pub const DEFAULT_LEASE_SECONDS: i64 = 100;

/// Specification for a CodeServer
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "code.zjm.com",
    version = "v1",
    kind = "CodeServer",
    plural = "codeservers",
    shortname = "cs",
    status = "CodeServerStatus",
    namespaced,
    printcolumn = r#"{"name":"Image","type":"string","jsonPath":".spec.image"}"#,
    printcolumn = r#"{"name":"Recycle","type":"integer","jsonPath":".spec.recycleAfterSeconds"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CodeServerSpec {
    /// Container image for the code server
    #[serde(default)]
    pub image: String,

    /// Display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Seconds the instance may live before it is recycled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recycle_after_seconds: Option<i64>,

    /// Seconds of inactivity after which the instance counts as idle
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inactive_after_seconds: Option<i64>,

    /// Extend an already running lease instead of leaving it untouched
    #[serde(default)]
    pub add: bool,

    /// Environment for the code server container, passed through unchanged
    ///
    /// Entries may use `valueFrom` (secretKeyRef, configMapKeyRef, fieldRef).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub envs: Vec<EnvVar>,

    /// Workload shape backing this instance
    ///
    /// Changing it replaces the workload: the controller deletes the other kind.
    #[serde(default)]
    pub runtime: WorkloadRuntime,
}

impl CodeServerSpec {
    /// Effective lease in seconds with a caller-supplied fallback
    pub fn lease_seconds_or(&self, default: i64) -> i64 {
        match self.recycle_after_seconds {
            Some(secs) if secs > 0 => secs,
            _ => default,
        }
    }
}

/// Status for a CodeServer
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CodeServerStatus {
    /// Lifecycle conditions, in the order they were first recorded
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl CodeServerStatus {
    /// Returns true iff a condition of `type_` is present with status True
    pub fn has_true(&self, type_: ConditionType) -> bool {
        types::has_true(&self.conditions, type_)
    }

    /// Append `condition` unless its type is already present
    pub fn add_if_absent(&mut self, condition: Condition) -> bool {
        types::add_if_absent(&mut self.conditions, condition)
    }

    /// Add a condition and return self for chaining
    #[cfg(test)]
    pub(crate) fn condition(mut self, condition: Condition) -> Self {
        self.add_if_absent(condition);
        self
    }
}

impl CodeServer {
    /// Returns true iff the resource's status holds a true condition of `type_`
    pub fn has_condition(&self, type_: ConditionType) -> bool {
        self.status
            .as_ref()
            .map(|s| s.has_true(type_))
            .unwrap_or(false)
    }
}
