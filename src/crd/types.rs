//! Supporting types for the CodeServer CRD

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Workload shape backing a CodeServer
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum WorkloadRuntime {
    /// Single-replica Deployment
    #[default]
    Deployment,
    /// Bare Pod with restartPolicy Never
    Pod,
}

impl std::fmt::Display for WorkloadRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Deployment => write!(f, "Deployment"),
            Self::Pod => write!(f, "Pod"),
        }
    }
}

/// Condition status following Kubernetes conventions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Lifecycle stage of a code server
///
/// Normal progression is Created -> Ready -> Bound, then Recycled -> Inactive
/// once the lease runs out. Errored can appear at any point.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum ConditionType {
    /// Accepted by the controller
    #[serde(rename = "ServerCreated")]
    Created,
    /// Backing workload exists and matches the spec
    #[serde(rename = "ServerReady")]
    Ready,
    /// Bound to its user
    #[serde(rename = "ServerBound")]
    Bound,
    /// Lease expired; children are to be torn down
    #[serde(rename = "ServerRecycled")]
    Recycled,
    /// Children have been torn down
    #[serde(rename = "ServerInactive")]
    Inactive,
    /// Reconciliation failed in a way that needs an operator
    #[serde(rename = "ServerErrored")]
    Errored,
}

impl std::fmt::Display for ConditionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "ServerCreated"),
            Self::Ready => write!(f, "ServerReady"),
            Self::Bound => write!(f, "ServerBound"),
            Self::Recycled => write!(f, "ServerRecycled"),
            Self::Inactive => write!(f, "ServerInactive"),
            Self::Errored => write!(f, "ServerErrored"),
        }
    }
}

/// Kubernetes-style condition for CodeServer status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition
    #[serde(rename = "type")]
    pub type_: ConditionType,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Reason for the condition's last transition
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,

    /// Free-form details about the transition
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub message: BTreeMap<String, String>,

    /// Last time the condition was updated
    pub last_update_time: DateTime<Utc>,

    /// Last time the condition transitioned from one status to another
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a true condition stamped with the current time
    pub fn new(type_: ConditionType, reason: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            type_,
            status: ConditionStatus::True,
            reason: reason.into(),
            message: BTreeMap::new(),
            last_update_time: now,
            last_transition_time: now,
        }
    }

    /// Attach a message entry and return self for chaining
    pub fn with_message(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.message.insert(key.into(), value.into());
        self
    }

    /// Override the status and return self for chaining
    #[cfg(test)]
    pub(crate) fn with_status(mut self, status: ConditionStatus) -> Self {
        self.status = status;
        self
    }
}

/// Returns true iff a condition of `type_` exists with status True
pub fn has_true(conditions: &[Condition], type_: ConditionType) -> bool {
    conditions
        .iter()
        .any(|c| c.type_ == type_ && c.status == ConditionStatus::True)
}

/// Find the condition of the given type, if any
pub fn find(conditions: &[Condition], type_: ConditionType) -> Option<&Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Append `condition` unless one of the same type is already present
///
/// Returns whether the list was mutated, which tells the caller whether a
/// status write is needed.
pub fn add_if_absent(conditions: &mut Vec<Condition>, condition: Condition) -> bool {
    if find(conditions, condition.type_).is_some() {
        return false;
    }
    conditions.push(condition);
    true
}
