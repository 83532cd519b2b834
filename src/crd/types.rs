//! Shared types used by the M3DBCluster CRD

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A rack-like failure domain within the cluster.
///
/// Instances placed in a group carry the group name as their rack tag;
/// the placement distributes each shard's replicas across distinct groups.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IsolationGroup {
    /// Group name, used as the rack tag on placement instances
    pub name: String,

    /// Target number of database instances in this group
    pub num_instances: i32,
}

/// Metadata sources the pod identity hash is computed from.
///
/// Identity is durable across pod restarts iff its sources are durable:
/// `PodName` survives StatefulSet rescheduling, `PodUID` does not.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum PodIdentitySource {
    /// The pod's name (stable under StatefulSet ordinal reuse)
    PodName,
    /// The pod's UID (changes on every reschedule)
    PodUID,
    /// Name of the node the pod is bound to
    NodeName,
    /// External IP of the node the pod is bound to
    NodeExternalID,
    /// Cloud provider ID of the node the pod is bound to
    NodeProviderID,
}

/// Configuration of the pod identity source set
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PodIdentityConfig {
    /// Ordered, non-empty set of identity sources
    pub sources: Vec<PodIdentitySource>,
}

impl Default for PodIdentityConfig {
    fn default() -> Self {
        Self {
            sources: vec![PodIdentitySource::PodName],
        }
    }
}

/// A database-level namespace to manage in the cluster.
///
/// Retention is configured either by preset identifier or by explicit
/// options; exactly one of the two must be set.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceSpec {
    /// Namespace name, unique within the cluster
    pub name: String,

    /// Retention preset identifier (e.g. "10s:2d", "1m:40d")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preset: Option<String>,

    /// Explicit retention options
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<NamespaceOptions>,
}

/// Explicit namespace retention configuration.
///
/// Durations are Go-style strings ("48h", "10m") passed through to the
/// coordinator unparsed.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceOptions {
    /// How long written data is retained
    pub retention_period: String,

    /// Data block size
    pub block_size: String,

    /// Index block size
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_block_size: Option<String>,

    /// How far in the past out-of-order writes are accepted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buffer_past: Option<String>,

    /// How far in the future writes are accepted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buffer_future: Option<String>,

    /// Whether writes are indexed for query
    #[serde(default = "default_true")]
    pub index_enabled: bool,
}

fn default_true() -> bool {
    true
}

/// Persistent storage request for database pods
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StorageSpec {
    /// Volume size (e.g. "256Gi")
    pub size: String,

    /// Storage class name; cluster default when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
}

/// CPU and memory amounts for one side of a resource requirement
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceAmounts {
    /// CPU quantity (e.g. "4")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,

    /// Memory quantity (e.g. "8Gi")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

/// Resource requirements for database pods
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResourcesSpec {
    /// Requested resources
    #[serde(default)]
    pub requests: ResourceAmounts,

    /// Resource limits
    #[serde(default)]
    pub limits: ResourceAmounts,
}

/// Status of a condition: True, False, or Unknown
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition holds
    True,
    /// Condition does not hold
    False,
    /// Condition could not be determined
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

/// Condition types the reconciler derives for observers
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionType {
    /// The placement has been initialized in etcd
    PlacementInitialized,
    /// One or more nodes are loading their assigned shard data
    PodsBootstrapping,
    /// Placement stable, all pods ready, all namespaces present
    Available,
    /// The desired document failed validation; mutations are suspended
    Invalid,
}

impl std::fmt::Display for ConditionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PlacementInitialized => write!(f, "PlacementInitialized"),
            Self::PodsBootstrapping => write!(f, "PodsBootstrapping"),
            Self::Available => write!(f, "Available"),
            Self::Invalid => write!(f, "Invalid"),
        }
    }
}

/// A single observed condition on the cluster status
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type
    #[serde(rename = "type")]
    pub type_: ConditionType,

    /// Status of the condition
    pub status: ConditionStatus,

    /// Machine-readable reason for the current status
    pub reason: String,

    /// Human-readable message
    #[serde(default)]
    pub message: String,

    /// Last time the status field changed
    pub last_transition_time: DateTime<Utc>,

    /// Last time the condition was evaluated
    pub last_update_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition stamped with the current time
    pub fn new(
        type_: ConditionType,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            type_,
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: now,
            last_update_time: now,
        }
    }
}

/// Per-isolation-group instance counts surfaced on the status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IsolationGroupStatus {
    /// Group name
    pub name: String,

    /// Pods currently passing readiness
    pub ready_instances: i32,

    /// Pods that exist for the group
    pub total_instances: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_sources_default_to_pod_name() {
        let config = PodIdentityConfig::default();
        assert_eq!(config.sources, vec![PodIdentitySource::PodName]);
    }

    #[test]
    fn condition_status_serializes_as_kubernetes_strings() {
        assert_eq!(
            serde_json::to_string(&ConditionStatus::True).unwrap(),
            "\"True\""
        );
        assert_eq!(ConditionStatus::Unknown.to_string(), "Unknown");
    }

    #[test]
    fn namespace_options_round_trip() {
        let options = NamespaceOptions {
            retention_period: "48h".to_string(),
            block_size: "2h".to_string(),
            index_block_size: Some("4h".to_string()),
            buffer_past: Some("10m".to_string()),
            buffer_future: Some("10m".to_string()),
            index_enabled: true,
        };
        let json = serde_json::to_string(&options).unwrap();
        assert!(json.contains("\"retentionPeriod\":\"48h\""));
        let back: NamespaceOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(back, options);
    }

    #[test]
    fn condition_new_stamps_both_timestamps() {
        let c = Condition::new(
            ConditionType::Available,
            ConditionStatus::True,
            "ClusterAvailable",
            "",
        );
        assert_eq!(c.last_transition_time, c.last_update_time);
    }
}
