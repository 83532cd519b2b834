//! M3DBCluster Custom Resource Definition
//!
//! The M3DBCluster CRD is the desired document for one M3DB cluster: its
//! image, topology (shards, replication, isolation groups), namespaces, and
//! the etcd endpoints the database coordinates through.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    Condition, ConditionStatus, ConditionType, IsolationGroup, IsolationGroupStatus,
    NamespaceSpec, PodIdentityConfig, ResourcesSpec, StorageSpec,
};

/// Specification for an M3DBCluster
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "operator.m3db.io",
    version = "v1alpha1",
    kind = "M3DBCluster",
    plural = "m3dbclusters",
    shortname = "m3db",
    status = "M3DBClusterStatus",
    namespaced,
    printcolumn = r#"{"name":"ReplicationFactor","type":"integer","jsonPath":".spec.replicationFactor"}"#,
    printcolumn = r#"{"name":"Shards","type":"integer","jsonPath":".spec.numShards"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct M3DBClusterSpec {
    /// Container image for database nodes
    pub image: String,

    /// Number of copies of each shard, distributed across isolation groups
    pub replication_factor: i32,

    /// Total number of shards; fixed at placement initialization
    pub num_shards: i32,

    /// Ordered list of failure domains instances are spread across
    pub isolation_groups: Vec<IsolationGroup>,

    /// Endpoints of the external etcd cluster used for coordination
    pub etcd_endpoints: Vec<String>,

    /// Namespaces to manage in the database
    #[serde(default)]
    pub namespaces: Vec<NamespaceSpec>,

    /// Sources the stable pod identity is derived from
    #[serde(default)]
    pub pod_identity_config: PodIdentityConfig,

    /// Environment name namespacing placement state within a shared etcd
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,

    /// Resource requests and limits for database pods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourcesSpec>,

    /// Persistent storage per pod; ephemeral emptyDir when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageSpec>,

    /// Enable the carbon line-protocol ingester on coordinators
    #[serde(default)]
    pub enable_carbon_ingester: bool,
}

impl M3DBClusterSpec {
    /// Validate the invariants of the desired document.
    ///
    /// Rejects replication factors exceeding the isolation group count: a
    /// placement cannot spread R copies across fewer than R groups.
    pub fn validate(&self) -> Result<(), crate::Error> {
        if !(1..=3).contains(&self.replication_factor) {
            return Err(crate::Error::validation(format!(
                "replication factor must be 1, 2, or 3, got {}",
                self.replication_factor
            )));
        }

        if self.num_shards < 1
            || self.num_shards > 4096
            || self.num_shards.count_ones() != 1
        {
            return Err(crate::Error::validation(format!(
                "num shards must be a power of two in 1..=4096, got {}",
                self.num_shards
            )));
        }

        if self.isolation_groups.is_empty() {
            return Err(crate::Error::validation(
                "at least one isolation group is required",
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for group in &self.isolation_groups {
            if group.name.is_empty() {
                return Err(crate::Error::validation("isolation group name is empty"));
            }
            if !seen.insert(group.name.as_str()) {
                return Err(crate::Error::validation(format!(
                    "duplicate isolation group '{}'",
                    group.name
                )));
            }
            if group.num_instances < 0 {
                return Err(crate::Error::validation(format!(
                    "isolation group '{}' has negative instance count",
                    group.name
                )));
            }
        }

        if (self.isolation_groups.len() as i32) < self.replication_factor {
            return Err(crate::Error::validation(format!(
                "replication factor {} exceeds isolation group count {}",
                self.replication_factor,
                self.isolation_groups.len()
            )));
        }

        let total: i32 = self.isolation_groups.iter().map(|g| g.num_instances).sum();
        if total < self.replication_factor {
            return Err(crate::Error::validation(format!(
                "total instance count {} is below replication factor {}",
                total, self.replication_factor
            )));
        }

        if self.etcd_endpoints.is_empty() {
            return Err(crate::Error::validation(
                "at least one etcd endpoint is required",
            ));
        }

        if self.pod_identity_config.sources.is_empty() {
            return Err(crate::Error::validation(
                "pod identity source set must not be empty",
            ));
        }

        let mut ns_seen = std::collections::HashSet::new();
        for ns in &self.namespaces {
            if !ns_seen.insert(ns.name.as_str()) {
                return Err(crate::Error::validation(format!(
                    "duplicate namespace '{}'",
                    ns.name
                )));
            }
            match (&ns.preset, &ns.options) {
                (Some(_), Some(_)) => {
                    return Err(crate::Error::validation(format!(
                        "namespace '{}' sets both preset and options",
                        ns.name
                    )));
                }
                (None, None) => {
                    return Err(crate::Error::validation(format!(
                        "namespace '{}' sets neither preset nor options",
                        ns.name
                    )));
                }
                _ => {}
            }
        }

        Ok(())
    }

    /// Total target instance count across all groups
    pub fn total_instances(&self) -> i32 {
        self.isolation_groups.iter().map(|g| g.num_instances).sum()
    }
}

/// Status subresource for an M3DBCluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct M3DBClusterStatus {
    /// Derived conditions observers key off
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Generation of the spec this status reflects
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Per-group pod counts
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub isolation_groups: Vec<IsolationGroupStatus>,
}

impl M3DBClusterStatus {
    /// Look up a condition by type
    pub fn condition(&self, type_: ConditionType) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    /// Whether the given condition is currently True
    pub fn is_condition_true(&self, type_: ConditionType) -> bool {
        self.condition(type_)
            .map(|c| c.status == ConditionStatus::True)
            .unwrap_or(false)
    }

    /// Set a condition, preserving the transition time when the status is
    /// unchanged so conditions never flap within a pass. A condition whose
    /// status, reason, and message all match the existing one is left
    /// untouched, keeping no-op passes from dirtying the status.
    pub fn set_condition(&mut self, condition: Condition) {
        match self.conditions.iter_mut().find(|c| c.type_ == condition.type_) {
            Some(existing) => {
                if existing.status == condition.status
                    && existing.reason == condition.reason
                    && existing.message == condition.message
                {
                    return;
                }
                let transition = if existing.status == condition.status {
                    existing.last_transition_time
                } else {
                    condition.last_transition_time
                };
                *existing = Condition {
                    last_transition_time: transition,
                    ..condition
                };
            }
            None => self.conditions.push(condition),
        }
    }

    /// Whether the placement has ever been successfully initialized
    pub fn placement_initialized(&self) -> bool {
        self.is_condition_true(ConditionType::PlacementInitialized)
    }
}
