//! Placement wire types for the coordinator admin API.
//!
//! The placement is the etcd-stored mapping from instance ids to shard
//! assignments, authoritative for cluster topology. Bodies on the wire are
//! JSON-encoded protobuf with camelCase field names.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

/// State of one shard assignment on one instance
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub enum ShardState {
    /// The instance is streaming the shard's data and not yet serving it
    #[serde(rename = "INITIALIZING")]
    Initializing,
    /// The instance owns the shard and serves reads and writes for it
    #[serde(rename = "AVAILABLE")]
    Available,
    /// The shard is being handed off to another instance
    #[serde(rename = "LEAVING")]
    Leaving,
}

/// One shard assignment carried by an instance
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Shard {
    /// Shard id in 0..numShards
    pub id: u32,

    /// Assignment state
    pub state: ShardState,

    /// Instance the shard is streamed from while INITIALIZING
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
}

/// A logical database member in the placement
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PlacementInstance {
    /// Stable identity hash; decoupled from the pod name
    pub id: String,

    /// Rack tag; the isolation group the backing pod runs in
    pub isolation_group: String,

    /// Zone tag within the coordination store
    pub zone: String,

    /// Relative weight for shard distribution
    pub weight: u32,

    /// host:port peers dial for data traffic
    pub endpoint: String,

    /// Stable DNS hostname of the backing pod
    pub hostname: String,

    /// Data port
    pub port: u32,

    /// Shards currently assigned to this instance
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub shards: Vec<Shard>,
}

impl PlacementInstance {
    /// Whether any assigned shard is in the given state
    pub fn has_shard_in_state(&self, state: ShardState) -> bool {
        self.shards.iter().any(|s| s.state == state)
    }

    /// Whether every assigned shard is AVAILABLE
    pub fn all_shards_available(&self) -> bool {
        self.shards.iter().all(|s| s.state == ShardState::Available)
    }
}

/// A placement snapshot as returned by the coordinator
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Placement {
    /// Instances keyed by id
    #[serde(default)]
    pub instances: BTreeMap<String, PlacementInstance>,

    /// Number of copies of each shard
    #[serde(default)]
    pub replica_factor: u32,

    /// Total shard count, fixed at initialization
    #[serde(default)]
    pub num_shards: u32,
}

impl Placement {
    /// A placement is stable iff every shard has exactly replicaFactor
    /// assignments, every assignment is AVAILABLE, and no instance carries
    /// INITIALIZING or LEAVING shards.
    pub fn is_stable(&self) -> bool {
        if self.instances.is_empty() || self.num_shards == 0 {
            return false;
        }

        let mut assignments: HashMap<u32, u32> = HashMap::new();
        for instance in self.instances.values() {
            for shard in &instance.shards {
                if shard.state != ShardState::Available {
                    return false;
                }
                *assignments.entry(shard.id).or_insert(0) += 1;
            }
        }

        assignments.len() == self.num_shards as usize
            && assignments.values().all(|&n| n == self.replica_factor)
    }

    /// Ids of instances with at least one LEAVING shard, excluding `except`
    pub fn leaving_instances(&self, except: Option<&str>) -> Vec<&str> {
        self.instances
            .values()
            .filter(|i| Some(i.id.as_str()) != except)
            .filter(|i| i.has_shard_in_state(ShardState::Leaving))
            .map(|i| i.id.as_str())
            .collect()
    }

    /// Distinct isolation groups present, optionally excluding one instance
    pub fn groups_without(&self, except: Option<&str>) -> std::collections::HashSet<&str> {
        self.instances
            .values()
            .filter(|i| Some(i.id.as_str()) != except)
            .map(|i| i.isolation_group.as_str())
            .collect()
    }
}

/// Request body for POST placement/init
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PlacementInitRequest {
    /// Initial instance list
    pub instances: Vec<PlacementInstance>,

    /// Total shard count
    pub num_shards: u32,

    /// Copies of each shard
    pub replication_factor: u32,
}

/// Request body for POST placement (add instances)
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PlacementAddRequest {
    /// Instances to add
    pub instances: Vec<PlacementInstance>,
}

/// Request body for POST placement/{id}/weight
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SetWeightRequest {
    /// New weight for the instance
    pub weight: u32,
}

/// Response envelope wrapping a placement snapshot
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlacementResponse {
    /// The placement
    #[serde(default)]
    pub placement: Placement,

    /// Storage version of the snapshot
    #[serde(default)]
    pub version: i32,
}


#[cfg(test)]
mod tests {
    use super::fixtures::{available_instance, placement};
    use super::*;

    #[test]
    fn replicated_available_placement_is_stable() {
        // 2 shards, RF=2, both shards on both instances
        let p = placement(
            2,
            2,
            vec![
                available_instance("a", "g1", &[0, 1]),
                available_instance("b", "g2", &[0, 1]),
            ],
        );
        assert!(p.is_stable());
    }

    #[test]
    fn initializing_shard_breaks_stability() {
        let mut inst = available_instance("a", "g1", &[0, 1]);
        inst.shards[0].state = ShardState::Initializing;
        let p = placement(2, 2, vec![inst, available_instance("b", "g2", &[0, 1])]);
        assert!(!p.is_stable());
    }

    #[test]
    fn missing_replica_breaks_stability() {
        // shard 1 only has one copy
        let p = placement(
            2,
            2,
            vec![
                available_instance("a", "g1", &[0]),
                available_instance("b", "g2", &[0, 1]),
            ],
        );
        assert!(!p.is_stable());
    }

    #[test]
    fn empty_placement_is_not_stable() {
        assert!(!Placement::default().is_stable());
    }

    #[test]
    fn leaving_instances_excludes_candidate() {
        let mut inst = available_instance("a", "g1", &[0]);
        inst.shards[0].state = ShardState::Leaving;
        let p = placement(1, 1, vec![inst, available_instance("b", "g2", &[0])]);
        assert_eq!(p.leaving_instances(None), vec!["a"]);
        assert!(p.leaving_instances(Some("a")).is_empty());
    }

    #[test]
    fn shard_state_wire_names_are_upper_case() {
        assert_eq!(
            serde_json::to_string(&ShardState::Initializing).unwrap(),
            "\"INITIALIZING\""
        );
        assert_eq!(
            serde_json::to_string(&ShardState::Leaving).unwrap(),
            "\"LEAVING\""
        );
    }

    #[test]
    fn placement_response_decodes_coordinator_shape() {
        let body = r#"{
            "placement": {
                "instances": {
                    "abc": {
                        "id": "abc",
                        "isolationGroup": "g1",
                        "zone": "embedded",
                        "weight": 100,
                        "endpoint": "pod-0.cluster:9000",
                        "hostname": "pod-0",
                        "port": 9000,
                        "shards": [{"id": 0, "state": "AVAILABLE"}]
                    }
                },
                "replicaFactor": 1,
                "numShards": 1
            },
            "version": 2
        }"#;
        let resp: PlacementResponse = serde_json::from_str(body).unwrap();
        assert_eq!(resp.version, 2);
        assert!(resp.placement.is_stable());
        assert_eq!(resp.placement.instances["abc"].isolation_group, "g1");
    }
}
