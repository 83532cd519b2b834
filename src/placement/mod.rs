//! Pure placement computations.
//!
//! Given the desired document and a current placement snapshot, these
//! functions compute the expected instance set, the instances to add, the
//! single safe removal candidate for this pass, and the initial instance
//! list. No I/O happens here; the reconciler re-reads the placement before
//! acting on any decision made from these values.

use std::collections::HashSet;

use crate::admin::{Placement, PlacementInstance};
use crate::crd::M3DBClusterSpec;
use crate::{INSTANCE_WEIGHT, PLACEMENT_ZONE, PORT_NODE};

/// A live database pod with its resolved identity and placement ordinal.
///
/// Built by the reconciler from observed pods; everything downstream of
/// this type is pure.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedPod {
    /// Pod name
    pub pod_name: String,

    /// Isolation group the pod belongs to (from its workload)
    pub group: String,

    /// StatefulSet ordinal parsed from the pod name
    pub ordinal: u32,

    /// Identity hash referencing this pod in the placement
    pub instance_id: String,

    /// Stable DNS name peers reach the pod at
    pub hostname: String,

    /// Whether the pod currently passes readiness
    pub ready: bool,
}

impl ResolvedPod {
    /// Data endpoint recorded on the placement instance
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.hostname, PORT_NODE)
    }
}

/// The single removal candidate for a pass, with how it was selected
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoveCandidate {
    /// Placement instance id to remove
    pub instance_id: String,

    /// Current weight of the instance in the placement
    pub weight: u32,

    /// Isolation group recorded on the instance
    pub group: String,

    /// Whether the id no longer maps to any live pod
    pub orphaned: bool,
}

fn target_for<'a>(spec: &'a M3DBClusterSpec, group: &str) -> i32 {
    spec.isolation_groups
        .iter()
        .find(|g| g.name == group)
        .map(|g| g.num_instances)
        .unwrap_or(0)
}

/// Pods that should be placement members: for each isolation group g with
/// target n(g), the pods of ordinals 0..n(g).
pub fn expected_pods<'a>(
    spec: &M3DBClusterSpec,
    pods: &'a [ResolvedPod],
) -> Vec<&'a ResolvedPod> {
    pods.iter()
        .filter(|p| (p.ordinal as i32) < target_for(spec, &p.group))
        .collect()
}

/// Whether placement initialization may proceed: every group with a
/// non-zero target has its ordinal-0 pod resolved and ready.
pub fn ready_for_init(spec: &M3DBClusterSpec, pods: &[ResolvedPod]) -> bool {
    spec.isolation_groups
        .iter()
        .filter(|g| g.num_instances > 0)
        .all(|g| {
            pods.iter()
                .any(|p| p.group == g.name && p.ordinal == 0 && p.ready)
        })
}

/// Instance record for a resolved pod, tagged with its group as rack
pub fn build_instance(pod: &ResolvedPod) -> PlacementInstance {
    PlacementInstance {
        id: pod.instance_id.clone(),
        isolation_group: pod.group.clone(),
        zone: PLACEMENT_ZONE.to_string(),
        weight: INSTANCE_WEIGHT,
        endpoint: pod.endpoint(),
        hostname: pod.hostname.clone(),
        port: PORT_NODE,
        shards: Vec::new(),
    }
}

/// Initial placement instance list: every expected pod that is ready,
/// in group declaration order then ordinal order.
pub fn initial_instances(spec: &M3DBClusterSpec, pods: &[ResolvedPod]) -> Vec<PlacementInstance> {
    let mut instances = Vec::new();
    for group in &spec.isolation_groups {
        let mut members: Vec<&ResolvedPod> = pods
            .iter()
            .filter(|p| {
                p.group == group.name && (p.ordinal as i32) < group.num_instances && p.ready
            })
            .collect();
        members.sort_by_key(|p| p.ordinal);
        instances.extend(members.into_iter().map(build_instance));
    }
    instances
}

/// Expected pods that are ready but absent from the placement, in group
/// declaration order.
pub fn instances_to_add(
    spec: &M3DBClusterSpec,
    pods: &[ResolvedPod],
    placement: &Placement,
) -> Vec<PlacementInstance> {
    let mut to_add = Vec::new();
    for group in &spec.isolation_groups {
        let mut members: Vec<&ResolvedPod> = pods
            .iter()
            .filter(|p| {
                p.group == group.name
                    && (p.ordinal as i32) < group.num_instances
                    && p.ready
                    && !placement.instances.contains_key(&p.instance_id)
            })
            .collect();
        members.sort_by_key(|p| p.ordinal);
        to_add.extend(members.into_iter().map(build_instance));
    }
    to_add
}

/// Choose at most one instance to remove this pass.
///
/// Candidates are placement instances whose id is outside the expected
/// set. An id still backed by a live pod (a beyond-target ordinal during
/// scale-down) is eligible immediately; an id with no live pod is an
/// orphan and eligible only once its grace period has expired. The total
/// order prefers the highest ordinal, then the lexicographically smallest
/// id; orphans sort before any live pod.
pub fn remove_candidate(
    spec: &M3DBClusterSpec,
    pods: &[ResolvedPod],
    placement: &Placement,
    expired_orphans: &HashSet<String>,
) -> Option<RemoveCandidate> {
    let expected_ids: HashSet<&str> = expected_pods(spec, pods)
        .into_iter()
        .map(|p| p.instance_id.as_str())
        .collect();

    let mut candidates: Vec<(u64, &PlacementInstance, bool)> = Vec::new();
    for instance in placement.instances.values() {
        if expected_ids.contains(instance.id.as_str()) {
            continue;
        }
        match pods.iter().find(|p| p.instance_id == instance.id) {
            Some(pod) => candidates.push((pod.ordinal as u64, instance, false)),
            None => {
                if expired_orphans.contains(&instance.id) {
                    candidates.push((u64::MAX, instance, true));
                }
            }
        }
    }

    candidates.sort_by(|(ord_a, a, _), (ord_b, b, _)| {
        ord_b.cmp(ord_a).then_with(|| a.id.cmp(&b.id))
    });

    candidates.first().map(|(_, instance, orphaned)| RemoveCandidate {
        instance_id: instance.id.clone(),
        weight: instance.weight,
        group: instance.isolation_group.clone(),
        orphaned: *orphaned,
    })
}

/// Ids present in the placement with no matching live pod. The reconciler
/// tracks when each first appeared to enforce the orphan grace period.
pub fn orphan_ids(placement: &Placement, pods: &[ResolvedPod]) -> Vec<String> {
    let live: HashSet<&str> = pods.iter().map(|p| p.instance_id.as_str()).collect();
    placement
        .instances
        .keys()
        .filter(|id| !live.contains(id.as_str()))
        .cloned()
        .collect()
}

/// Safety predicate for removal: the placement is stable, no other
/// instance is mid-departure, and removing the candidate still leaves at
/// least R instances spread over at least R distinct isolation groups.
pub fn is_safe_to_remove(placement: &Placement, candidate_id: &str, rf: u32) -> bool {
    if !placement.is_stable() {
        return false;
    }
    if !placement.leaving_instances(Some(candidate_id)).is_empty() {
        return false;
    }

    let remaining = placement
        .instances
        .values()
        .filter(|i| i.id != candidate_id)
        .count() as u32;
    if remaining < rf {
        return false;
    }

    (placement.groups_without(Some(candidate_id)).len() as u32) >= rf
}
