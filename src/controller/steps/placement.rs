//! Placement lifecycle steps: bootstrap, expansion, and safe scale-down.
//!
//! Every step re-reads the placement immediately before acting; no view
//! from an earlier pass is ever trusted. Scale-down is three separate
//! passes keyed purely off observed placement state: a candidate with
//! weight != 0 gets its weight zeroed, a candidate with weight 0 is
//! removed, and once the id is gone from the placement the workload's
//! replica count is reduced.

use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, info};

use crate::admin::{AdminError, PlacementInitRequest};
use crate::controller::status::surface_condition;
use crate::controller::Context;
use crate::crd::{Condition, ConditionStatus, ConditionType, M3DBCluster};
use crate::events::{actions, reasons};
use crate::metrics::record_placement_mutation;
use crate::placement::{
    initial_instances, instances_to_add, is_safe_to_remove, orphan_ids, ready_for_init,
    remove_candidate,
};
use crate::resources::{stateful_set_name, sts_replicas};
use crate::{Error, Result};

use super::{cluster_key, observe_pods, StepResult, REQUEUE_SHORT};

/// Initialize the placement once every group has a ready ordinal-0 pod
/// with a resolvable identity.
pub async fn bootstrap(cluster: &M3DBCluster, ctx: &Context) -> Result<StepResult> {
    let admin = ctx.admin.for_cluster(cluster);

    if let Some(placement) = admin.get_placement().await.map_err(Error::Admin)? {
        // The shard count and replication factor are fixed for the life
        // of the placement.
        if placement.num_shards != cluster.spec.num_shards as u32
            || placement.replica_factor != cluster.spec.replication_factor as u32
        {
            return Err(Error::validation(format!(
                "numShards/replicationFactor are immutable after placement initialization \
                 (placement has shards={}, rf={})",
                placement.num_shards, placement.replica_factor
            )));
        }
        return Ok(StepResult::Skip);
    }

    let pods = observe_pods(cluster, ctx).await?;
    if !ready_for_init(&cluster.spec, &pods) {
        debug!("waiting for one ready pod per isolation group before init");
        return Ok(StepResult::Wait(Action::requeue(REQUEUE_SHORT)));
    }

    let instances = initial_instances(&cluster.spec, &pods);
    let request = PlacementInitRequest {
        instances,
        num_shards: cluster.spec.num_shards as u32,
        replication_factor: cluster.spec.replication_factor as u32,
    };
    info!(
        instances = request.instances.len(),
        shards = request.num_shards,
        rf = request.replication_factor,
        "initializing placement"
    );
    admin.init_placement(&request).await.map_err(Error::Admin)?;
    record_placement_mutation(&cluster.name_any(), "init");

    ctx.events
        .publish(
            &cluster.object_ref(&()),
            EventType::Normal,
            reasons::PLACEMENT_INITIALIZED,
            actions::RECONCILE,
            Some(format!("{} instances", request.instances.len())),
        )
        .await;
    surface_condition(
        cluster,
        ctx,
        Condition::new(
            ConditionType::PlacementInitialized,
            ConditionStatus::True,
            "PlacementCreated",
            "",
        ),
    )
    .await?;

    Ok(StepResult::Mutated(Action::requeue(REQUEUE_SHORT)))
}

/// Add expected instances that are ready but missing from the placement
pub async fn expand(cluster: &M3DBCluster, ctx: &Context) -> Result<StepResult> {
    let admin = ctx.admin.for_cluster(cluster);
    let Some(placement) = admin.get_placement().await.map_err(Error::Admin)? else {
        return Ok(StepResult::Skip);
    };

    let pods = observe_pods(cluster, ctx).await?;
    let to_add = instances_to_add(&cluster.spec, &pods, &placement);
    if to_add.is_empty() {
        return Ok(StepResult::Skip);
    }

    if !placement.is_stable() {
        debug!("placement not stable, deferring instance add");
        return Ok(StepResult::Wait(Action::requeue(REQUEUE_SHORT)));
    }

    let ids: Vec<String> = to_add.iter().map(|i| i.id.clone()).collect();
    info!(?ids, "adding instances to placement");
    match admin.add_instances(to_add).await {
        Ok(_) => {}
        // Another writer got there first; the next pass re-reads
        Err(AdminError::Conflict(_)) => {}
        Err(e) if matches!(&e, AdminError::Unexpected { status: 409, .. }) => {}
        Err(e) => return Err(e.into()),
    }
    record_placement_mutation(&cluster.name_any(), "add");

    ctx.events
        .publish(
            &cluster.object_ref(&()),
            EventType::Normal,
            reasons::INSTANCES_ADDED,
            actions::SCALE,
            Some(ids.join(", ")),
        )
        .await;

    Ok(StepResult::Mutated(Action::requeue(REQUEUE_SHORT)))
}

/// Drive the three-pass scale-down dance and, once the placement no
/// longer references a group's surplus pods, shrink that workload.
pub async fn scale_down(cluster: &M3DBCluster, ctx: &Context) -> Result<StepResult> {
    let admin = ctx.admin.for_cluster(cluster);
    let Some(placement) = admin.get_placement().await.map_err(Error::Admin)? else {
        return Ok(StepResult::Skip);
    };

    let pods = observe_pods(cluster, ctx).await?;
    let orphans = orphan_ids(&placement, &pods);
    let expired = ctx.expired_orphans(&cluster_key(cluster), &orphans);

    if let Some(candidate) =
        remove_candidate(&cluster.spec, &pods, &placement, &expired)
    {
        if !placement.is_stable() {
            debug!(candidate = %candidate.instance_id, "placement not stable, deferring removal");
            return Ok(StepResult::Wait(Action::requeue(REQUEUE_SHORT)));
        }

        if !is_safe_to_remove(
            &placement,
            &candidate.instance_id,
            cluster.spec.replication_factor as u32,
        ) {
            debug!(instance = %candidate.instance_id, "removal would violate safety predicate");
            return Ok(StepResult::Wait(Action::requeue(REQUEUE_SHORT)));
        }

        if candidate.weight != 0 {
            info!(instance = %candidate.instance_id, "zeroing instance weight before removal");
            admin
                .set_instance_weight(&candidate.instance_id, 0)
                .await
                .map_err(Error::Admin)?;
            record_placement_mutation(&cluster.name_any(), "weight");
            ctx.events
                .publish(
                    &cluster.object_ref(&()),
                    EventType::Normal,
                    reasons::INSTANCE_DRAINING,
                    actions::SCALE,
                    Some(candidate.instance_id.clone()),
                )
                .await;
            return Ok(StepResult::Mutated(Action::requeue(REQUEUE_SHORT)));
        }

        info!(instance = %candidate.instance_id, orphaned = candidate.orphaned, "removing instance");
        admin
            .remove_instance(&candidate.instance_id)
            .await
            .map_err(Error::Admin)?;
        record_placement_mutation(&cluster.name_any(), "remove");
        ctx.events
            .publish(
                &cluster.object_ref(&()),
                EventType::Normal,
                reasons::INSTANCE_REMOVED,
                actions::SCALE,
                Some(candidate.instance_id.clone()),
            )
            .await;
        return Ok(StepResult::Mutated(Action::requeue(REQUEUE_SHORT)));
    }

    shrink_workloads(cluster, ctx, &placement, &pods).await
}

/// Reduce a workload's replica count once none of its surplus pods are
/// referenced by the placement.
async fn shrink_workloads(
    cluster: &M3DBCluster,
    ctx: &Context,
    placement: &crate::admin::Placement,
    pods: &[crate::placement::ResolvedPod],
) -> Result<StepResult> {
    let namespace = cluster.namespace().unwrap_or_default();
    let cluster_name = cluster.name_any();

    for group in &cluster.spec.isolation_groups {
        let name = stateful_set_name(&cluster_name, &group.name);
        let Some(observed) = ctx.kube.get_stateful_set(&namespace, &name).await? else {
            continue;
        };
        let observed_replicas = sts_replicas(&observed);
        if observed_replicas <= group.num_instances {
            continue;
        }

        let surplus: Vec<_> = pods
            .iter()
            .filter(|p| p.group == group.name && (p.ordinal as i32) >= group.num_instances)
            .collect();

        // Every surplus pod must be resolved and absent from the
        // placement before its ordinal can be retired.
        let unresolved = (observed_replicas - group.num_instances) as usize > surplus.len();
        let still_placed = surplus
            .iter()
            .any(|p| placement.instances.contains_key(&p.instance_id));
        if unresolved || still_placed {
            debug!(workload = %name, "surplus pods still referenced by placement");
            return Ok(StepResult::Wait(Action::requeue(REQUEUE_SHORT)));
        }

        info!(
            workload = %name,
            from = observed_replicas,
            to = group.num_instances,
            "reducing workload replicas"
        );
        ctx.kube
            .scale_stateful_set(&namespace, &name, group.num_instances)
            .await?;
        return Ok(StepResult::Mutated(Action::requeue(REQUEUE_SHORT)));
    }

    Ok(StepResult::Skip)
}
