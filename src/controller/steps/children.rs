//! Reconciliation of child Kubernetes objects: ConfigMap, Services,
//! PodDisruptionBudget, and the per-group StatefulSets.
//!
//! Creation and scale-up apply immediately. Pod template changes (image,
//! resources) roll pods, so they are deferred until the placement is
//! stable; replica reduction is never done here: the scale-down step
//! removes the instance from the placement first.

use k8s_openapi::api::apps::v1::StatefulSet;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, info};

use crate::controller::Context;
use crate::crd::M3DBCluster;
use crate::resources::{
    config_map, coordinator_service, headless_service, pod_disruption_budget,
    service_needs_update, stateful_set, stateful_set_name, sts_image, sts_replicas,
};
use crate::Result;

use super::{StepResult, REQUEUE_SHORT};

/// Ensure the rendered node configuration exists and is current
pub async fn reconcile_config_map(cluster: &M3DBCluster, ctx: &Context) -> Result<StepResult> {
    let namespace = cluster.namespace().unwrap_or_default();
    let projected = config_map(cluster)?;
    let name = projected.metadata.name.clone().unwrap_or_default();

    let observed = ctx.kube.get_config_map(&namespace, &name).await?;
    let up_to_date = observed
        .as_ref()
        .map(|o| o.data == projected.data)
        .unwrap_or(false);
    if up_to_date {
        return Ok(StepResult::Skip);
    }

    info!(config_map = %name, "applying node configuration");
    ctx.kube.apply_config_map(&projected).await?;
    Ok(StepResult::Mutated(Action::requeue(REQUEUE_SHORT)))
}

/// Ensure the peer-discovery and client services exist and are current
pub async fn reconcile_services(cluster: &M3DBCluster, ctx: &Context) -> Result<StepResult> {
    let namespace = cluster.namespace().unwrap_or_default();

    for projected in [headless_service(cluster), coordinator_service(cluster)] {
        let name = projected.metadata.name.clone().unwrap_or_default();
        let observed = ctx.kube.get_service(&namespace, &name).await?;
        let needs_apply = match &observed {
            Some(observed) => service_needs_update(observed, &projected),
            None => true,
        };
        if needs_apply {
            info!(service = %name, "applying service");
            ctx.kube.apply_service(&projected).await?;
            return Ok(StepResult::Mutated(Action::requeue(REQUEUE_SHORT)));
        }
    }
    Ok(StepResult::Skip)
}

/// Ensure the PodDisruptionBudget exists
pub async fn reconcile_pod_disruption_budget(
    cluster: &M3DBCluster,
    ctx: &Context,
) -> Result<StepResult> {
    let namespace = cluster.namespace().unwrap_or_default();
    let projected = pod_disruption_budget(cluster);
    let name = projected.metadata.name.clone().unwrap_or_default();

    if ctx
        .kube
        .get_pod_disruption_budget(&namespace, &name)
        .await?
        .is_some()
    {
        return Ok(StepResult::Skip);
    }

    info!(pdb = %name, "creating pod disruption budget");
    ctx.kube.apply_pod_disruption_budget(&projected).await?;
    Ok(StepResult::Mutated(Action::requeue(REQUEUE_SHORT)))
}

fn node_resources(
    sts: &StatefulSet,
) -> Option<k8s_openapi::api::core::v1::ResourceRequirements> {
    sts.spec
        .as_ref()?
        .template
        .spec
        .as_ref()?
        .containers
        .iter()
        .find(|c| c.name == "m3dbnode")?
        .resources
        .clone()
}

fn template_drifted(observed: &StatefulSet, projected: &StatefulSet) -> bool {
    sts_image(observed) != sts_image(projected)
        || node_resources(observed) != node_resources(projected)
}

/// Ensure every isolation group's StatefulSet exists with the projected
/// spec, creating in group declaration order.
pub async fn reconcile_workloads(cluster: &M3DBCluster, ctx: &Context) -> Result<StepResult> {
    let namespace = cluster.namespace().unwrap_or_default();
    let cluster_name = cluster.name_any();

    for group in &cluster.spec.isolation_groups {
        let name = stateful_set_name(&cluster_name, &group.name);
        let projected = stateful_set(cluster, group);

        let Some(observed) = ctx.kube.get_stateful_set(&namespace, &name).await? else {
            info!(workload = %name, replicas = group.num_instances, "creating workload");
            ctx.kube.apply_stateful_set(&projected).await?;
            return Ok(StepResult::Mutated(Action::requeue(REQUEUE_SHORT)));
        };

        let observed_replicas = sts_replicas(&observed);
        let raising = observed_replicas < group.num_instances;
        if raising || template_drifted(&observed, &projected) {
            // Updates roll or add pods in the group; deferred until all
            // shards are AVAILABLE. With no placement yet there is no
            // data to protect and the rollout may proceed.
            let admin = ctx.admin.for_cluster(cluster);
            let stable = admin
                .get_placement()
                .await
                .map_err(crate::Error::Admin)?
                .map(|p| p.is_stable())
                .unwrap_or(true);
            if !stable {
                debug!(workload = %name, "deferring workload update until placement is stable");
                return Ok(StepResult::Wait(Action::requeue(REQUEUE_SHORT)));
            }

            let mut desired = projected;
            if observed_replicas > group.num_instances {
                // Scale-down still in progress; hold the observed count
                if let Some(spec) = desired.spec.as_mut() {
                    spec.replicas = Some(observed_replicas);
                }
            }
            info!(
                workload = %name,
                from = observed_replicas,
                to = group.num_instances,
                "applying workload update"
            );
            ctx.kube.apply_stateful_set(&desired).await?;
            return Ok(StepResult::Mutated(Action::requeue(REQUEUE_SHORT)));
        }
        // observed_replicas > target is handled by the scale-down step
    }

    Ok(StepResult::Skip)
}
