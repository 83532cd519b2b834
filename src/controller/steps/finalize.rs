//! Finalizer installation and deletion cleanup.
//!
//! The placement lives outside Kubernetes, so cluster deletion must
//! explicitly tear it down before owner-reference garbage collection is
//! allowed to proceed: placement first, then namespaces, then the
//! finalizer itself.

use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::Resource;
use tracing::info;

use crate::admin::AdminError;
use crate::controller::Context;
use crate::crd::M3DBCluster;
use crate::events::{actions, reasons};
use crate::{Error, Result, CLUSTER_FINALIZER};

use super::{cluster_key, StepResult, REQUEUE_SHORT};

fn has_finalizer(cluster: &M3DBCluster) -> bool {
    cluster
        .metadata
        .finalizers
        .as_ref()
        .map(|f| f.iter().any(|name| name == CLUSTER_FINALIZER))
        .unwrap_or(false)
}

/// Install the finalizer on clusters that lack it
pub async fn ensure_finalizer(cluster: &M3DBCluster, ctx: &Context) -> Result<StepResult> {
    if has_finalizer(cluster) {
        return Ok(StepResult::Skip);
    }
    info!("installing finalizer");
    ctx.kube.add_finalizer(cluster).await?;
    Ok(StepResult::Mutated(Action::requeue(REQUEUE_SHORT)))
}

/// Clean up external state and release the finalizer on deletion.
///
/// Every operation here is idempotent, so a pass interrupted part-way
/// through resumes safely: the placement delete tolerates absence, as do
/// the namespace deletes.
pub async fn handle_deletion(cluster: &M3DBCluster, ctx: &Context) -> Result<Action> {
    if !has_finalizer(cluster) {
        // Nothing left to guard; garbage collection owns the rest
        return Ok(Action::await_change());
    }

    info!("cluster deleted, cleaning up placement and namespaces");
    ctx.events
        .publish(
            &cluster.object_ref(&()),
            EventType::Normal,
            reasons::DELETION_STARTED,
            actions::DELETE,
            None,
        )
        .await;

    let admin = ctx.admin.for_cluster(cluster);

    admin.delete_placement().await.map_err(Error::Admin)?;

    let registered = match admin.list_namespaces().await {
        Ok(registered) => registered,
        // Coordinator state already gone along with the placement
        Err(AdminError::NotFound(_)) => Default::default(),
        Err(e) => return Err(e.into()),
    };
    for name in registered.keys() {
        admin.delete_namespace(name).await.map_err(Error::Admin)?;
        info!(namespace = %name, "deleted database namespace");
    }

    ctx.kube.remove_finalizer(cluster).await?;
    ctx.forget_cluster(&cluster_key(cluster));
    info!("finalizer removed");
    Ok(Action::await_change())
}
