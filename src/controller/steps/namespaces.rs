//! Database namespace reconciliation.
//!
//! Namespaces are created once the placement exists and deleted when they
//! leave the desired document. An existing namespace whose desired options
//! differ is never mutated in place; the drift is surfaced with reason
//! `NamespaceImmutable` and left for the operator's user to resolve by
//! delete-and-recreate.

use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::Resource;
use tracing::{info, warn};

use crate::admin::namespace_request;
use crate::controller::status::surface_condition;
use crate::controller::Context;
use crate::crd::{Condition, ConditionStatus, ConditionType, M3DBCluster};
use crate::events::{actions, reasons};
use crate::{Error, Result};

use super::{StepResult, REQUEUE_SHORT};

/// Converge registered namespaces toward the desired list
pub async fn reconcile(cluster: &M3DBCluster, ctx: &Context) -> Result<StepResult> {
    let admin = ctx.admin.for_cluster(cluster);

    // Namespaces only exist relative to a placement
    if admin.get_placement().await.map_err(Error::Admin)?.is_none() {
        return Ok(StepResult::Skip);
    }

    let registered = admin.list_namespaces().await.map_err(Error::Admin)?;

    for desired in &cluster.spec.namespaces {
        let request = namespace_request(desired)?;
        match registered.get(&desired.name) {
            None => {
                info!(namespace = %desired.name, "creating database namespace");
                admin.create_namespace(&request).await.map_err(Error::Admin)?;
                ctx.events
                    .publish(
                        &cluster.object_ref(&()),
                        EventType::Normal,
                        reasons::NAMESPACE_CREATED,
                        actions::RECONCILE,
                        Some(desired.name.clone()),
                    )
                    .await;
                return Ok(StepResult::Mutated(Action::requeue(REQUEUE_SHORT)));
            }
            Some(options) if *options != request.options => {
                warn!(
                    namespace = %desired.name,
                    "desired options differ from registered namespace; refusing in-place mutation"
                );
                ctx.events
                    .publish(
                        &cluster.object_ref(&()),
                        EventType::Warning,
                        reasons::NAMESPACE_IMMUTABLE,
                        actions::RECONCILE,
                        Some(format!(
                            "namespace '{}' must be deleted and recreated to change options",
                            desired.name
                        )),
                    )
                    .await;
                surface_condition(
                    cluster,
                    ctx,
                    Condition::new(
                        ConditionType::Available,
                        ConditionStatus::False,
                        "NamespaceImmutable",
                        format!("namespace '{}' options differ from spec", desired.name),
                    ),
                )
                .await?;
            }
            Some(_) => {}
        }
    }

    for name in registered.keys() {
        if !cluster.spec.namespaces.iter().any(|n| &n.name == name) {
            info!(namespace = %name, "deleting database namespace removed from spec");
            admin.delete_namespace(name).await.map_err(Error::Admin)?;
            ctx.events
                .publish(
                    &cluster.object_ref(&()),
                    EventType::Normal,
                    reasons::NAMESPACE_DELETED,
                    actions::RECONCILE,
                    Some(name.clone()),
                )
                .await;
            return Ok(StepResult::Mutated(Action::requeue(REQUEUE_SHORT)));
        }
    }

    Ok(StepResult::Skip)
}
