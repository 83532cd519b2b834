//! M3DBCluster reconciliation.
//!
//! One pass per enqueued cluster key: read the desired document and the
//! observed world, perform at most one mutating action, update status, and
//! requeue until converged. Phases are evaluated in a fixed order and the
//! first one with work to do ends the pass.

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{error, instrument, warn};

use crate::controller::status::{self, surface_condition};
use crate::controller::steps::{self, cluster_key, StepResult};
use crate::controller::Context;
use crate::crd::{Condition, ConditionStatus, ConditionType, M3DBCluster};
use crate::events::{actions, reasons};
use crate::metrics::ReconcileTimer;
use crate::retry::Transient;
use crate::{Error, Result};

/// Base delay for failure backoff
const BACKOFF_BASE: Duration = Duration::from_secs(5);

/// Ceiling for failure backoff
const BACKOFF_CAP: Duration = Duration::from_secs(300);

/// Consecutive conflicts before the ReconcileConflict condition surfaces
const CONFLICT_CONDITION_THRESHOLD: u32 = 3;

/// Reconcile one M3DBCluster.
///
/// Validation failures and internal invariant violations are terminal for
/// the current spec generation: they surface as conditions and wait for a
/// spec change instead of retrying.
#[instrument(skip(cluster, ctx), fields(cluster = %cluster.name_any()))]
pub async fn reconcile(cluster: Arc<M3DBCluster>, ctx: Arc<Context>) -> Result<Action> {
    let key = cluster_key(&cluster);
    let timer = ReconcileTimer::start(cluster.name_any());

    match reconcile_inner(&cluster, &ctx).await {
        Ok(action) => {
            ctx.reset_failures(&key);
            timer.success();
            Ok(action)
        }
        Err(Error::Validation(message)) => {
            warn!(error = %message, "cluster spec rejected");
            ctx.events
                .publish(
                    &cluster.object_ref(&()),
                    EventType::Warning,
                    reasons::VALIDATION_FAILED,
                    actions::RECONCILE,
                    Some(message.clone()),
                )
                .await;
            surface_condition(
                &cluster,
                &ctx,
                Condition::new(
                    ConditionType::Invalid,
                    ConditionStatus::True,
                    "InvalidSpec",
                    message,
                ),
            )
            .await?;
            ctx.reset_failures(&key);
            timer.error("permanent");
            // Mutations stay suspended until the spec generation changes
            Ok(Action::await_change())
        }
        Err(Error::Internal(message)) => {
            error!(error = %message, "internal invariant violated");
            surface_condition(
                &cluster,
                &ctx,
                Condition::new(
                    ConditionType::Available,
                    ConditionStatus::False,
                    "InternalError",
                    message,
                ),
            )
            .await?;
            timer.error("permanent");
            Ok(Action::await_change())
        }
        Err(e) => {
            if matches!(e, Error::Conflict(_))
                && ctx.failure_count(&key) + 1 >= CONFLICT_CONDITION_THRESHOLD
            {
                let _ = surface_condition(
                    &cluster,
                    &ctx,
                    Condition::new(
                        ConditionType::Available,
                        ConditionStatus::False,
                        "ReconcileConflict",
                        "repeated conflicting writes, backing off",
                    ),
                )
                .await;
            }
            timer.error(if e.is_transient() { "transient" } else { "permanent" });
            Err(e)
        }
    }
}

/// The phase table. Evaluated in order; the first phase that mutates or
/// must wait ends the pass.
async fn reconcile_inner(cluster: &M3DBCluster, ctx: &Context) -> Result<Action> {
    if cluster.metadata.deletion_timestamp.is_some() {
        return steps::finalize::handle_deletion(cluster, ctx).await;
    }

    cluster.spec.validate()?;

    match steps::finalize::ensure_finalizer(cluster, ctx).await? {
        StepResult::Mutated(a) | StepResult::Wait(a) => return Ok(a),
        StepResult::Skip => {}
    }
    match steps::children::reconcile_config_map(cluster, ctx).await? {
        StepResult::Mutated(a) | StepResult::Wait(a) => return Ok(a),
        StepResult::Skip => {}
    }
    match steps::children::reconcile_services(cluster, ctx).await? {
        StepResult::Mutated(a) | StepResult::Wait(a) => return Ok(a),
        StepResult::Skip => {}
    }
    match steps::children::reconcile_pod_disruption_budget(cluster, ctx).await? {
        StepResult::Mutated(a) | StepResult::Wait(a) => return Ok(a),
        StepResult::Skip => {}
    }
    match steps::children::reconcile_workloads(cluster, ctx).await? {
        StepResult::Mutated(a) | StepResult::Wait(a) => return Ok(a),
        StepResult::Skip => {}
    }
    match steps::placement::bootstrap(cluster, ctx).await? {
        StepResult::Mutated(a) | StepResult::Wait(a) => return Ok(a),
        StepResult::Skip => {}
    }
    match steps::placement::expand(cluster, ctx).await? {
        StepResult::Mutated(a) | StepResult::Wait(a) => return Ok(a),
        StepResult::Skip => {}
    }
    match steps::placement::scale_down(cluster, ctx).await? {
        StepResult::Mutated(a) | StepResult::Wait(a) => return Ok(a),
        StepResult::Skip => {}
    }
    match steps::namespaces::reconcile(cluster, ctx).await? {
        StepResult::Mutated(a) | StepResult::Wait(a) => return Ok(a),
        StepResult::Skip => {}
    }

    status::run(cluster, ctx).await
}

/// Requeue failed reconciliations with exponential backoff
pub fn error_policy(cluster: Arc<M3DBCluster>, error: &Error, ctx: Arc<Context>) -> Action {
    let key = cluster_key(&cluster);
    let failures = ctx.record_failure(&key);
    let exponent = failures.saturating_sub(1).min(6);
    let delay = Duration::from_secs(
        (BACKOFF_BASE.as_secs() << exponent).min(BACKOFF_CAP.as_secs()),
    );
    warn!(
        cluster = %cluster.name_any(),
        error = %error,
        failures,
        delay_secs = delay.as_secs(),
        "reconciliation failed, backing off"
    );
    Action::requeue(delay)
}
