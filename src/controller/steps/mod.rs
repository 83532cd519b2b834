//! Reconciliation steps.
//!
//! Each phase of a pass is an independently runnable step evaluated in a
//! fixed order; the first step with something to do performs its single
//! mutation and ends the pass. Steps re-read whatever state they act on
//! rather than trusting earlier observations.

pub mod children;
pub mod finalize;
pub mod namespaces;
pub mod placement;

use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use kube::runtime::controller::Action;
use kube::ResourceExt;

use crate::controller::Context;
use crate::crd::{M3DBCluster, PodIdentitySource};
use crate::placement::ResolvedPod;
use crate::resources::{pod_hostname, pod_ordinal, pod_selector};
use crate::{identity, Error, Result, LABEL_ISOLATION_GROUP};

/// Requeue delay while converging
pub const REQUEUE_SHORT: Duration = Duration::from_secs(10);

/// Outcome of evaluating one step
#[derive(Debug)]
pub enum StepResult {
    /// The step performed its mutation; the pass ends here
    Mutated(Action),
    /// A precondition is not yet met; requeue without mutating
    Wait(Action),
    /// Nothing to do; evaluate the next step
    Skip,
}

/// Whether a pod currently passes its readiness probe
pub fn pod_is_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

/// Work-queue key of a cluster
pub fn cluster_key(cluster: &M3DBCluster) -> String {
    format!(
        "{}/{}",
        cluster.namespace().unwrap_or_default(),
        cluster.name_any()
    )
}

/// Observe the cluster's pods and resolve their identities.
///
/// Pods whose identity cannot be resolved yet (unbound, missing node
/// attributes) are omitted; downstream decisions treat them as not ready.
pub async fn observe_pods(cluster: &M3DBCluster, ctx: &Context) -> Result<Vec<ResolvedPod>> {
    let namespace = cluster.namespace().unwrap_or_default();
    let name = cluster.name_any();
    let sources = &cluster.spec.pod_identity_config.sources;
    let needs_node = sources.iter().any(|s| {
        matches!(
            s,
            PodIdentitySource::NodeExternalID | PodIdentitySource::NodeProviderID
        )
    });

    let pods = ctx.kube.list_pods(&namespace, &pod_selector(&name)).await?;
    let mut resolved = Vec::with_capacity(pods.len());

    for pod in &pods {
        let Some(pod_name) = pod.metadata.name.clone() else {
            continue;
        };
        let Some(group) = pod
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(LABEL_ISOLATION_GROUP))
            .cloned()
        else {
            continue;
        };
        let Some(ordinal) = pod_ordinal(&pod_name) else {
            continue;
        };

        let node = if needs_node {
            match pod.spec.as_ref().and_then(|s| s.node_name.as_deref()) {
                Some(node_name) => ctx.kube.get_node(node_name).await?,
                None => None,
            }
        } else {
            None
        };

        let identity = match identity::resolve(pod, node.as_ref(), sources) {
            Ok(identity) => identity,
            Err(Error::NotReady(_)) => continue,
            Err(e) => return Err(e),
        };

        resolved.push(ResolvedPod {
            hostname: pod_hostname(&pod_name, &name, &namespace),
            instance_id: identity.instance_id(),
            ready: pod_is_ready(pod),
            pod_name,
            group,
            ordinal,
        });
    }

    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PodCondition, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn pod_with_ready(status: &str) -> Pod {
        Pod {
            metadata: ObjectMeta::default(),
            status: Some(PodStatus {
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_string(),
                    status: status.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn readiness_follows_the_ready_condition() {
        assert!(pod_is_ready(&pod_with_ready("True")));
        assert!(!pod_is_ready(&pod_with_ready("False")));
        assert!(!pod_is_ready(&Pod::default()));
    }
}
