//! Status reconciliation.
//!
//! Conditions are derived facts: the status subresource is recomputed from
//! the observed placement, pods, and namespaces on every pass that reaches
//! it, and written only when it differs from what the cluster already
//! carries. The spec is never touched.

use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, info};

use crate::admin::{namespace_request, BootstrapStatus, Placement, ShardState};
use crate::controller::steps::{observe_pods, pod_is_ready, REQUEUE_SHORT};
use crate::controller::Context;
use crate::crd::{
    Condition, ConditionStatus, ConditionType, IsolationGroupStatus, M3DBCluster,
    M3DBClusterStatus,
};
use crate::resources::pod_selector;
use crate::{Error, Result, LABEL_ISOLATION_GROUP, PORT_NODE_HTTP};

/// Requeue delay once the cluster is converged, to catch placement drift
/// that produces no Kubernetes events
const REQUEUE_CONVERGED: std::time::Duration = std::time::Duration::from_secs(60);

const MAX_STATUS_WRITE_ATTEMPTS: u32 = 3;

/// Merge one condition into the cluster's status and write it if changed.
///
/// Used by steps that need to surface a condition mid-pass (placement
/// initialized, namespace drift) without recomputing the full status.
pub async fn surface_condition(
    cluster: &M3DBCluster,
    ctx: &Context,
    condition: Condition,
) -> Result<()> {
    let mut status = cluster.status.clone().unwrap_or_default();
    let before = status.clone();
    status.set_condition(condition);
    if status != before {
        write_status(cluster, ctx, &status).await?;
    }
    Ok(())
}

async fn write_status(
    cluster: &M3DBCluster,
    ctx: &Context,
    status: &M3DBClusterStatus,
) -> Result<()> {
    let mut attempts = 0;
    loop {
        match ctx.kube.patch_status(cluster, status).await {
            Ok(()) => return Ok(()),
            Err(Error::Kube(kube::Error::Api(ae))) if ae.code == 409 => {
                attempts += 1;
                if attempts >= MAX_STATUS_WRITE_ATTEMPTS {
                    return Err(Error::conflict(
                        "status write conflicted repeatedly, surrendering pass",
                    ));
                }
                debug!(attempts, "status write conflict, retrying");
            }
            Err(e) => return Err(e),
        }
    }
}

/// Recompute conditions and pod counts, write the status subresource on
/// change, and choose the requeue cadence.
pub async fn run(cluster: &M3DBCluster, ctx: &Context) -> Result<Action> {
    let namespace = cluster.namespace().unwrap_or_default();
    let name = cluster.name_any();

    let raw_pods = ctx.kube.list_pods(&namespace, &pod_selector(&name)).await?;
    let resolved = observe_pods(cluster, ctx).await?;

    let admin = ctx.admin.for_cluster(cluster);
    let placement = admin.get_placement().await.map_err(Error::Admin)?;
    let registered = match &placement {
        Some(_) => Some(admin.list_namespaces().await.map_err(Error::Admin)?),
        None => None,
    };

    let mut status = cluster.status.clone().unwrap_or_default();
    let before = status.clone();

    status.observed_generation = cluster.metadata.generation;
    status.isolation_groups = group_counts(cluster, &raw_pods);

    // PlacementInitialized
    status.set_condition(match &placement {
        Some(_) => Condition::new(
            ConditionType::PlacementInitialized,
            ConditionStatus::True,
            "PlacementCreated",
            "",
        ),
        None => Condition::new(
            ConditionType::PlacementInitialized,
            ConditionStatus::False,
            "AwaitingPlacement",
            "",
        ),
    });

    // PodsBootstrapping: probe nodes whose instances still carry
    // non-AVAILABLE shards, one bounded sweep per pass
    status.set_condition(match &placement {
        None => Condition::new(
            ConditionType::PodsBootstrapping,
            ConditionStatus::Unknown,
            "AwaitingPlacement",
            "",
        ),
        Some(p) if p.is_stable() => Condition::new(
            ConditionType::PodsBootstrapping,
            ConditionStatus::False,
            "NodesBootstrapped",
            "",
        ),
        Some(p) => {
            let mut pending = Vec::new();
            let mut bootstrapping = false;
            for instance in p.instances.values() {
                if !instance.has_shard_in_state(ShardState::Initializing) {
                    continue;
                }
                bootstrapping = true;
                if let Some(pod) = resolved.iter().find(|r| r.instance_id == instance.id) {
                    let endpoint = format!("{}:{}", pod.hostname, PORT_NODE_HTTP);
                    let status = admin
                        .node_bootstrapped(&endpoint)
                        .await
                        .map_err(Error::Admin)?;
                    if status != BootstrapStatus::Bootstrapped {
                        pending.push(pod.pod_name.clone());
                    }
                }
            }
            if bootstrapping {
                Condition::new(
                    ConditionType::PodsBootstrapping,
                    ConditionStatus::True,
                    "NodesBootstrapping",
                    if pending.is_empty() {
                        String::new()
                    } else {
                        format!("waiting on {}", pending.join(", "))
                    },
                )
            } else {
                Condition::new(
                    ConditionType::PodsBootstrapping,
                    ConditionStatus::False,
                    "NodesBootstrapped",
                    "",
                )
            }
        }
    });

    // Available
    let stable = placement.as_ref().map(Placement::is_stable).unwrap_or(false);
    let pods_ready = pods_all_ready(cluster, &status.isolation_groups);
    let namespace_state = namespace_convergence(cluster, registered.as_ref())?;

    let available = match (stable, pods_ready, &namespace_state) {
        (true, true, NamespaceConvergence::Converged) => Condition::new(
            ConditionType::Available,
            ConditionStatus::True,
            "ClusterAvailable",
            "",
        ),
        (false, _, _) => Condition::new(
            ConditionType::Available,
            ConditionStatus::False,
            "WaitingForStability",
            "",
        ),
        (_, false, _) => Condition::new(
            ConditionType::Available,
            ConditionStatus::False,
            "PodsNotReady",
            "",
        ),
        (_, _, NamespaceConvergence::Immutable(ns)) => Condition::new(
            ConditionType::Available,
            ConditionStatus::False,
            "NamespaceImmutable",
            format!("namespace '{ns}' options differ from spec"),
        ),
        (_, _, NamespaceConvergence::Missing) => Condition::new(
            ConditionType::Available,
            ConditionStatus::False,
            "NamespacesMissing",
            "",
        ),
    };
    let converged = available.status == ConditionStatus::True;
    status.set_condition(available);

    if status != before {
        info!(converged, "writing updated status");
        write_status(cluster, ctx, &status).await?;
    }

    if converged {
        Ok(Action::requeue(REQUEUE_CONVERGED))
    } else {
        Ok(Action::requeue(REQUEUE_SHORT))
    }
}

fn group_counts(
    cluster: &M3DBCluster,
    pods: &[k8s_openapi::api::core::v1::Pod],
) -> Vec<IsolationGroupStatus> {
    cluster
        .spec
        .isolation_groups
        .iter()
        .map(|group| {
            let members: Vec<_> = pods
                .iter()
                .filter(|p| {
                    p.metadata
                        .labels
                        .as_ref()
                        .and_then(|l| l.get(LABEL_ISOLATION_GROUP))
                        .map(|g| g == &group.name)
                        .unwrap_or(false)
                })
                .collect();
            IsolationGroupStatus {
                name: group.name.clone(),
                ready_instances: members.iter().filter(|p| pod_is_ready(p)).count() as i32,
                total_instances: members.len() as i32,
            }
        })
        .collect()
}

fn pods_all_ready(cluster: &M3DBCluster, groups: &[IsolationGroupStatus]) -> bool {
    cluster.spec.isolation_groups.iter().all(|g| {
        groups
            .iter()
            .find(|s| s.name == g.name)
            .map(|s| s.ready_instances == g.num_instances && s.total_instances == g.num_instances)
            .unwrap_or(false)
    })
}

enum NamespaceConvergence {
    Converged,
    Missing,
    Immutable(String),
}

fn namespace_convergence(
    cluster: &M3DBCluster,
    registered: Option<&std::collections::BTreeMap<String, crate::admin::NamespaceOptions>>,
) -> Result<NamespaceConvergence> {
    let Some(registered) = registered else {
        return Ok(if cluster.spec.namespaces.is_empty() {
            NamespaceConvergence::Converged
        } else {
            NamespaceConvergence::Missing
        });
    };

    for desired in &cluster.spec.namespaces {
        match registered.get(&desired.name) {
            None => return Ok(NamespaceConvergence::Missing),
            Some(options) => {
                let request = namespace_request(desired)?;
                if *options != request.options {
                    return Ok(NamespaceConvergence::Immutable(desired.name.clone()));
                }
            }
        }
    }
    if registered
        .keys()
        .any(|name| !cluster.spec.namespaces.iter().any(|n| &n.name == name))
    {
        return Ok(NamespaceConvergence::Missing);
    }
    Ok(NamespaceConvergence::Converged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin::fixtures::{available_instance, placement};
    use crate::admin::{namespace_request, MockAdminClient, PlacementInstance};
    use crate::controller::context::{FixedAdminFactory, MockKubeApi};
    use crate::controller::Context;
    use crate::crd::{
        IsolationGroup, M3DBClusterSpec, NamespaceSpec, PodIdentityConfig,
    };
    use crate::events::NoopEventPublisher;
    use crate::identity::PodIdentity;
    use k8s_openapi::api::core::v1::{Pod, PodCondition, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn sample_cluster() -> M3DBCluster {
        let mut cluster = M3DBCluster::new(
            "prod",
            M3DBClusterSpec {
                image: "m3dbnode:test".to_string(),
                replication_factor: 1,
                num_shards: 4,
                isolation_groups: vec![IsolationGroup {
                    name: "g1".to_string(),
                    num_instances: 1,
                }],
                etcd_endpoints: vec!["http://etcd:2379".to_string()],
                namespaces: vec![NamespaceSpec {
                    name: "metrics".to_string(),
                    preset: Some("10s:2d".to_string()),
                    options: None,
                }],
                pod_identity_config: PodIdentityConfig::default(),
                environment: None,
                resources: None,
                storage: None,
                enable_carbon_ingester: false,
            },
        );
        cluster.metadata.namespace = Some("m3db".to_string());
        cluster.metadata.generation = Some(4);
        cluster
    }

    fn ready_pod(name: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(crate::resources::group_labels("prod", "g1")),
                ..Default::default()
            },
            status: Some(PodStatus {
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_string(),
                    status: "True".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn pod_instance(pod_name: &str, shards: &[u32]) -> PlacementInstance {
        let id = PodIdentity {
            name: pod_name.to_string(),
            ..Default::default()
        }
        .instance_id();
        available_instance(&id, "g1", shards)
    }

    fn registered_metrics() -> BTreeMap<String, crate::admin::NamespaceOptions> {
        let spec = NamespaceSpec {
            name: "metrics".to_string(),
            preset: Some("10s:2d".to_string()),
            options: None,
        };
        BTreeMap::from([(
            "metrics".to_string(),
            namespace_request(&spec).unwrap().options,
        )])
    }

    fn context(kube: MockKubeApi, admin: MockAdminClient) -> Context {
        Context::with_clients(
            Arc::new(kube),
            Arc::new(FixedAdminFactory::new(Arc::new(admin))),
            Arc::new(NoopEventPublisher),
        )
    }

    #[tokio::test]
    async fn converged_cluster_reports_available_and_slows_down() {
        let cluster = sample_cluster();
        let pods = vec![ready_pod("prod-g1-0")];

        let mut kube = MockKubeApi::new();
        kube.expect_list_pods().returning(move |_, _| Ok(pods.clone()));
        kube.expect_patch_status()
            .withf(|_, status| {
                status.is_condition_true(ConditionType::Available)
                    && status.is_condition_true(ConditionType::PlacementInitialized)
                    && status.observed_generation == Some(4)
                    && status.isolation_groups[0].ready_instances == 1
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let mut admin = MockAdminClient::new();
        let p = placement(1, 4, vec![pod_instance("prod-g1-0", &[0, 1, 2, 3])]);
        admin
            .expect_get_placement()
            .returning(move || Ok(Some(p.clone())));
        admin
            .expect_list_namespaces()
            .returning(|| Ok(registered_metrics()));

        let ctx = context(kube, admin);
        let action = run(&cluster, &ctx).await.unwrap();
        assert_eq!(action, Action::requeue(REQUEUE_CONVERGED));
    }

    #[tokio::test]
    async fn namespace_option_drift_blocks_availability() {
        let mut cluster = sample_cluster();
        cluster.spec.namespaces[0].preset = Some("1m:40d".to_string());
        let pods = vec![ready_pod("prod-g1-0")];

        let mut kube = MockKubeApi::new();
        kube.expect_list_pods().returning(move |_, _| Ok(pods.clone()));
        kube.expect_patch_status()
            .withf(|_, status| {
                status
                    .condition(ConditionType::Available)
                    .map(|c| {
                        c.status == ConditionStatus::False && c.reason == "NamespaceImmutable"
                    })
                    .unwrap_or(false)
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let mut admin = MockAdminClient::new();
        let p = placement(1, 4, vec![pod_instance("prod-g1-0", &[0, 1, 2, 3])]);
        admin
            .expect_get_placement()
            .returning(move || Ok(Some(p.clone())));
        // registered with the old 10s:2d options
        admin
            .expect_list_namespaces()
            .returning(|| Ok(registered_metrics()));

        let ctx = context(kube, admin);
        let action = run(&cluster, &ctx).await.unwrap();
        assert_eq!(action, Action::requeue(REQUEUE_SHORT));
    }

    #[tokio::test]
    async fn initializing_shards_probe_the_node_and_report_bootstrapping() {
        let cluster = sample_cluster();
        let pods = vec![ready_pod("prod-g1-0")];

        let mut kube = MockKubeApi::new();
        kube.expect_list_pods().returning(move |_, _| Ok(pods.clone()));
        kube.expect_patch_status()
            .withf(|_, status| {
                status
                    .condition(ConditionType::PodsBootstrapping)
                    .map(|c| c.status == ConditionStatus::True && c.reason == "NodesBootstrapping")
                    .unwrap_or(false)
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let mut admin = MockAdminClient::new();
        let mut instance = pod_instance("prod-g1-0", &[0, 1, 2, 3]);
        instance.shards[0].state = ShardState::Initializing;
        let p = placement(1, 4, vec![instance]);
        admin
            .expect_get_placement()
            .returning(move || Ok(Some(p.clone())));
        admin
            .expect_list_namespaces()
            .returning(|| Ok(registered_metrics()));
        admin
            .expect_node_bootstrapped()
            .withf(|endpoint| endpoint.ends_with(":9002"))
            .times(1)
            .returning(|_| Ok(BootstrapStatus::NotBootstrapped));

        let ctx = context(kube, admin);
        run(&cluster, &ctx).await.unwrap();
    }

    #[tokio::test]
    async fn surface_condition_skips_the_write_when_nothing_changed() {
        let mut cluster = sample_cluster();
        let mut status = M3DBClusterStatus::default();
        status.set_condition(Condition::new(
            ConditionType::Invalid,
            ConditionStatus::True,
            "InvalidSpec",
            "bad",
        ));
        cluster.status = Some(status.clone());

        let mut kube = MockKubeApi::new();
        kube.expect_patch_status().times(0);

        let ctx = context(kube, MockAdminClient::new());
        surface_condition(
            &cluster,
            &ctx,
            Condition::new(ConditionType::Invalid, ConditionStatus::True, "InvalidSpec", "bad"),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn repeated_write_conflicts_surrender_the_pass() {
        let cluster = sample_cluster();

        let mut kube = MockKubeApi::new();
        kube.expect_patch_status().returning(|_, _| {
            Err(Error::Kube(kube::Error::Api(
                kube::core::ErrorResponse {
                    status: "Failure".to_string(),
                    message: "conflict".to_string(),
                    reason: "Conflict".to_string(),
                    code: 409,
                },
            )))
        });

        let ctx = context(kube, MockAdminClient::new());
        let err = write_status(&cluster, &ctx, &M3DBClusterStatus::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }
}
