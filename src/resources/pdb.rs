//! PodDisruptionBudget projection.
//!
//! Voluntary disruptions are limited to one database pod at a time; the
//! placement can only re-replicate one departure's worth of shards anyway.

use k8s_openapi::api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use crate::crd::M3DBCluster;

use super::{cluster_labels, owner_reference};

/// Project the cluster's PodDisruptionBudget
pub fn pod_disruption_budget(cluster: &M3DBCluster) -> PodDisruptionBudget {
    let name = cluster.name_any();
    PodDisruptionBudget {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: cluster.namespace(),
            labels: Some(cluster_labels(&name)),
            owner_references: Some(vec![owner_reference(cluster)]),
            ..Default::default()
        },
        spec: Some(PodDisruptionBudgetSpec {
            max_unavailable: Some(IntOrString::Int(1)),
            selector: Some(LabelSelector {
                match_labels: Some(cluster_labels(&name)),
                ..Default::default()
            }),
            ..Default::default()
        }),
        status: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{IsolationGroup, M3DBClusterSpec, PodIdentityConfig};

    #[test]
    fn budget_allows_one_unavailable_pod() {
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
                namespaces: Vec::new(),
                pod_identity_config: PodIdentityConfig::default(),
                environment: None,
                resources: None,
                storage: None,
                enable_carbon_ingester: false,
            },
        );
        cluster.metadata.uid = Some("uid-123".to_string());

        let pdb = pod_disruption_budget(&cluster);
        assert_eq!(
            pdb.spec.as_ref().unwrap().max_unavailable,
            Some(IntOrString::Int(1))
        );
        assert_eq!(pdb.metadata.name.as_deref(), Some("prod"));
    }
}
