//! Projection of a cluster spec into child Kubernetes objects.
//!
//! Every function here is a pure, deterministic function of the desired
//! document: given the same M3DBCluster it emits the same StatefulSets,
//! Services, ConfigMap, and PodDisruptionBudget. The reconciler compares
//! projected against observed and patches differences; nothing in this
//! module reads live state.

mod configmap;
mod labels;
mod pdb;
mod services;
mod statefulset;

pub use configmap::{cluster_environment, config_map, render_node_config, CONFIG_KEY};
pub use labels::{cluster_labels, group_labels, pod_selector};
pub use pdb::pod_disruption_budget;
pub use services::{coordinator_service, headless_service, service_needs_update};
pub use statefulset::{stateful_set, sts_image, sts_replicas};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::ResourceExt;

use crate::crd::M3DBCluster;

/// Name of the StatefulSet backing one isolation group
pub fn stateful_set_name(cluster_name: &str, group: &str) -> String {
    format!("{cluster_name}-{group}")
}

/// Name of the headless peer-discovery service; also the governing service
/// of every group's StatefulSet
pub fn headless_service_name(cluster_name: &str) -> String {
    cluster_name.to_string()
}

/// Name of the client-facing coordinator service
pub fn coordinator_service_name(cluster_name: &str) -> String {
    format!("{cluster_name}-coordinator")
}

/// Name of the rendered node configuration ConfigMap
pub fn config_map_name(cluster_name: &str) -> String {
    format!("{cluster_name}-config")
}

/// StatefulSet ordinal parsed from a pod name (`<sts>-<ordinal>`)
pub fn pod_ordinal(pod_name: &str) -> Option<u32> {
    pod_name.rsplit('-').next()?.parse().ok()
}

/// Stable DNS name of a database pod within the cluster domain
pub fn pod_hostname(pod_name: &str, cluster_name: &str, namespace: &str) -> String {
    format!(
        "{pod_name}.{}.{namespace}",
        headless_service_name(cluster_name)
    )
}

/// Owner reference pointing child objects at their cluster.
///
/// Child deletion follows cluster deletion through garbage collection;
/// the placement itself is cleaned up explicitly by the finalizer.
pub fn owner_reference(cluster: &M3DBCluster) -> OwnerReference {
    OwnerReference {
        api_version: "operator.m3db.io/v1alpha1".to_string(),
        kind: "M3DBCluster".to_string(),
        name: cluster.name_any(),
        uid: cluster.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pod_ordinal_parses_trailing_number() {
        assert_eq!(pod_ordinal("prod-us-east1-b-0"), Some(0));
        assert_eq!(pod_ordinal("prod-us-east1-b-12"), Some(12));
        assert_eq!(pod_ordinal("prod"), None);
    }

    #[test]
    fn hostnames_are_scoped_to_the_headless_service() {
        assert_eq!(
            pod_hostname("prod-g1-0", "prod", "metrics"),
            "prod-g1-0.prod.metrics"
        );
    }

    #[test]
    fn child_names_are_prefixed_with_cluster() {
        assert_eq!(stateful_set_name("prod", "g1"), "prod-g1");
        assert_eq!(coordinator_service_name("prod"), "prod-coordinator");
        assert_eq!(config_map_name("prod"), "prod-config");
    }
}
