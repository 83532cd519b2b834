//! Label sets applied to child objects and used for selection.

use std::collections::BTreeMap;

use crate::{COMPONENT_M3DBNODE, LABEL_CLUSTER, LABEL_COMPONENT, LABEL_ISOLATION_GROUP};

/// Labels shared by every child object of a cluster
pub fn cluster_labels(cluster_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_CLUSTER.to_string(), cluster_name.to_string()),
        (LABEL_COMPONENT.to_string(), COMPONENT_M3DBNODE.to_string()),
    ])
}

/// Labels on the pods of one isolation group's workload
pub fn group_labels(cluster_name: &str, group: &str) -> BTreeMap<String, String> {
    let mut labels = cluster_labels(cluster_name);
    labels.insert(LABEL_ISOLATION_GROUP.to_string(), group.to_string());
    labels
}

/// Label selector string matching all database pods of a cluster
pub fn pod_selector(cluster_name: &str) -> String {
    format!("{LABEL_CLUSTER}={cluster_name},{LABEL_COMPONENT}={COMPONENT_M3DBNODE}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_labels_extend_cluster_labels() {
        let labels = group_labels("prod", "us-east1-b");
        assert_eq!(labels[LABEL_CLUSTER], "prod");
        assert_eq!(labels[LABEL_COMPONENT], "m3dbnode");
        assert_eq!(labels[LABEL_ISOLATION_GROUP], "us-east1-b");
    }

    #[test]
    fn pod_selector_matches_cluster_and_component() {
        let selector = pod_selector("prod");
        assert!(selector.contains("operator.m3db.io/cluster=prod"));
        assert!(selector.contains("operator.m3db.io/component=m3dbnode"));
    }
}
