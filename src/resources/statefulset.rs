//! StatefulSet projection for one isolation group.
//!
//! Each group gets its own StatefulSet named `<cluster>-<group>` whose pod
//! template carries the group name as a rack label. Anti-affinity keeps
//! two pods of the same cluster off one node within a group, and an init
//! container writes the pod identity file the database reads its host id
//! from.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    Affinity, ConfigMapVolumeSource, Container, ContainerPort, EmptyDirVolumeSource, EnvVar,
    EnvVarSource, HTTPGetAction, ObjectFieldSelector, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PodAntiAffinity, PodAffinityTerm, PodSpec, PodTemplateSpec, Probe,
    Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use crate::crd::{IsolationGroup, M3DBCluster, PodIdentitySource, ResourcesSpec};
use crate::{LABEL_CLUSTER, POD_IDENTITY_DIR, PORT_NODE_HTTP};

use super::{
    cluster_labels, config_map_name, group_labels, headless_service_name, owner_reference,
    stateful_set_name,
};
use crate::resources::configmap::CONFIG_KEY;

const DATA_DIR: &str = "/var/lib/m3db";
const CONFIG_DIR: &str = "/etc/m3db";
const INIT_IMAGE: &str = "busybox:1.36";

/// Project the StatefulSet for one isolation group
pub fn stateful_set(cluster: &M3DBCluster, group: &IsolationGroup) -> StatefulSet {
    let cluster_name = cluster.name_any();
    let labels = group_labels(&cluster_name, &group.name);

    let mut volumes = vec![
        Volume {
            name: "config".to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: config_map_name(&cluster_name),
                ..Default::default()
            }),
            ..Default::default()
        },
        Volume {
            name: "pod-identity".to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        },
        Volume {
            name: "cache".to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        },
    ];

    let mut claims: Option<Vec<PersistentVolumeClaim>> = None;
    match &cluster.spec.storage {
        Some(storage) => {
            claims = Some(vec![PersistentVolumeClaim {
                metadata: ObjectMeta {
                    name: Some("data".to_string()),
                    ..Default::default()
                },
                spec: Some(PersistentVolumeClaimSpec {
                    access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                    storage_class_name: storage.class_name.clone(),
                    resources: Some(VolumeResourceRequirements {
                        requests: Some(BTreeMap::from([(
                            "storage".to_string(),
                            Quantity(storage.size.clone()),
                        )])),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }]);
        }
        None => {
            volumes.push(Volume {
                name: "data".to_string(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            });
        }
    }

    let template = PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(labels.clone()),
            ..Default::default()
        }),
        spec: Some(PodSpec {
            affinity: Some(anti_affinity(&cluster_name)),
            init_containers: Some(vec![identity_init_container(
                &cluster.spec.pod_identity_config.sources,
            )]),
            containers: vec![node_container(cluster)],
            volumes: Some(volumes),
            ..Default::default()
        }),
    };

    StatefulSet {
        metadata: ObjectMeta {
            name: Some(stateful_set_name(&cluster_name, &group.name)),
            namespace: cluster.namespace(),
            labels: Some(labels.clone()),
            owner_references: Some(vec![owner_reference(cluster)]),
            ..Default::default()
        },
        spec: Some(StatefulSetSpec {
            service_name: headless_service_name(&cluster_name),
            replicas: Some(group.num_instances),
            pod_management_policy: Some("Parallel".to_string()),
            selector: LabelSelector {
                match_labels: Some(labels),
                ..Default::default()
            },
            template,
            volume_claim_templates: claims,
            ..Default::default()
        }),
        status: None,
    }
}

/// Required anti-affinity: no two pods of this cluster share a node
fn anti_affinity(cluster_name: &str) -> Affinity {
    Affinity {
        pod_anti_affinity: Some(PodAntiAffinity {
            required_during_scheduling_ignored_during_execution: Some(vec![PodAffinityTerm {
                label_selector: Some(LabelSelector {
                    match_labels: Some(BTreeMap::from([(
                        LABEL_CLUSTER.to_string(),
                        cluster_name.to_string(),
                    )])),
                    ..Default::default()
                }),
                topology_key: "kubernetes.io/hostname".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn downward_env(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: field_path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Init container writing the canonical identity JSON to the shared
/// volume. Only sources resolvable inside the pod (name, uid, node name)
/// are populated; the field layout matches the resolver's canonical
/// encoding so hashes agree.
fn identity_init_container(sources: &[PodIdentitySource]) -> Container {
    // printf arguments substitute the configured sources; everything else
    // stays an empty string so the file matches the operator's canonical
    // encoding byte for byte
    let arg = |source: PodIdentitySource, var: &str| -> String {
        if sources.contains(&source) {
            format!("\"${var}\"")
        } else {
            "''".to_string()
        }
    };

    let script = format!(
        concat!(
            r#"printf '{{"name":"%s","uid":"%s","node_name":"%s","#,
            r#""node_external_id":"","node_provider_id":""}}' {} {} {} "#,
            "> {}/identity"
        ),
        arg(PodIdentitySource::PodName, "POD_NAME"),
        arg(PodIdentitySource::PodUID, "POD_UID"),
        arg(PodIdentitySource::NodeName, "NODE_NAME"),
        POD_IDENTITY_DIR,
    );

    Container {
        name: "pod-identity".to_string(),
        image: Some(INIT_IMAGE.to_string()),
        command: Some(vec!["sh".to_string(), "-c".to_string(), script]),
        env: Some(vec![
            downward_env("POD_NAME", "metadata.name"),
            downward_env("POD_UID", "metadata.uid"),
            downward_env("NODE_NAME", "spec.nodeName"),
        ]),
        volume_mounts: Some(vec![VolumeMount {
            name: "pod-identity".to_string(),
            mount_path: POD_IDENTITY_DIR.to_string(),
            ..Default::default()
        }]),
        ..Default::default()
    }
}

fn node_container(cluster: &M3DBCluster) -> Container {
    Container {
        name: "m3dbnode".to_string(),
        image: Some(cluster.spec.image.clone()),
        args: Some(vec![
            "-f".to_string(),
            format!("{CONFIG_DIR}/{CONFIG_KEY}"),
        ]),
        ports: Some(vec![
            node_port("client", 9000),
            node_port("cluster", 9001),
            node_port("http-node", 9002),
            node_port("http-cluster", 9003),
            node_port("debug", 9004),
        ]),
        readiness_probe: Some(Probe {
            http_get: Some(HTTPGetAction {
                path: Some("/bootstrapped".to_string()),
                port: IntOrString::Int(PORT_NODE_HTTP as i32),
                ..Default::default()
            }),
            initial_delay_seconds: Some(15),
            period_seconds: Some(10),
            failure_threshold: Some(3),
            ..Default::default()
        }),
        volume_mounts: Some(vec![
            VolumeMount {
                name: "config".to_string(),
                mount_path: CONFIG_DIR.to_string(),
                ..Default::default()
            },
            VolumeMount {
                name: "pod-identity".to_string(),
                mount_path: POD_IDENTITY_DIR.to_string(),
                read_only: Some(true),
                ..Default::default()
            },
            VolumeMount {
                name: "data".to_string(),
                mount_path: DATA_DIR.to_string(),
                ..Default::default()
            },
            VolumeMount {
                name: "cache".to_string(),
                mount_path: "/var/lib/m3kv".to_string(),
                ..Default::default()
            },
        ]),
        resources: cluster.spec.resources.as_ref().map(container_resources),
        ..Default::default()
    }
}

fn node_port(name: &str, port: i32) -> ContainerPort {
    ContainerPort {
        name: Some(name.to_string()),
        container_port: port,
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

fn container_resources(
    resources: &ResourcesSpec,
) -> k8s_openapi::api::core::v1::ResourceRequirements {
    let amounts = |cpu: &Option<String>, memory: &Option<String>| {
        let mut map = BTreeMap::new();
        if let Some(cpu) = cpu {
            map.insert("cpu".to_string(), Quantity(cpu.clone()));
        }
        if let Some(memory) = memory {
            map.insert("memory".to_string(), Quantity(memory.clone()));
        }
        (!map.is_empty()).then_some(map)
    };

    k8s_openapi::api::core::v1::ResourceRequirements {
        requests: amounts(&resources.requests.cpu, &resources.requests.memory),
        limits: amounts(&resources.limits.cpu, &resources.limits.memory),
        ..Default::default()
    }
}

/// Image of the node container on an observed StatefulSet
pub fn sts_image(sts: &StatefulSet) -> Option<&str> {
    sts.spec
        .as_ref()?
        .template
        .spec
        .as_ref()?
        .containers
        .iter()
        .find(|c| c.name == "m3dbnode")?
        .image
        .as_deref()
}

/// Declared replica count on an observed StatefulSet
pub fn sts_replicas(sts: &StatefulSet) -> i32 {
    sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        IsolationGroup, M3DBClusterSpec, PodIdentityConfig, ResourceAmounts, StorageSpec,
    };

    fn cluster(storage: Option<StorageSpec>) -> M3DBCluster {
        let mut cluster = M3DBCluster::new(
            "prod",
            M3DBClusterSpec {
                image: "quay.io/m3db/m3dbnode:v1.5.0".to_string(),
                replication_factor: 3,
                num_shards: 64,
                isolation_groups: vec![
                    IsolationGroup {
                        name: "g1".to_string(),
                        num_instances: 2,
                    },
                    IsolationGroup {
                        name: "g2".to_string(),
                        num_instances: 1,
                    },
                ],
                etcd_endpoints: vec!["http://etcd:2379".to_string()],
                namespaces: Vec::new(),
                pod_identity_config: PodIdentityConfig::default(),
                environment: None,
                resources: Some(ResourcesSpec {
                    requests: ResourceAmounts {
                        cpu: Some("4".to_string()),
                        memory: Some("8Gi".to_string()),
                    },
                    limits: ResourceAmounts::default(),
                }),
                storage,
                enable_carbon_ingester: false,
            },
        );
        cluster.metadata.namespace = Some("metrics".to_string());
        cluster.metadata.uid = Some("uid-123".to_string());
        cluster
    }

    #[test]
    fn stateful_set_is_named_cluster_dash_group() {
        let c = cluster(None);
        let sts = stateful_set(&c, &c.spec.isolation_groups[0]);
        assert_eq!(sts.metadata.name.as_deref(), Some("prod-g1"));
        assert_eq!(sts_replicas(&sts), 2);
        assert_eq!(sts.spec.as_ref().unwrap().service_name, "prod");
    }

    #[test]
    fn pod_template_carries_group_as_rack_label() {
        let c = cluster(None);
        let sts = stateful_set(&c, &c.spec.isolation_groups[1]);
        let labels = sts
            .spec
            .as_ref()
            .unwrap()
            .template
            .metadata
            .as_ref()
            .unwrap()
            .labels
            .as_ref()
            .unwrap();
        assert_eq!(labels[crate::LABEL_ISOLATION_GROUP], "g2");
        assert_eq!(labels[crate::LABEL_CLUSTER], "prod");
    }

    #[test]
    fn anti_affinity_spans_the_whole_cluster_by_hostname() {
        let c = cluster(None);
        let sts = stateful_set(&c, &c.spec.isolation_groups[0]);
        let terms = sts
            .spec
            .unwrap()
            .template
            .spec
            .unwrap()
            .affinity
            .unwrap()
            .pod_anti_affinity
            .unwrap()
            .required_during_scheduling_ignored_during_execution
            .unwrap();
        assert_eq!(terms[0].topology_key, "kubernetes.io/hostname");
        let match_labels = terms[0]
            .label_selector
            .as_ref()
            .unwrap()
            .match_labels
            .as_ref()
            .unwrap();
        assert_eq!(match_labels[crate::LABEL_CLUSTER], "prod");
    }

    #[test]
    fn storage_request_becomes_a_volume_claim_template() {
        let c = cluster(Some(StorageSpec {
            size: "256Gi".to_string(),
            class_name: Some("fast-ssd".to_string()),
        }));
        let sts = stateful_set(&c, &c.spec.isolation_groups[0]);
        let claims = sts.spec.as_ref().unwrap().volume_claim_templates.as_ref().unwrap();
        assert_eq!(claims.len(), 1);
        let claim_spec = claims[0].spec.as_ref().unwrap();
        assert_eq!(claim_spec.storage_class_name.as_deref(), Some("fast-ssd"));

        // no emptyDir data volume when a claim exists
        let volumes = sts.spec.unwrap().template.spec.unwrap().volumes.unwrap();
        assert!(volumes.iter().all(|v| v.name != "data"));
    }

    #[test]
    fn ephemeral_clusters_fall_back_to_empty_dir() {
        let c = cluster(None);
        let sts = stateful_set(&c, &c.spec.isolation_groups[0]);
        assert!(sts.spec.as_ref().unwrap().volume_claim_templates.is_none());
        let volumes = sts.spec.unwrap().template.spec.unwrap().volumes.unwrap();
        assert!(volumes.iter().any(|v| v.name == "data" && v.empty_dir.is_some()));
    }

    #[test]
    fn init_container_substitutes_only_configured_sources() {
        let container = identity_init_container(&[PodIdentitySource::PodName]);
        let script = &container.command.as_ref().unwrap()[2];
        // the pod name expands; unconfigured sources stay empty strings
        assert!(script.contains(r#""$POD_NAME" '' ''"#));
        assert!(script.contains(r#""name":"%s""#));
        assert!(script.contains("/etc/m3db/pod-identity/identity"));

        let both = identity_init_container(&[
            PodIdentitySource::PodName,
            PodIdentitySource::PodUID,
        ]);
        let script = &both.command.as_ref().unwrap()[2];
        assert!(script.contains(r#""$POD_NAME" "$POD_UID" ''"#));
    }

    #[test]
    fn node_container_reads_the_rendered_config() {
        let c = cluster(None);
        let sts = stateful_set(&c, &c.spec.isolation_groups[0]);
        assert_eq!(sts_image(&sts), Some("quay.io/m3db/m3dbnode:v1.5.0"));
        let containers = &sts.spec.unwrap().template.spec.unwrap().containers;
        let args = containers[0].args.as_ref().unwrap();
        assert_eq!(args, &vec!["-f".to_string(), "/etc/m3db/m3.yml".to_string()]);
    }

    #[test]
    fn owner_reference_points_at_the_cluster() {
        let c = cluster(None);
        let sts = stateful_set(&c, &c.spec.isolation_groups[0]);
        let owners = sts.metadata.owner_references.unwrap();
        assert_eq!(owners[0].kind, "M3DBCluster");
        assert_eq!(owners[0].name, "prod");
        assert_eq!(owners[0].controller, Some(true));
    }
}
