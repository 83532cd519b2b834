//! Node configuration rendering.
//!
//! The database process consumes one YAML file rendered from a
//! parameterized template. Inputs are the environment name, the ordered
//! etcd endpoints, and the carbon ingester flag; the file points the node
//! at the pod identity written by the init container.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use minijinja::{context, Environment};

use crate::crd::M3DBCluster;
use crate::{Error, Result};

use super::{cluster_labels, config_map_name, owner_reference};

/// Key of the rendered configuration within the ConfigMap
pub const CONFIG_KEY: &str = "m3.yml";

const NODE_CONFIG_TEMPLATE: &str = r#"db:
  logging:
    level: info
  metrics:
    prometheus:
      handlerPath: /metrics
    sanitization: prometheus
    samplingRate: 1.0
  listenAddress: 0.0.0.0:9000
  clusterListenAddress: 0.0.0.0:9001
  httpNodeListenAddress: 0.0.0.0:9002
  httpClusterListenAddress: 0.0.0.0:9003
  debugListenAddress: 0.0.0.0:9004
  hostID:
    resolver: file
    file:
      path: /etc/m3db/pod-identity/identity
      timeout: 5m
  client:
    writeConsistencyLevel: majority
    readConsistencyLevel: unstrict_majority
  gcPercentage: 100
  writeNewSeriesAsync: true
  commitlog:
    flushMaxBytes: 524288
    flushEvery: 1s
  filesystem:
    filePathPrefix: /var/lib/m3db
  discovery:
    config:
      service:
        env: {{ environment }}
        zone: embedded
        service: m3db
        cacheDir: /var/lib/m3kv
        etcdClusters:
          - zone: embedded
            endpoints:
{%- for endpoint in etcd_endpoints %}
              - {{ endpoint }}
{%- endfor %}
{%- if carbon_enabled %}
coordinator:
  carbon:
    ingester:
      listenAddress: 0.0.0.0:7204
{%- endif %}
"#;

/// Render the node configuration file
pub fn render_node_config(
    environment: &str,
    etcd_endpoints: &[String],
    carbon_enabled: bool,
) -> Result<String> {
    let mut env = Environment::new();
    env.add_template("m3.yml", NODE_CONFIG_TEMPLATE)
        .map_err(|e| Error::serialization(format!("node config template: {e}")))?;
    let template = env
        .get_template("m3.yml")
        .map_err(|e| Error::serialization(format!("node config template: {e}")))?;
    template
        .render(context! {
            environment => environment,
            etcd_endpoints => etcd_endpoints,
            carbon_enabled => carbon_enabled,
        })
        .map_err(|e| Error::serialization(format!("node config render: {e}")))
}

/// The environment namespacing this cluster's state in etcd: the spec's
/// environment when set, `<namespace>/<name>` otherwise.
pub fn cluster_environment(cluster: &M3DBCluster) -> String {
    cluster.spec.environment.clone().unwrap_or_else(|| {
        format!(
            "{}/{}",
            cluster.namespace().unwrap_or_default(),
            cluster.name_any()
        )
    })
}

/// Project the configuration ConfigMap for a cluster
pub fn config_map(cluster: &M3DBCluster) -> Result<ConfigMap> {
    let name = cluster.name_any();
    let rendered = render_node_config(
        &cluster_environment(cluster),
        &cluster.spec.etcd_endpoints,
        cluster.spec.enable_carbon_ingester,
    )?;

    Ok(ConfigMap {
        metadata: ObjectMeta {
            name: Some(config_map_name(&name)),
            namespace: cluster.namespace(),
            labels: Some(cluster_labels(&name)),
            owner_references: Some(vec![owner_reference(cluster)]),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(CONFIG_KEY.to_string(), rendered)])),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rendered_config_lists_endpoints_in_order() {
        let config = render_node_config(
            "metrics/prod",
            &[
                "http://etcd-0.etcd:2379".to_string(),
                "http://etcd-1.etcd:2379".to_string(),
            ],
            false,
        )
        .unwrap();

        assert!(config.contains("env: metrics/prod"));
        let first = config.find("etcd-0").unwrap();
        let second = config.find("etcd-1").unwrap();
        assert!(first < second);
        assert!(!config.contains("carbon"));
    }

    #[test]
    fn carbon_flag_appends_ingester_block() {
        let config =
            render_node_config("e", &["http://etcd:2379".to_string()], true).unwrap();
        assert!(config.contains("carbon"));
        assert!(config.contains("0.0.0.0:7204"));
    }

    #[test]
    fn rendered_config_references_pod_identity_path() {
        let config =
            render_node_config("e", &["http://etcd:2379".to_string()], false).unwrap();
        assert!(config.contains("/etc/m3db/pod-identity/identity"));
    }

    #[test]
    fn rendered_config_is_valid_yaml() {
        let config =
            render_node_config("e", &["http://etcd:2379".to_string()], true).unwrap();
        let parsed: serde_yaml::Value = serde_yaml::from_str(&config).unwrap();
        assert!(parsed.get("db").is_some());
        assert!(parsed.get("coordinator").is_some());
    }
}
