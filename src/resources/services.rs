//! Service projection: one headless service for peer discovery and one
//! client-facing service for coordinator traffic.

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;

use crate::crd::M3DBCluster;
use crate::{PORT_CARBON, PORT_COORDINATOR};

use super::{cluster_labels, coordinator_service_name, headless_service_name, owner_reference};

fn tcp_port(name: &str, port: i32) -> ServicePort {
    ServicePort {
        name: Some(name.to_string()),
        port,
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

/// Headless peer-discovery service.
///
/// Not-ready addresses are published so nodes can find each other while
/// bootstrapping; this is also the governing service giving pods their
/// stable DNS names.
pub fn headless_service(cluster: &M3DBCluster) -> Service {
    let name = cluster.name_any();
    Service {
        metadata: ObjectMeta {
            name: Some(headless_service_name(&name)),
            namespace: cluster.namespace(),
            labels: Some(cluster_labels(&name)),
            owner_references: Some(vec![owner_reference(cluster)]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            selector: Some(cluster_labels(&name)),
            publish_not_ready_addresses: Some(true),
            ports: Some(vec![
                tcp_port("client", 9000),
                tcp_port("cluster", 9001),
                tcp_port("http-node", 9002),
                tcp_port("http-cluster", 9003),
                tcp_port("debug", 9004),
            ]),
            ..Default::default()
        }),
        status: None,
    }
}

/// Client-facing service routing to ready pods only
pub fn coordinator_service(cluster: &M3DBCluster) -> Service {
    let name = cluster.name_any();
    let mut ports = vec![
        tcp_port("coordinator", PORT_COORDINATOR as i32),
        tcp_port("client", 9000),
    ];
    if cluster.spec.enable_carbon_ingester {
        ports.push(tcp_port("carbon", PORT_CARBON as i32));
    }

    Service {
        metadata: ObjectMeta {
            name: Some(coordinator_service_name(&name)),
            namespace: cluster.namespace(),
            labels: Some(cluster_labels(&name)),
            owner_references: Some(vec![owner_reference(cluster)]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(cluster_labels(&name)),
            ports: Some(ports),
            ..Default::default()
        }),
        status: None,
    }
}

/// Whether an observed service differs from the projection in the fields
/// the operator owns
pub fn service_needs_update(observed: &Service, projected: &Service) -> bool {
    let observed_spec = observed.spec.as_ref();
    let projected_spec = projected.spec.as_ref();

    let ports = |s: Option<&ServiceSpec>| -> Vec<(Option<String>, i32)> {
        s.and_then(|s| s.ports.clone())
            .unwrap_or_default()
            .into_iter()
            .map(|p| (p.name, p.port))
            .collect()
    };

    ports(observed_spec) != ports(projected_spec)
        || observed_spec.and_then(|s| s.selector.clone())
            != projected_spec.and_then(|s| s.selector.clone())
        || observed_spec.and_then(|s| s.publish_not_ready_addresses)
            != projected_spec.and_then(|s| s.publish_not_ready_addresses)
}
