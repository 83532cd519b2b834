//! Stable pod identity resolution.
//!
//! Placement instances are identified by a hash over a configured set of
//! pod metadata sources, not by pod name. The identity survives pod
//! restarts exactly when its sources do: name-based identities are stable
//! under StatefulSet ordinal reuse, UID-based identities are not.
//!
//! The canonical JSON encoding of the identity object is written into the
//! pod at a fixed path by an init container (see [`crate::resources`]) so
//! the database process reports the same id the operator computed.

use k8s_openapi::api::core::v1::{Node, Pod};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::crd::PodIdentitySource;
use crate::{Error, Result};

/// The identity object whose canonical JSON is hashed to form an
/// instance id. Unused sources stay as empty strings so the encoding is
/// deterministic for a fixed source set.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct PodIdentity {
    /// Pod name, when `PodName` is a source
    pub name: String,

    /// Pod UID, when `PodUID` is a source
    pub uid: String,

    /// Bound node name, when `NodeName` is a source
    pub node_name: String,

    /// Bound node external address, when `NodeExternalID` is a source
    pub node_external_id: String,

    /// Bound node provider id, when `NodeProviderID` is a source
    pub node_provider_id: String,
}

impl PodIdentity {
    /// Canonical JSON encoding; field order is fixed by the struct
    pub fn canonical_json(&self) -> String {
        serde_json::to_string(self).expect("identity serialization is infallible")
    }

    /// Instance id: hex SHA-256 of the canonical JSON
    pub fn instance_id(&self) -> String {
        let digest = Sha256::digest(self.canonical_json().as_bytes());
        format!("{digest:x}")
    }
}

/// Resolve a pod's identity from the configured source set.
///
/// Sources referencing the node require the pod to be bound and the node
/// object supplied; otherwise resolution reports NotReady and the caller
/// requeues.
pub fn resolve(
    pod: &Pod,
    node: Option<&Node>,
    sources: &[PodIdentitySource],
) -> Result<PodIdentity> {
    let pod_name = pod.metadata.name.as_deref().unwrap_or_default();
    let mut identity = PodIdentity::default();

    for source in sources {
        match source {
            PodIdentitySource::PodName => {
                if pod_name.is_empty() {
                    return Err(Error::not_ready("pod has no name"));
                }
                identity.name = pod_name.to_string();
            }
            PodIdentitySource::PodUID => {
                identity.uid = pod
                    .metadata
                    .uid
                    .clone()
                    .ok_or_else(|| Error::not_ready(format!("pod {pod_name} has no uid")))?;
            }
            PodIdentitySource::NodeName => {
                identity.node_name = bound_node_name(pod)?.to_string();
            }
            PodIdentitySource::NodeExternalID => {
                let node = bound_node(pod, node)?;
                identity.node_external_id = node
                    .status
                    .as_ref()
                    .and_then(|s| s.addresses.as_ref())
                    .and_then(|addrs| {
                        addrs
                            .iter()
                            .find(|a| a.type_ == "ExternalIP")
                            .map(|a| a.address.clone())
                    })
                    .ok_or_else(|| {
                        Error::not_ready(format!(
                            "node for pod {pod_name} has no external address"
                        ))
                    })?;
            }
            PodIdentitySource::NodeProviderID => {
                let node = bound_node(pod, node)?;
                identity.node_provider_id = node
                    .spec
                    .as_ref()
                    .and_then(|s| s.provider_id.clone())
                    .ok_or_else(|| {
                        Error::not_ready(format!("node for pod {pod_name} has no provider id"))
                    })?;
            }
        }
    }

    Ok(identity)
}

fn bound_node_name(pod: &Pod) -> Result<&str> {
    pod.spec
        .as_ref()
        .and_then(|s| s.node_name.as_deref())
        .filter(|n| !n.is_empty())
        .ok_or_else(|| {
            Error::not_ready(format!(
                "pod {} is not bound to a node",
                pod.metadata.name.as_deref().unwrap_or_default()
            ))
        })
}

fn bound_node<'a>(pod: &Pod, node: Option<&'a Node>) -> Result<&'a Node> {
    // Verify binding first so the error names the real precondition
    bound_node_name(pod)?;
    node.ok_or_else(|| {
        Error::not_ready(format!(
            "node object for pod {} not observed yet",
            pod.metadata.name.as_deref().unwrap_or_default()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{NodeAddress, NodeSpec, NodeStatus, PodSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn pod(name: &str, uid: Option<&str>, node: Option<&str>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                uid: uid.map(String::from),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: node.map(String::from),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn node(provider_id: Option<&str>, external_ip: Option<&str>) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some("node-1".to_string()),
                ..Default::default()
            },
            spec: Some(NodeSpec {
                provider_id: provider_id.map(String::from),
                ..Default::default()
            }),
            status: Some(NodeStatus {
                addresses: external_ip.map(|ip| {
                    vec![NodeAddress {
                        type_: "ExternalIP".to_string(),
                        address: ip.to_string(),
                    }]
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn name_identity_is_deterministic() {
        let p = pod("cluster-g1-0", Some("uid-a"), None);
        let sources = [PodIdentitySource::PodName];

        let a = resolve(&p, None, &sources).unwrap();
        let b = resolve(&p, None, &sources).unwrap();
        assert_eq!(a.instance_id(), b.instance_id());
        assert_eq!(a.uid, "");
    }

    #[test]
    fn uid_change_changes_identity() {
        let sources = [PodIdentitySource::PodName, PodIdentitySource::PodUID];
        let before = resolve(&pod("cluster-g1-0", Some("uid-a"), None), None, &sources).unwrap();
        let after = resolve(&pod("cluster-g1-0", Some("uid-b"), None), None, &sources).unwrap();
        assert_ne!(before.instance_id(), after.instance_id());
    }

    #[test]
    fn name_identity_survives_uid_change() {
        let sources = [PodIdentitySource::PodName];
        let before = resolve(&pod("cluster-g1-0", Some("uid-a"), None), None, &sources).unwrap();
        let after = resolve(&pod("cluster-g1-0", Some("uid-b"), None), None, &sources).unwrap();
        assert_eq!(before.instance_id(), after.instance_id());
    }

    #[test]
    fn node_source_requires_binding() {
        let sources = [PodIdentitySource::NodeName];
        let err = resolve(&pod("cluster-g1-0", None, None), None, &sources).unwrap_err();
        assert!(matches!(err, Error::NotReady(_)));
    }

    #[test]
    fn provider_id_source_requires_node_object() {
        let sources = [PodIdentitySource::NodeProviderID];
        let p = pod("cluster-g1-0", None, Some("node-1"));

        let err = resolve(&p, None, &sources).unwrap_err();
        assert!(matches!(err, Error::NotReady(_)));

        let id = resolve(&p, Some(&node(Some("aws:///i-abc"), None)), &sources).unwrap();
        assert_eq!(id.node_provider_id, "aws:///i-abc");
    }

    #[test]
    fn external_id_source_reads_external_address() {
        let sources = [PodIdentitySource::NodeExternalID];
        let p = pod("cluster-g1-0", None, Some("node-1"));

        let id = resolve(&p, Some(&node(None, Some("203.0.113.7"))), &sources).unwrap();
        assert_eq!(id.node_external_id, "203.0.113.7");

        let err = resolve(&p, Some(&node(None, None)), &sources).unwrap_err();
        assert!(matches!(err, Error::NotReady(_)));
    }

    #[test]
    fn canonical_json_has_fixed_field_order() {
        let id = PodIdentity {
            name: "p".to_string(),
            ..Default::default()
        };
        assert_eq!(
            id.canonical_json(),
            r#"{"name":"p","uid":"","node_name":"","node_external_id":"","node_provider_id":""}"#
        );
    }

    #[test]
    fn instance_id_is_hex_sha256() {
        let id = PodIdentity::default().instance_id();
        assert_eq!(id.len(), 64);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
