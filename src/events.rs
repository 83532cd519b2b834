//! Kubernetes Event recording for the operator.
//!
//! Provides a trait-based abstraction over `kube::runtime::events::Recorder`
//! so the reconciler can emit standard Kubernetes Events visible via
//! `kubectl describe` and `kubectl get events`.
//!
//! Events are fire-and-forget: failures are logged as warnings and never
//! propagate errors. A failed event must never break reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Trait for publishing Kubernetes Events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a Kubernetes Event on the given resource.
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a new publisher reporting as the given controller name
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: None,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(
                reason,
                action,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// No-op implementation for tests
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Well-known event reason strings.
///
/// These appear in `kubectl get events` under the REASON column.
pub mod reasons {
    /// InitPlacement succeeded
    pub const PLACEMENT_INITIALIZED: &str = "PlacementInitialized";
    /// One or more instances were added to the placement
    pub const INSTANCES_ADDED: &str = "InstancesAdded";
    /// An instance's weight was zeroed ahead of removal
    pub const INSTANCE_DRAINING: &str = "InstanceDraining";
    /// An instance was removed from the placement
    pub const INSTANCE_REMOVED: &str = "InstanceRemoved";
    /// A database namespace was created
    pub const NAMESPACE_CREATED: &str = "NamespaceCreated";
    /// A database namespace was deleted
    pub const NAMESPACE_DELETED: &str = "NamespaceDeleted";
    /// A namespace change was refused because namespaces are immutable
    pub const NAMESPACE_IMMUTABLE: &str = "NamespaceImmutable";
    /// Spec validation failed
    pub const VALIDATION_FAILED: &str = "ValidationFailed";
    /// Cluster deletion cleanup has begun
    pub const DELETION_STARTED: &str = "DeletionStarted";
}

/// Well-known event action strings
pub mod actions {
    /// Generic reconcile pass
    pub const RECONCILE: &str = "Reconcile";
    /// Placement topology change
    pub const SCALE: &str = "Scale";
    /// Cluster deletion cleanup
    pub const DELETE: &str = "Delete";
}
