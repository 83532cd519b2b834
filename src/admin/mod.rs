//! Typed client for the M3 coordinator admin API.
//!
//! The coordinator exposes placement and namespace services over HTTP with
//! JSON-encoded protobuf bodies. The reconciler depends only on the
//! [`AdminClient`] capability trait; tests substitute a mock that records
//! call sequences.

mod client;
mod namespace;
mod placement;

pub use client::AdminClientImpl;
pub use namespace::{
    namespace_request, IndexOptions, NamespaceListResponse, NamespaceOptions, NamespaceRegistry,
    NamespaceRequest, RetentionOptions, PRESET_ONE_MINUTE_FORTY_DAYS,
    PRESET_TEN_SECONDS_TWO_DAYS,
};
pub use placement::{
    Placement, PlacementAddRequest, PlacementInitRequest, PlacementInstance, PlacementResponse,
    SetWeightRequest, Shard, ShardState,
};

#[cfg(test)]
pub(crate) use placement::fixtures;

use async_trait::async_trait;
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

/// Header namespacing placement and namespace state within a shared etcd
pub const ENVIRONMENT_HEADER: &str = "Cluster-Environment-Name";

/// Errors surfaced by the admin transport
#[derive(Debug, Error)]
pub enum AdminError {
    /// HTTP 404 from the coordinator
    #[error("not found: {0}")]
    NotFound(String),

    /// HTTP 405 from the coordinator
    #[error("method not allowed: {0}")]
    MethodNotAllowed(String),

    /// A resource already exists with a different specification
    #[error("conflict: {0}")]
    Conflict(String),

    /// Any other non-2xx response; the message carries the body's error field
    #[error("status {status}: {message}")]
    Unexpected {
        /// HTTP status code
        status: u16,
        /// Error message parsed from the response body
        message: String,
    },

    /// Connection or protocol failure before a response was received
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Response body could not be decoded
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),
}

impl crate::retry::Transient for AdminError {
    /// Transport faults and 5xx answers are worth repeating; NotFound,
    /// MethodNotAllowed, Conflict, and other 4xx are definitive.
    fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Unexpected { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Result of a per-node bootstrap probe
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BootstrapStatus {
    /// The node has loaded its assigned shard data and is serving
    Bootstrapped,
    /// The node answered but has not finished bootstrapping
    NotBootstrapped,
    /// The node could not be reached
    Unknown,
}

/// Capability set the reconciler requires from the admin API.
///
/// One client instance talks to one cluster's coordinator; the environment
/// header is fixed at construction.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AdminClient: Send + Sync {
    /// Initialize the placement. Already-exists with an identical instance
    /// set is idempotent success; a differing set is a conflict.
    async fn init_placement(&self, request: &PlacementInitRequest) -> Result<(), AdminError>;

    /// Fetch the current placement snapshot, `None` if uninitialized
    async fn get_placement(&self) -> Result<Option<Placement>, AdminError>;

    /// Delete the placement; absent placement is success
    async fn delete_placement(&self) -> Result<(), AdminError>;

    /// Add instances to the placement and return the updated snapshot
    async fn add_instances(
        &self,
        instances: Vec<PlacementInstance>,
    ) -> Result<Placement, AdminError>;

    /// Remove one instance from the placement. The coordinator refuses if
    /// the instance still carries non-LEAVING shards.
    async fn remove_instance(&self, id: &str) -> Result<(), AdminError>;

    /// Set an instance's weight
    async fn set_instance_weight(&self, id: &str, weight: u32) -> Result<(), AdminError>;

    /// Create a namespace. Already-exists with equal options is idempotent
    /// success; differing options is a conflict.
    async fn create_namespace(&self, request: &NamespaceRequest) -> Result<(), AdminError>;

    /// Delete a namespace; absent namespace is success
    async fn delete_namespace(&self, name: &str) -> Result<(), AdminError>;

    /// List registered namespaces with their options
    async fn list_namespaces(
        &self,
    ) -> Result<std::collections::BTreeMap<String, NamespaceOptions>, AdminError>;

    /// Probe one database node's bootstrap endpoint
    async fn node_bootstrapped(&self, endpoint: &str) -> Result<BootstrapStatus, AdminError>;
}
