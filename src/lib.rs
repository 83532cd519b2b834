//! M3DB Operator - Kubernetes operator for M3DB cluster lifecycle management
//!
//! The operator watches M3DBCluster custom resources and drives the
//! underlying Kubernetes primitives (StatefulSets, Services, ConfigMaps)
//! plus the database's own admin API (placement and namespace services)
//! toward the declared state.
//!
//! # Architecture
//!
//! A reconciliation pass reads the desired document, the observed child
//! objects, and the observed placement, then performs at most one mutating
//! action before returning. Topology changes go through the placement
//! service so shard ownership is always handed off before a pod goes away.
//!
//! # Modules
//!
//! - [`crd`] - The M3DBCluster custom resource definition
//! - [`admin`] - Typed client for the M3 coordinator admin API
//! - [`placement`] - Pure placement computations (add/remove/init decisions)
//! - [`identity`] - Stable pod identity resolution
//! - [`resources`] - Projection of a cluster spec into child Kubernetes objects
//! - [`controller`] - Reconciliation state machine and status handling
//! - [`events`] - Kubernetes Event recording
//! - [`leader`] - Lease-based leader election
//! - [`metrics`] - Reconciliation metrics
//! - [`retry`] - Backoff helper for transient failures
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod admin;
pub mod controller;
pub mod crd;
pub mod error;
pub mod events;
pub mod identity;
pub mod leader;
pub mod metrics;
pub mod placement;
pub mod resources;
pub mod retry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Shared Constants
// =============================================================================

/// Finalizer the operator manages on M3DBCluster resources
pub const CLUSTER_FINALIZER: &str = "operator.m3db.io/finalizer";

/// Label carrying the owning cluster name
pub const LABEL_CLUSTER: &str = "operator.m3db.io/cluster";

/// Label carrying the component within the cluster
pub const LABEL_COMPONENT: &str = "operator.m3db.io/component";

/// Label carrying the isolation group a pod belongs to
pub const LABEL_ISOLATION_GROUP: &str = "operator.m3db.io/isolation-group";

/// Component label value for database node pods
pub const COMPONENT_M3DBNODE: &str = "m3dbnode";

/// Client tchannel port on database nodes; placement endpoints use this
pub const PORT_NODE: u32 = 9000;

/// HTTP port on database nodes serving /bootstrapped and /health
pub const PORT_NODE_HTTP: u32 = 9002;

/// Coordinator HTTP port serving the admin API
pub const PORT_COORDINATOR: u32 = 7201;

/// Carbon ingester port, exposed when the ingester is enabled
pub const PORT_CARBON: u32 = 7204;

/// Directory where the pod identity file is mounted inside database pods
pub const POD_IDENTITY_DIR: &str = "/etc/m3db/pod-identity";

/// Zone tag recorded on placement instances
pub const PLACEMENT_ZONE: &str = "embedded";

/// Default weight assigned to new placement instances
pub const INSTANCE_WEIGHT: u32 = 100;
