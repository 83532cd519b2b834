//! Custom Resource Definitions for the M3DB operator

mod cluster;
mod types;

pub use cluster::{M3DBCluster, M3DBClusterSpec, M3DBClusterStatus};
pub use types::{
    Condition, ConditionStatus, ConditionType, IsolationGroup, IsolationGroupStatus,
    NamespaceOptions, NamespaceSpec, PodIdentityConfig, PodIdentitySource, ResourceAmounts,
    ResourcesSpec, StorageSpec,
};
