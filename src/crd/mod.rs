//! Custom resources served by the operator

pub mod cluster;

pub use cluster::{
    ManagedCluster, ManagedClusterSpec, ManagedClusterStatus, OperationRecord, PersistedNodePool,
    ProvisionedIdentity,
};
