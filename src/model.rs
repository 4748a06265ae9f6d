//! Cluster-level domain types shared by the lifecycle controller and providers

use crate::lifecycle::ClusterState;
use crate::nodepool::{DesiredPools, NodePoolCurrent};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Stable key of a cluster record (`namespace/name` on the kube surface)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClusterId(pub String);

impl ClusterId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Cloud backend tag of a cluster
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum CloudProvider {
    /// Stack-based provisioning (network, role and node pools as stacks)
    Amazon,
    /// Managed-network provisioning (VCN with worker subnet spread)
    Oracle,
}

impl CloudProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloudProvider::Amazon => "amazon",
            CloudProvider::Oracle => "oracle",
        }
    }
}

impl fmt::Display for CloudProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Properties fixed at creation time
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterProperties {
    /// Kubernetes version of the control plane
    pub kubernetes_version: String,

    /// Secret holding the SSH public key for worker nodes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_secret_id: Option<String>,
}

/// Provider resources reserved for a cluster, released on delete
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterResources {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_endpoint: Option<String>,
}

/// A cluster as known to persistence
///
/// Owned by the lifecycle controller for the duration of one operation.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterSpec {
    pub id: ClusterId,
    pub name: String,
    pub organization: String,
    pub location: String,
    pub cloud: CloudProvider,
    pub secret_id: String,
    pub properties: ClusterProperties,
    pub created_by: String,
    pub created_at: Option<DateTime<Utc>>,
    pub state: ClusterState,
    pub status_message: String,
    pub node_pools: Vec<NodePoolCurrent>,
    pub resources: ClusterResources,
}

impl ClusterSpec {
    /// A not-yet-provisioned cluster from a create request
    pub fn from_request(request: &CreateClusterRequest) -> Self {
        Self {
            id: request.id.clone(),
            name: request.name.clone(),
            organization: request.organization.clone(),
            location: request.location.clone(),
            cloud: request.cloud,
            secret_id: request.secret_id.clone(),
            properties: request.properties.clone(),
            created_by: request.created_by.clone(),
            created_at: None,
            state: ClusterState::Requested,
            status_message: String::new(),
            node_pools: Vec::new(),
            resources: ClusterResources::default(),
        }
    }

    /// Persisted pools that are not marked for deletion
    pub fn active_pools(&self) -> impl Iterator<Item = &NodePoolCurrent> {
        self.node_pools.iter().filter(|p| !p.marked_for_deletion)
    }
}

/// Caller request to provision a new cluster
#[derive(Debug, Clone, PartialEq)]
pub struct CreateClusterRequest {
    pub id: ClusterId,
    pub name: String,
    pub organization: String,
    pub location: String,
    pub cloud: CloudProvider,
    pub secret_id: String,
    pub created_by: String,
    pub properties: ClusterProperties,
    pub node_pools: DesiredPools,
}

/// Caller request to converge an existing cluster onto a new pool set
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateClusterRequest {
    pub cluster: ClusterId,
    pub cloud: CloudProvider,
    pub updated_by: String,
    pub node_pools: DesiredPools,
}

/// Resolved secret values
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    values: BTreeMap<String, String>,
}

impl Credentials {
    pub fn new(values: BTreeMap<String, String>) -> Self {
        Self { values }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn values(&self) -> &BTreeMap<String, String> {
        &self.values
    }
}

impl fmt::Debug for Credentials {
    // never print secret values
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("keys", &self.values.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Credentials handed to a provider when it opens a cloud session
#[derive(Debug, Clone, Default)]
pub struct CloudCredentials {
    pub cloud: Credentials,
    /// SSH secret, resolved only for providers that need it
    pub ssh: Option<Credentials>,
}
