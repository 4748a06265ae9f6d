use crate::error::StoreError;
use crate::lifecycle::ClusterState;
use crate::model::{
    CloudProvider, ClusterId, ClusterProperties, ClusterResources, ClusterSpec,
    CreateClusterRequest, UpdateClusterRequest,
};
use crate::nodepool::{DesiredPools, NodePoolCurrent, NodePoolIdentity, NodePoolSpec};
use crate::pipeline::PipelineResult;
use chrono::{DateTime, SecondsFormat, Utc};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Annotation naming the user a cluster operation is performed for
pub const REQUESTED_BY_ANNOTATION: &str = "provisio.dev/requested-by";

/// Actor recorded when no requester annotation is set
pub const DEFAULT_ACTOR: &str = "provisio-operator";

/// ManagedCluster declares a Kubernetes cluster provisioned on a cloud backend
///
/// The spec is the desired state; the status is the persisted cluster record
/// (lifecycle phase, node pool records, reserved resources).
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    group = "provisio.dev",
    version = "v1alpha1",
    kind = "ManagedCluster",
    namespaced,
    status = "ManagedClusterStatus",
    shortname = "mcl",
    printcolumn = r#"{"name":"Cloud", "type":"string", "jsonPath":".spec.cloud"}"#,
    printcolumn = r#"{"name":"Location", "type":"string", "jsonPath":".spec.location"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ManagedClusterSpec {
    /// Organization owning the cluster and its secrets
    pub organization: String,

    /// Cloud region
    pub location: String,

    /// Cloud backend; immutable after creation
    pub cloud: CloudProvider,

    /// Name of the cloud credentials secret in the organization's namespace
    pub secret_ref: String,

    /// Creation-time properties
    #[serde(default)]
    pub properties: ClusterProperties,

    /// Desired node pools keyed by pool name
    #[serde(default)]
    pub node_pools: DesiredPools,
}

/// Persisted cluster record
///
/// `message` and `nodePools` are always serialized so that a merge patch
/// clears stale values.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ManagedClusterStatus {
    #[serde(default)]
    pub phase: ClusterState,

    #[serde(default)]
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,

    /// RFC3339 creation time of the cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,

    #[serde(default)]
    pub node_pools: Vec<PersistedNodePool>,

    #[serde(default)]
    pub resources: ClusterResources,

    /// Step ledger of the most recent lifecycle operation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_operation: Option<OperationRecord>,

    /// Generation of the spec the last operation acted on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Identity the cluster was provisioned with; later spec edits do not move it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisioned: Option<ProvisionedIdentity>,
}

/// Creation-time identity of a cluster, pinned once provisioning starts
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionedIdentity {
    pub organization: String,
    pub location: String,
    pub cloud: CloudProvider,
    pub secret_ref: String,
    #[serde(default)]
    pub properties: ClusterProperties,
}

impl ProvisionedIdentity {
    pub fn from_cluster(cluster: &ClusterSpec) -> Self {
        Self {
            organization: cluster.organization.clone(),
            location: cluster.location.clone(),
            cloud: cluster.cloud,
            secret_ref: cluster.secret_id.clone(),
            properties: cluster.properties.clone(),
        }
    }

    fn apply(&self, cluster: &mut ClusterSpec) {
        cluster.organization = self.organization.clone();
        cluster.location = self.location.clone();
        cluster.cloud = self.cloud;
        cluster.secret_id = self.secret_ref.clone();
        cluster.properties = self.properties.clone();
    }
}

/// Node pool record as stored in the status
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PersistedNodePool {
    pub name: String,
    pub id: String,
    pub created_by: String,
    /// RFC3339
    pub created_at: String,
    pub spec: NodePoolSpec,
    #[serde(default)]
    pub marked_for_deletion: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OperationRecord {
    /// create, update or delete
    pub operation: String,
    pub result: PipelineResult,
    /// RFC3339
    pub finished_at: String,
}

impl OperationRecord {
    pub fn now(operation: &str, result: PipelineResult) -> Self {
        Self {
            operation: operation.to_string(),
            result,
            finished_at: rfc3339(Utc::now()),
        }
    }
}

fn rfc3339(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn parse_time(value: &str, what: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("{} {:?} is not RFC3339: {}", what, value, e)))
}

impl PersistedNodePool {
    pub fn from_current(pool: &NodePoolCurrent) -> Self {
        Self {
            name: pool.name.clone(),
            id: pool.identity.id.clone(),
            created_by: pool.identity.created_by.clone(),
            created_at: rfc3339(pool.identity.created_at),
            spec: pool.spec.clone(),
            marked_for_deletion: pool.marked_for_deletion,
        }
    }

    /// # Errors
    /// [`StoreError::Corrupt`] if `createdAt` is not RFC3339.
    pub fn to_current(&self, cluster_id: &ClusterId) -> Result<NodePoolCurrent, StoreError> {
        Ok(NodePoolCurrent {
            name: self.name.clone(),
            identity: NodePoolIdentity {
                id: self.id.clone(),
                created_by: self.created_by.clone(),
                created_at: parse_time(&self.created_at, "node pool createdAt")?,
                cluster_id: cluster_id.clone(),
            },
            spec: self.spec.clone(),
            marked_for_deletion: self.marked_for_deletion,
        })
    }
}

impl ManagedClusterStatus {
    /// Status carrying the persisted parts of a cluster record
    pub fn from_cluster(cluster: &ClusterSpec) -> Self {
        Self {
            phase: cluster.state,
            message: cluster.status_message.clone(),
            created_by: Some(cluster.created_by.clone()),
            created_at: cluster.created_at.map(rfc3339),
            node_pools: cluster
                .node_pools
                .iter()
                .map(PersistedNodePool::from_current)
                .collect(),
            resources: cluster.resources.clone(),
            last_operation: None,
            observed_generation: None,
            provisioned: Some(ProvisionedIdentity::from_cluster(cluster)),
        }
    }
}

impl ManagedCluster {
    /// `namespace/name`, or `None` for a resource without namespace
    pub fn cluster_id(&self) -> Option<ClusterId> {
        let namespace = self.namespace()?;
        Some(ClusterId::new(format!("{}/{}", namespace, self.name_any())))
    }

    pub fn requested_by(&self) -> String {
        self.annotations()
            .get(REQUESTED_BY_ANNOTATION)
            .cloned()
            .unwrap_or_else(|| DEFAULT_ACTOR.to_string())
    }

    pub fn phase(&self) -> Option<ClusterState> {
        self.status.as_ref().map(|s| s.phase)
    }

    /// Pinned identity fields whose spec value was edited after provisioning
    pub fn identity_drift(&self) -> Vec<&'static str> {
        let Some(pinned) = self.status.as_ref().and_then(|s| s.provisioned.as_ref()) else {
            return Vec::new();
        };
        let mut drift = Vec::new();
        if pinned.organization != self.spec.organization {
            drift.push("organization");
        }
        if pinned.location != self.spec.location {
            drift.push("location");
        }
        if pinned.cloud != self.spec.cloud {
            drift.push("cloud");
        }
        if pinned.secret_ref != self.spec.secret_ref {
            drift.push("secretRef");
        }
        if pinned.properties != self.spec.properties {
            drift.push("properties");
        }
        drift
    }

    pub fn create_request(&self, id: ClusterId) -> CreateClusterRequest {
        CreateClusterRequest {
            id,
            name: self.name_any(),
            organization: self.spec.organization.clone(),
            location: self.spec.location.clone(),
            cloud: self.spec.cloud,
            secret_id: self.spec.secret_ref.clone(),
            created_by: self.requested_by(),
            properties: self.spec.properties.clone(),
            node_pools: self.spec.node_pools.clone(),
        }
    }

    pub fn update_request(&self, id: ClusterId) -> UpdateClusterRequest {
        UpdateClusterRequest {
            cluster: id,
            cloud: self.spec.cloud,
            updated_by: self.requested_by(),
            node_pools: self.spec.node_pools.clone(),
        }
    }

    /// The cluster record
    ///
    /// Persisted state comes from the status. Identity comes from the pinned
    /// [`ProvisionedIdentity`] once provisioning started, from the spec before.
    ///
    /// # Errors
    /// [`StoreError::Corrupt`] if a stored timestamp cannot be parsed.
    pub fn to_cluster_spec(&self, id: &ClusterId) -> Result<ClusterSpec, StoreError> {
        let mut cluster = ClusterSpec::from_request(&self.create_request(id.clone()));
        let Some(status) = &self.status else {
            return Ok(cluster);
        };

        if let Some(provisioned) = &status.provisioned {
            provisioned.apply(&mut cluster);
        }
        cluster.state = status.phase;
        cluster.status_message = status.message.clone();
        if let Some(created_by) = &status.created_by {
            cluster.created_by = created_by.clone();
        }
        cluster.created_at = status
            .created_at
            .as_deref()
            .map(|t| parse_time(t, "cluster createdAt"))
            .transpose()?;
        cluster.node_pools = status
            .node_pools
            .iter()
            .map(|p| p.to_current(id))
            .collect::<Result<_, _>>()?;
        cluster.resources = status.resources.clone();
        Ok(cluster)
    }
}

#[cfg(test)]
#[path = "cluster_test.rs"]
mod tests;
