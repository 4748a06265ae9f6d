//! Stack-based provider
//!
//! Create order: IAM role → network stack → SSH key → control plane → one
//! stack per node pool. Delete runs the reverse without rollback and treats
//! already-deleted resources as done.
//!
//! Resource names are derived from the cluster name:
//!
//! | Resource | Name |
//! |---|---|
//! | network stack, IAM role | `{cluster}-pipeline-eks` |
//! | node pool stack | `{cluster}-pipeline-eks-nodepool-{pool}` |
//! | SSH key pair | `ssh-key-for-cluster-{cluster}` |

use super::{missing_input, ssh_public_key, tolerate_missing};
use crate::error::{CloudError, ConfigurationError, LifecycleError, StepError};
use crate::lifecycle::{ControlPlane, MemoizedEndpoint, ProviderBackend};
use crate::model::{CloudCredentials, CloudProvider, ClusterResources, ClusterSpec, Credentials};
use crate::nodepool::{
    DesiredPools, LiveDescriptions, LivePoolDescription, NodePoolSpec, ReconciledPool,
    DEFAULT_SPOT_PRICE,
};
use crate::pipeline::{BoxedStep, Step};
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Control plane status reported once the API server is serving
pub const ACTIVE: &str = "ACTIVE";

// Network stack outputs
pub const OUTPUT_SECURITY_GROUPS: &str = "SecurityGroups";
pub const OUTPUT_VPC_ID: &str = "VpcId";
pub const OUTPUT_SUBNET_IDS: &str = "SubnetIds";

// Node pool stack parameters
pub const PARAM_IMAGE: &str = "NodeImageId";
pub const PARAM_INSTANCE_TYPE: &str = "NodeInstanceType";
pub const PARAM_SPOT_PRICE: &str = "NodeSpotPrice";
pub const PARAM_MIN_SIZE: &str = "NodeAutoScalingGroupMinSize";
pub const PARAM_MAX_SIZE: &str = "NodeAutoScalingGroupMaxSize";
pub const PARAM_DESIRED: &str = "NodeAutoScalingInitSize";
pub const PARAM_CLUSTER_NAME: &str = "ClusterName";
pub const PARAM_NODE_GROUP: &str = "NodeGroupName";
pub const PARAM_KEY_NAME: &str = "KeyName";
pub const PARAM_VPC_ID: &str = "VpcId";
pub const PARAM_SUBNETS: &str = "Subnets";
pub const PARAM_SECURITY_GROUP: &str = "ClusterControlPlaneSecurityGroup";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StackTemplate {
    Network,
    NodePool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackRequest {
    pub name: String,
    pub template: StackTemplate,
    pub parameters: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackDescription {
    pub name: String,
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneRequest {
    pub name: String,
    pub version: String,
    pub role_arn: String,
    pub subnet_ids: Vec<String>,
    pub security_group_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneDescription {
    pub id: String,
    pub version: String,
    pub status: String,
    #[serde(default)]
    pub endpoint: Option<String>,
}

/// Vendor operations the stack-based provider needs
///
/// Mutating calls return once the cloud reports the operation complete.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AmazonCloud: Send + Sync {
    /// Create the role if needed and return its ARN
    async fn ensure_role(&self, name: &str) -> Result<String, CloudError>;
    async fn delete_role(&self, name: &str) -> Result<(), CloudError>;

    async fn import_key_pair(&self, name: &str, public_key: &str) -> Result<(), CloudError>;
    async fn delete_key_pair(&self, name: &str) -> Result<(), CloudError>;

    async fn create_stack(&self, request: &StackRequest) -> Result<(), CloudError>;
    async fn update_stack(&self, request: &StackRequest) -> Result<(), CloudError>;
    async fn delete_stack(&self, name: &str) -> Result<(), CloudError>;
    async fn describe_stack(&self, name: &str) -> Result<Option<StackDescription>, CloudError>;

    /// Desired capacity of the autoscaling group behind a node pool stack
    async fn node_group_capacity(&self, stack: &str) -> Result<Option<u32>, CloudError>;

    async fn create_cluster(
        &self,
        request: &ControlPlaneRequest,
    ) -> Result<ControlPlaneDescription, CloudError>;
    async fn delete_cluster(&self, name: &str) -> Result<(), CloudError>;
    async fn describe_cluster(
        &self,
        name: &str,
    ) -> Result<Option<ControlPlaneDescription>, CloudError>;
}

/// Opens an [`AmazonCloud`] session for a region
#[async_trait]
pub trait AmazonConnector: Send + Sync {
    async fn connect_amazon(
        &self,
        region: &str,
        credentials: &Credentials,
    ) -> Result<Arc<dyn AmazonCloud>, CloudError>;
}

/// Deterministic per-cluster resource names
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceNames {
    cluster: String,
}

impl ResourceNames {
    pub fn new(cluster: &str) -> Self {
        Self {
            cluster: cluster.to_string(),
        }
    }

    pub fn network_stack(&self) -> String {
        format!("{}-pipeline-eks", self.cluster)
    }

    pub fn role(&self) -> String {
        format!("{}-pipeline-eks", self.cluster)
    }

    pub fn ssh_key(&self) -> String {
        format!("ssh-key-for-cluster-{}", self.cluster)
    }

    pub fn node_pool_stack(&self, pool: &str) -> String {
        format!("{}-pipeline-eks-nodepool-{}", self.cluster, pool)
    }
}

/// Outputs of the network stack that pool stacks and the control plane need
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkOutputs {
    pub vpc_id: String,
    pub subnet_ids: Vec<String>,
    pub security_group_id: String,
}

impl NetworkOutputs {
    /// # Errors
    /// [`ConfigurationError::MissingStackOutput`] naming the first absent output.
    pub fn from_stack(stack: &StackDescription) -> Result<Self, ConfigurationError> {
        let output = |key: &str| {
            stack
                .outputs
                .get(key)
                .filter(|value| !value.is_empty())
                .cloned()
                .ok_or_else(|| ConfigurationError::MissingStackOutput {
                    stack: stack.name.clone(),
                    output: key.to_string(),
                })
        };

        let security_group_id = output(OUTPUT_SECURITY_GROUPS)?;
        let vpc_id = output(OUTPUT_VPC_ID)?;
        let subnet_ids = output(OUTPUT_SUBNET_IDS)?
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            vpc_id,
            subnet_ids,
            security_group_id,
        })
    }
}

/// Per-operation state shared by the steps of one pipeline
pub struct AmazonContext {
    cloud: Arc<dyn AmazonCloud>,
    names: ResourceNames,
    cluster_name: String,
    ssh_public_key: Option<String>,
    key_name: Option<String>,
    role_arn: Option<String>,
    network: Option<NetworkOutputs>,
    control_plane_id: Option<String>,
    endpoint: MemoizedEndpoint,
}

impl AmazonContext {
    fn new(cloud: Arc<dyn AmazonCloud>, cluster: &ClusterSpec, ssh_public_key: Option<String>) -> Self {
        let names = ResourceNames::new(&cluster.name);
        let key_name = ssh_public_key.as_ref().map(|_| names.ssh_key());
        Self {
            cloud,
            names,
            cluster_name: cluster.name.clone(),
            ssh_public_key,
            key_name,
            role_arn: None,
            network: None,
            control_plane_id: cluster.resources.control_plane_id.clone(),
            endpoint: MemoizedEndpoint::new(),
        }
    }

    fn network(&self) -> Result<&NetworkOutputs, StepError> {
        self.network
            .as_ref()
            .ok_or_else(|| missing_input("network stack outputs"))
    }

    fn node_pool_request(
        &self,
        stack: &str,
        pool: &str,
        spec: &NodePoolSpec,
    ) -> Result<StackRequest, StepError> {
        let network = self.network()?;
        let (min, max) = if spec.autoscaling {
            (
                spec.min_count.unwrap_or(spec.count),
                spec.max_count.unwrap_or(spec.count),
            )
        } else {
            (spec.count, spec.count)
        };

        let mut parameters = BTreeMap::from([
            (PARAM_CLUSTER_NAME.to_string(), self.cluster_name.clone()),
            (PARAM_NODE_GROUP.to_string(), pool.to_string()),
            (PARAM_IMAGE.to_string(), spec.image.clone()),
            (PARAM_INSTANCE_TYPE.to_string(), spec.instance_type.clone()),
            (
                PARAM_SPOT_PRICE.to_string(),
                spec.spot_price
                    .clone()
                    .unwrap_or_else(|| DEFAULT_SPOT_PRICE.to_string()),
            ),
            (PARAM_MIN_SIZE.to_string(), min.to_string()),
            (PARAM_MAX_SIZE.to_string(), max.to_string()),
            (PARAM_DESIRED.to_string(), spec.count.to_string()),
            (PARAM_VPC_ID.to_string(), network.vpc_id.clone()),
            (PARAM_SUBNETS.to_string(), network.subnet_ids.join(",")),
            (
                PARAM_SECURITY_GROUP.to_string(),
                network.security_group_id.clone(),
            ),
        ]);
        if let Some(key_name) = &self.key_name {
            parameters.insert(PARAM_KEY_NAME.to_string(), key_name.clone());
        }

        Ok(StackRequest {
            name: stack.to_string(),
            template: StackTemplate::NodePool,
            parameters,
        })
    }
}

/// Immutable pool attributes as deployed, read back from the pool stack
fn live_description(stack: &StackDescription, capacity: Option<u32>) -> LivePoolDescription {
    LivePoolDescription {
        instance_type: stack.parameters.get(PARAM_INSTANCE_TYPE).cloned(),
        image: stack.parameters.get(PARAM_IMAGE).cloned(),
        spot_price: stack.parameters.get(PARAM_SPOT_PRICE).cloned(),
        observed_capacity: capacity,
    }
}

// ----------------------------------------------------------------------------
// Steps
// ----------------------------------------------------------------------------

struct EnsureRole {
    role: String,
}

#[async_trait]
impl Step<AmazonContext> for EnsureRole {
    fn name(&self) -> &str {
        "ensure-role"
    }

    fn has_compensation(&self) -> bool {
        true
    }

    async fn execute(&self, ctx: &mut AmazonContext) -> Result<(), StepError> {
        let arn = ctx.cloud.ensure_role(&self.role).await?;
        info!(role = %self.role, arn = %arn, "IAM role ensured");
        ctx.role_arn = Some(arn);
        Ok(())
    }

    async fn compensate(&self, ctx: &mut AmazonContext) -> Result<(), StepError> {
        tolerate_missing(ctx.cloud.delete_role(&self.role).await, &self.role)
    }
}

struct CreateNetworkStack {
    stack: String,
}

#[async_trait]
impl Step<AmazonContext> for CreateNetworkStack {
    fn name(&self) -> &str {
        "create-network-stack"
    }

    fn has_compensation(&self) -> bool {
        true
    }

    async fn execute(&self, ctx: &mut AmazonContext) -> Result<(), StepError> {
        let request = StackRequest {
            name: self.stack.clone(),
            template: StackTemplate::Network,
            parameters: BTreeMap::from([(
                PARAM_CLUSTER_NAME.to_string(),
                ctx.cluster_name.clone(),
            )]),
        };
        ctx.cloud.create_stack(&request).await?;

        let description = ctx
            .cloud
            .describe_stack(&self.stack)
            .await?
            .ok_or_else(|| CloudError::NotFound(self.stack.clone()))?;
        ctx.network = Some(NetworkOutputs::from_stack(&description)?);
        Ok(())
    }

    async fn compensate(&self, ctx: &mut AmazonContext) -> Result<(), StepError> {
        tolerate_missing(ctx.cloud.delete_stack(&self.stack).await, &self.stack)
    }
}

struct UploadSshKey {
    key_name: String,
}

#[async_trait]
impl Step<AmazonContext> for UploadSshKey {
    fn name(&self) -> &str {
        "upload-ssh-key"
    }

    fn has_compensation(&self) -> bool {
        true
    }

    async fn execute(&self, ctx: &mut AmazonContext) -> Result<(), StepError> {
        let public_key = ctx
            .ssh_public_key
            .as_deref()
            .ok_or_else(|| missing_input("SSH public key"))?;
        ctx.cloud.import_key_pair(&self.key_name, public_key).await?;
        Ok(())
    }

    async fn compensate(&self, ctx: &mut AmazonContext) -> Result<(), StepError> {
        tolerate_missing(ctx.cloud.delete_key_pair(&self.key_name).await, &self.key_name)
    }
}

struct CreateControlPlane {
    name: String,
    version: String,
}

#[async_trait]
impl Step<AmazonContext> for CreateControlPlane {
    fn name(&self) -> &str {
        "create-control-plane"
    }

    fn has_compensation(&self) -> bool {
        true
    }

    async fn execute(&self, ctx: &mut AmazonContext) -> Result<(), StepError> {
        let network = ctx.network()?;
        let request = ControlPlaneRequest {
            name: self.name.clone(),
            version: self.version.clone(),
            role_arn: ctx
                .role_arn
                .clone()
                .ok_or_else(|| missing_input("IAM role ARN"))?,
            subnet_ids: network.subnet_ids.clone(),
            security_group_ids: vec![network.security_group_id.clone()],
        };

        let description = ctx.cloud.create_cluster(&request).await?;
        info!(id = %description.id, status = %description.status, "Control plane created");
        ctx.control_plane_id = Some(description.id);
        if let Some(endpoint) = description.endpoint {
            ctx.endpoint.store(endpoint);
        }
        Ok(())
    }

    async fn compensate(&self, ctx: &mut AmazonContext) -> Result<(), StepError> {
        ctx.endpoint.invalidate();
        tolerate_missing(ctx.cloud.delete_cluster(&self.name).await, &self.name)
    }
}

struct CreateNodePoolStack {
    step: String,
    stack: String,
    pool: String,
    spec: NodePoolSpec,
}

#[async_trait]
impl Step<AmazonContext> for CreateNodePoolStack {
    fn name(&self) -> &str {
        &self.step
    }

    fn has_compensation(&self) -> bool {
        true
    }

    async fn execute(&self, ctx: &mut AmazonContext) -> Result<(), StepError> {
        let request = ctx.node_pool_request(&self.stack, &self.pool, &self.spec)?;
        ctx.cloud.create_stack(&request).await?;
        Ok(())
    }

    async fn compensate(&self, ctx: &mut AmazonContext) -> Result<(), StepError> {
        tolerate_missing(ctx.cloud.delete_stack(&self.stack).await, &self.stack)
    }
}

/// Updates the pool stack in place, recreating it if it vanished
struct UpdateNodePoolStack {
    step: String,
    stack: String,
    pool: String,
    spec: NodePoolSpec,
}

#[async_trait]
impl Step<AmazonContext> for UpdateNodePoolStack {
    fn name(&self) -> &str {
        &self.step
    }

    async fn execute(&self, ctx: &mut AmazonContext) -> Result<(), StepError> {
        let request = ctx.node_pool_request(&self.stack, &self.pool, &self.spec)?;
        match ctx.cloud.describe_stack(&self.stack).await? {
            Some(_) => ctx.cloud.update_stack(&request).await?,
            None => {
                warn!(stack = %self.stack, "Node pool stack is missing, creating it");
                ctx.cloud.create_stack(&request).await?
            }
        }
        Ok(())
    }
}

struct DeleteStack {
    step: String,
    stack: String,
}

#[async_trait]
impl Step<AmazonContext> for DeleteStack {
    fn name(&self) -> &str {
        &self.step
    }

    fn destructive(&self) -> bool {
        true
    }

    async fn execute(&self, ctx: &mut AmazonContext) -> Result<(), StepError> {
        tolerate_missing(ctx.cloud.delete_stack(&self.stack).await, &self.stack)
    }
}

struct DeleteControlPlane {
    name: String,
}

#[async_trait]
impl Step<AmazonContext> for DeleteControlPlane {
    fn name(&self) -> &str {
        "delete-control-plane"
    }

    fn destructive(&self) -> bool {
        true
    }

    async fn execute(&self, ctx: &mut AmazonContext) -> Result<(), StepError> {
        ctx.endpoint.invalidate();
        tolerate_missing(ctx.cloud.delete_cluster(&self.name).await, &self.name)
    }
}

struct DeleteSshKey {
    key_name: String,
}

#[async_trait]
impl Step<AmazonContext> for DeleteSshKey {
    fn name(&self) -> &str {
        "delete-ssh-key"
    }

    fn destructive(&self) -> bool {
        true
    }

    async fn execute(&self, ctx: &mut AmazonContext) -> Result<(), StepError> {
        tolerate_missing(ctx.cloud.delete_key_pair(&self.key_name).await, &self.key_name)
    }
}

struct DeleteRole {
    role: String,
}

#[async_trait]
impl Step<AmazonContext> for DeleteRole {
    fn name(&self) -> &str {
        "delete-role"
    }

    fn destructive(&self) -> bool {
        true
    }

    async fn execute(&self, ctx: &mut AmazonContext) -> Result<(), StepError> {
        tolerate_missing(ctx.cloud.delete_role(&self.role).await, &self.role)
    }
}

// ----------------------------------------------------------------------------
// Backend
// ----------------------------------------------------------------------------

pub struct AmazonBackend {
    connector: Arc<dyn AmazonConnector>,
}

impl AmazonBackend {
    pub fn new(connector: Arc<dyn AmazonConnector>) -> Self {
        Self { connector }
    }
}

#[async_trait]
impl ProviderBackend for AmazonBackend {
    type Context = AmazonContext;

    fn cloud(&self) -> CloudProvider {
        CloudProvider::Amazon
    }

    async fn open(
        &self,
        cluster: &ClusterSpec,
        credentials: CloudCredentials,
    ) -> Result<AmazonContext, LifecycleError> {
        let public_key =
            ssh_public_key(&credentials, cluster.properties.ssh_secret_id.as_deref())?;
        let cloud = self
            .connector
            .connect_amazon(&cluster.location, &credentials.cloud)
            .await?;
        Ok(AmazonContext::new(cloud, cluster, public_key))
    }

    fn prerequisite_steps(&self, cluster: &ClusterSpec) -> Vec<BoxedStep<AmazonContext>> {
        let names = ResourceNames::new(&cluster.name);
        let mut steps: Vec<BoxedStep<AmazonContext>> = vec![
            Box::new(EnsureRole { role: names.role() }),
            Box::new(CreateNetworkStack {
                stack: names.network_stack(),
            }),
        ];
        if cluster.properties.ssh_secret_id.is_some() {
            steps.push(Box::new(UploadSshKey {
                key_name: names.ssh_key(),
            }));
        }
        steps.push(Box::new(CreateControlPlane {
            name: cluster.name.clone(),
            version: cluster.properties.kubernetes_version.clone(),
        }));
        steps
    }

    fn pool_step(&self, cluster: &ClusterSpec, change: &ReconciledPool) -> BoxedStep<AmazonContext> {
        let names = ResourceNames::new(&cluster.name);
        match change {
            ReconciledPool::Create { name, spec } => Box::new(CreateNodePoolStack {
                step: format!("create-node-pool:{}", name),
                stack: names.node_pool_stack(name),
                pool: name.clone(),
                spec: spec.clone(),
            }),
            ReconciledPool::Update { name, spec, .. } => Box::new(UpdateNodePoolStack {
                step: format!("update-node-pool:{}", name),
                stack: names.node_pool_stack(name),
                pool: name.clone(),
                spec: spec.clone(),
            }),
            ReconciledPool::Delete { name, .. } => Box::new(DeleteStack {
                step: format!("delete-node-pool:{}", name),
                stack: names.node_pool_stack(name),
            }),
        }
    }

    fn teardown_steps(&self, cluster: &ClusterSpec) -> Vec<BoxedStep<AmazonContext>> {
        let names = ResourceNames::new(&cluster.name);
        vec![
            Box::new(DeleteControlPlane {
                name: cluster.name.clone(),
            }),
            Box::new(DeleteSshKey {
                key_name: names.ssh_key(),
            }),
            Box::new(DeleteStack {
                step: "delete-network-stack".to_string(),
                stack: names.network_stack(),
            }),
            Box::new(DeleteRole { role: names.role() }),
        ]
    }

    async fn prepare_update(
        &self,
        ctx: &mut AmazonContext,
        cluster: &ClusterSpec,
        node_pools: &DesiredPools,
    ) -> Result<LiveDescriptions, LifecycleError> {
        let stack = ctx.names.network_stack();
        let description = ctx
            .cloud
            .describe_stack(&stack)
            .await?
            .ok_or(CloudError::NotFound(stack))?;
        ctx.network = Some(NetworkOutputs::from_stack(&description)?);

        let mut live = LiveDescriptions::new();
        for pool in &cluster.node_pools {
            let stack = ctx.names.node_pool_stack(&pool.name);
            let Some(description) = ctx.cloud.describe_stack(&stack).await? else {
                info!(pool = %pool.name, "Node pool stack not found");
                continue;
            };

            let autoscaling = node_pools
                .get(&pool.name)
                .is_some_and(|requested| requested.autoscaling);
            let capacity = if autoscaling {
                ctx.cloud.node_group_capacity(&stack).await?
            } else {
                None
            };
            live.insert(pool.name.clone(), live_description(&description, capacity));
        }
        Ok(live)
    }

    fn record_outputs(&self, ctx: &AmazonContext, resources: &mut ClusterResources) {
        if let Some(network) = &ctx.network {
            resources.network_id = Some(network.vpc_id.clone());
        }
        if let Some(id) = &ctx.control_plane_id {
            resources.control_plane_id = Some(id.clone());
        }
        if let Some(endpoint) = ctx.endpoint.get() {
            resources.api_endpoint = Some(endpoint.to_string());
        }
    }

    async fn describe_control_plane(
        &self,
        ctx: &mut AmazonContext,
        cluster: &ClusterSpec,
    ) -> Result<ControlPlane, LifecycleError> {
        let description = ctx
            .cloud
            .describe_cluster(&cluster.name)
            .await?
            .ok_or_else(|| CloudError::NotFound(cluster.name.clone()))?;

        Ok(ControlPlane {
            ready: description.status == ACTIVE,
            id: description.id,
            version: description.version,
            status: description.status,
        })
    }

    async fn api_endpoint(
        &self,
        ctx: &mut AmazonContext,
        cluster: &ClusterSpec,
    ) -> Result<String, LifecycleError> {
        let cloud = ctx.cloud.clone();
        let name = cluster.name.clone();
        ctx.endpoint
            .get_or_fetch(|| async move {
                let description = cloud
                    .describe_cluster(&name)
                    .await?
                    .ok_or_else(|| CloudError::NotFound(name.clone()))?;
                description
                    .endpoint
                    .ok_or_else(|| LifecycleError::NotReady {
                        cluster: name.clone(),
                        reason: "API endpoint is not published yet".to_string(),
                    })
            })
            .await
    }
}

#[cfg(test)]
#[path = "amazon_test.rs"]
mod tests;
