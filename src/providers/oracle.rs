//! Managed-network provider
//!
//! A preconfigured VCN is created first and its subnets are read back: two
//! load balancer subnets for the cluster and the worker subnets that node
//! pools are spread over. Pools are placed with [`crate::nodepool::place`].
//!
//! On delete the pipeline removes pools and the cluster; the VCN is released
//! afterwards, once nothing runs inside it.

use super::{missing_input, tolerate_missing};
use crate::error::{CloudError, ConfigurationError, LifecycleError, StepError};
use crate::lifecycle::{ControlPlane, MemoizedEndpoint, ProviderBackend};
use crate::model::{CloudCredentials, CloudProvider, ClusterResources, ClusterSpec, Credentials};
use crate::nodepool::{
    place, Allocation, DesiredPools, LiveDescriptions, LivePoolDescription, NodePoolSpec,
    ReconciledPool, SubnetId,
};
use crate::pipeline::{BoxedStep, Step};
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// Cluster lifecycle state once the API server is serving
pub const ACTIVE: &str = "ACTIVE";

/// Load balancer subnets a cluster needs
pub const LB_SUBNETS: usize = 2;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkValues {
    pub lb_subnet_ids: Vec<SubnetId>,
    pub worker_subnet_ids: Vec<SubnetId>,
}

impl NetworkValues {
    /// # Errors
    /// [`ConfigurationError::InvalidNetwork`] unless exactly two load
    /// balancer subnets exist.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.lb_subnet_ids.len() != LB_SUBNETS {
            return Err(ConfigurationError::InvalidNetwork(format!(
                "there must be {} load balancer subnets, found {}",
                LB_SUBNETS,
                self.lb_subnet_ids.len()
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OracleClusterRequest {
    pub name: String,
    pub kubernetes_version: String,
    pub vcn_id: String,
    pub lb_subnet_ids: Vec<SubnetId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OracleClusterDescription {
    pub id: String,
    pub name: String,
    pub kubernetes_version: String,
    pub lifecycle_state: String,
    #[serde(default)]
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OracleNodePoolRequest {
    pub cluster_id: String,
    pub name: String,
    pub kubernetes_version: String,
    pub shape: String,
    pub image: String,
    pub placement: Allocation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OracleNodePoolDescription {
    pub name: String,
    pub shape: String,
    pub image: String,
    pub placement: Allocation,
}

/// Vendor operations the managed-network provider needs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait OracleCloud: Send + Sync {
    /// Create a preconfigured VCN and return its id
    async fn create_vcn(&self, name: &str) -> Result<String, CloudError>;
    async fn delete_vcn(&self, vcn_id: &str) -> Result<(), CloudError>;
    async fn network_values(&self, vcn_id: &str) -> Result<NetworkValues, CloudError>;

    /// Create the cluster and return its id
    async fn create_cluster(&self, request: &OracleClusterRequest) -> Result<String, CloudError>;
    async fn delete_cluster(&self, cluster_id: &str) -> Result<(), CloudError>;
    async fn get_cluster(
        &self,
        cluster_id: &str,
    ) -> Result<Option<OracleClusterDescription>, CloudError>;

    async fn create_node_pool(&self, request: &OracleNodePoolRequest) -> Result<(), CloudError>;
    async fn update_node_pool(&self, request: &OracleNodePoolRequest) -> Result<(), CloudError>;
    async fn delete_node_pool(&self, cluster_id: &str, name: &str) -> Result<(), CloudError>;
    async fn describe_node_pool(
        &self,
        cluster_id: &str,
        name: &str,
    ) -> Result<Option<OracleNodePoolDescription>, CloudError>;
}

/// Opens an [`OracleCloud`] session for a region
#[async_trait]
pub trait OracleConnector: Send + Sync {
    async fn connect_oracle(
        &self,
        region: &str,
        credentials: &Credentials,
    ) -> Result<Arc<dyn OracleCloud>, CloudError>;
}

pub struct OracleContext {
    cloud: Arc<dyn OracleCloud>,
    cluster_name: String,
    kubernetes_version: String,
    vcn_id: Option<String>,
    network: Option<NetworkValues>,
    cluster_id: Option<String>,
    endpoint: MemoizedEndpoint,
}

impl OracleContext {
    fn new(cloud: Arc<dyn OracleCloud>, cluster: &ClusterSpec) -> Self {
        Self {
            cloud,
            cluster_name: cluster.name.clone(),
            kubernetes_version: cluster.properties.kubernetes_version.clone(),
            vcn_id: cluster.resources.network_id.clone(),
            network: None,
            cluster_id: cluster.resources.control_plane_id.clone(),
            endpoint: MemoizedEndpoint::new(),
        }
    }

    fn cluster_id(&self) -> Result<&str, StepError> {
        self.cluster_id
            .as_deref()
            .ok_or_else(|| missing_input("cluster id"))
    }

    async fn load_network(&mut self, vcn_id: &str) -> Result<(), StepError> {
        let values = self.cloud.network_values(vcn_id).await?;
        values.validate()?;
        self.network = Some(values);
        Ok(())
    }

    fn node_pool_request(&self, pool: &str, spec: &NodePoolSpec) -> Result<OracleNodePoolRequest, StepError> {
        let network = self
            .network
            .as_ref()
            .ok_or_else(|| missing_input("VCN network values"))?;
        let placement = place(pool, spec.count, &network.worker_subnet_ids)?;

        Ok(OracleNodePoolRequest {
            cluster_id: self.cluster_id()?.to_string(),
            name: pool.to_string(),
            kubernetes_version: self.kubernetes_version.clone(),
            shape: spec.instance_type.clone(),
            image: spec.image.clone(),
            placement,
        })
    }
}

struct CreateVcn;

#[async_trait]
impl Step<OracleContext> for CreateVcn {
    fn name(&self) -> &str {
        "create-vcn"
    }

    fn has_compensation(&self) -> bool {
        true
    }

    async fn execute(&self, ctx: &mut OracleContext) -> Result<(), StepError> {
        let vcn_id = ctx.cloud.create_vcn(&ctx.cluster_name).await?;
        info!(vcn = %vcn_id, "VCN created");
        ctx.vcn_id = Some(vcn_id);
        Ok(())
    }

    async fn compensate(&self, ctx: &mut OracleContext) -> Result<(), StepError> {
        let Some(vcn_id) = ctx.vcn_id.take() else {
            return Ok(());
        };
        tolerate_missing(ctx.cloud.delete_vcn(&vcn_id).await, &vcn_id)
    }
}

/// Reads the VCN subnets back; a topology that cannot host the cluster fails here
struct LoadNetwork;

#[async_trait]
impl Step<OracleContext> for LoadNetwork {
    fn name(&self) -> &str {
        "load-network"
    }

    async fn execute(&self, ctx: &mut OracleContext) -> Result<(), StepError> {
        let vcn_id = ctx.vcn_id.clone().ok_or_else(|| missing_input("VCN id"))?;
        ctx.load_network(&vcn_id).await
    }
}

struct CreateCluster;

#[async_trait]
impl Step<OracleContext> for CreateCluster {
    fn name(&self) -> &str {
        "create-cluster"
    }

    fn has_compensation(&self) -> bool {
        true
    }

    async fn execute(&self, ctx: &mut OracleContext) -> Result<(), StepError> {
        let network = ctx
            .network
            .as_ref()
            .ok_or_else(|| missing_input("VCN network values"))?;
        let request = OracleClusterRequest {
            name: ctx.cluster_name.clone(),
            kubernetes_version: ctx.kubernetes_version.clone(),
            vcn_id: ctx.vcn_id.clone().ok_or_else(|| missing_input("VCN id"))?,
            lb_subnet_ids: network.lb_subnet_ids.clone(),
        };

        let cluster_id = ctx.cloud.create_cluster(&request).await?;
        info!(cluster_id = %cluster_id, "Cluster created");
        ctx.cluster_id = Some(cluster_id);
        Ok(())
    }

    async fn compensate(&self, ctx: &mut OracleContext) -> Result<(), StepError> {
        let Some(cluster_id) = ctx.cluster_id.take() else {
            return Ok(());
        };
        tolerate_missing(ctx.cloud.delete_cluster(&cluster_id).await, &cluster_id)
    }
}

struct CreateNodePool {
    step: String,
    pool: String,
    spec: NodePoolSpec,
}

#[async_trait]
impl Step<OracleContext> for CreateNodePool {
    fn name(&self) -> &str {
        &self.step
    }

    fn has_compensation(&self) -> bool {
        true
    }

    async fn execute(&self, ctx: &mut OracleContext) -> Result<(), StepError> {
        let request = ctx.node_pool_request(&self.pool, &self.spec)?;
        info!(
            pool = %self.pool,
            per_subnet = request.placement.per_subnet,
            subnets = request.placement.subnets.len(),
            "Creating node pool"
        );
        ctx.cloud.create_node_pool(&request).await?;
        Ok(())
    }

    async fn compensate(&self, ctx: &mut OracleContext) -> Result<(), StepError> {
        let cluster_id = ctx.cluster_id()?;
        tolerate_missing(
            ctx.cloud.delete_node_pool(cluster_id, &self.pool).await,
            &self.pool,
        )
    }
}

struct UpdateNodePool {
    step: String,
    pool: String,
    spec: NodePoolSpec,
}

#[async_trait]
impl Step<OracleContext> for UpdateNodePool {
    fn name(&self) -> &str {
        &self.step
    }

    async fn execute(&self, ctx: &mut OracleContext) -> Result<(), StepError> {
        let request = ctx.node_pool_request(&self.pool, &self.spec)?;
        match ctx
            .cloud
            .describe_node_pool(&request.cluster_id, &self.pool)
            .await?
        {
            Some(_) => ctx.cloud.update_node_pool(&request).await?,
            None => {
                warn!(pool = %self.pool, "Node pool is missing, creating it");
                ctx.cloud.create_node_pool(&request).await?
            }
        }
        Ok(())
    }
}

struct DeleteNodePool {
    step: String,
    pool: String,
}

#[async_trait]
impl Step<OracleContext> for DeleteNodePool {
    fn name(&self) -> &str {
        &self.step
    }

    fn destructive(&self) -> bool {
        true
    }

    async fn execute(&self, ctx: &mut OracleContext) -> Result<(), StepError> {
        let Some(cluster_id) = ctx.cluster_id.as_deref() else {
            info!(pool = %self.pool, "No cluster recorded, node pool already absent");
            return Ok(());
        };
        tolerate_missing(
            ctx.cloud.delete_node_pool(cluster_id, &self.pool).await,
            &self.pool,
        )
    }
}

struct DeleteCluster;

#[async_trait]
impl Step<OracleContext> for DeleteCluster {
    fn name(&self) -> &str {
        "delete-cluster"
    }

    fn destructive(&self) -> bool {
        true
    }

    async fn execute(&self, ctx: &mut OracleContext) -> Result<(), StepError> {
        ctx.endpoint.invalidate();
        let Some(cluster_id) = ctx.cluster_id.as_deref() else {
            return Ok(());
        };
        tolerate_missing(ctx.cloud.delete_cluster(cluster_id).await, cluster_id)
    }
}

pub struct OracleBackend {
    connector: Arc<dyn OracleConnector>,
}

impl OracleBackend {
    pub fn new(connector: Arc<dyn OracleConnector>) -> Self {
        Self { connector }
    }

    async fn describe_cluster(
        ctx: &OracleContext,
        cluster: &ClusterSpec,
    ) -> Result<OracleClusterDescription, LifecycleError> {
        let cluster_id = ctx
            .cluster_id
            .as_deref()
            .ok_or_else(|| CloudError::NotFound(cluster.name.clone()))?;
        let description = ctx
            .cloud
            .get_cluster(cluster_id)
            .await?
            .ok_or_else(|| CloudError::NotFound(cluster_id.to_string()))?;
        Ok(description)
    }
}

#[async_trait]
impl ProviderBackend for OracleBackend {
    type Context = OracleContext;

    fn cloud(&self) -> CloudProvider {
        CloudProvider::Oracle
    }

    async fn open(
        &self,
        cluster: &ClusterSpec,
        credentials: CloudCredentials,
    ) -> Result<OracleContext, LifecycleError> {
        let cloud = self
            .connector
            .connect_oracle(&cluster.location, &credentials.cloud)
            .await?;
        Ok(OracleContext::new(cloud, cluster))
    }

    fn validate_create(
        &self,
        _cluster: &ClusterSpec,
        node_pools: &DesiredPools,
    ) -> Result<(), LifecycleError> {
        if let Some((name, spec)) = node_pools.iter().find(|(_, spec)| spec.count == 0) {
            return Err(ConfigurationError::Unplaceable {
                pool: name.clone(),
                count: spec.count,
            }
            .into());
        }
        Ok(())
    }

    fn prerequisite_steps(&self, _cluster: &ClusterSpec) -> Vec<BoxedStep<OracleContext>> {
        vec![Box::new(CreateVcn), Box::new(LoadNetwork), Box::new(CreateCluster)]
    }

    fn pool_step(&self, _cluster: &ClusterSpec, change: &ReconciledPool) -> BoxedStep<OracleContext> {
        match change {
            ReconciledPool::Create { name, spec } => Box::new(CreateNodePool {
                step: format!("create-node-pool:{}", name),
                pool: name.clone(),
                spec: spec.clone(),
            }),
            ReconciledPool::Update { name, spec, .. } => Box::new(UpdateNodePool {
                step: format!("update-node-pool:{}", name),
                pool: name.clone(),
                spec: spec.clone(),
            }),
            ReconciledPool::Delete { name, .. } => Box::new(DeleteNodePool {
                step: format!("delete-node-pool:{}", name),
                pool: name.clone(),
            }),
        }
    }

    fn teardown_steps(&self, _cluster: &ClusterSpec) -> Vec<BoxedStep<OracleContext>> {
        vec![Box::new(DeleteCluster)]
    }

    async fn prepare_update(
        &self,
        ctx: &mut OracleContext,
        cluster: &ClusterSpec,
        node_pools: &DesiredPools,
    ) -> Result<LiveDescriptions, LifecycleError> {
        let vcn_id = ctx
            .vcn_id
            .clone()
            .ok_or_else(|| ConfigurationError::InvalidNetwork("no VCN recorded for cluster".to_string()))?;
        let values = ctx.cloud.network_values(&vcn_id).await?;
        values.validate()?;
        ctx.network = Some(values);

        let cluster_id = ctx
            .cluster_id
            .clone()
            .ok_or_else(|| CloudError::NotFound(cluster.name.clone()))?;

        let mut live = LiveDescriptions::new();
        for pool in &cluster.node_pools {
            let Some(description) = ctx.cloud.describe_node_pool(&cluster_id, &pool.name).await? else {
                info!(pool = %pool.name, "Node pool not found");
                continue;
            };
            let autoscaling = node_pools
                .get(&pool.name)
                .is_some_and(|requested| requested.autoscaling);
            live.insert(
                pool.name.clone(),
                LivePoolDescription {
                    instance_type: Some(description.shape),
                    image: Some(description.image),
                    spot_price: None,
                    observed_capacity: autoscaling.then(|| description.placement.total()),
                },
            );
        }
        Ok(live)
    }

    fn record_outputs(&self, ctx: &OracleContext, resources: &mut ClusterResources) {
        if let Some(vcn_id) = &ctx.vcn_id {
            resources.network_id = Some(vcn_id.clone());
        }
        if let Some(cluster_id) = &ctx.cluster_id {
            resources.control_plane_id = Some(cluster_id.clone());
        }
        if let Some(endpoint) = ctx.endpoint.get() {
            resources.api_endpoint = Some(endpoint.to_string());
        }
    }

    async fn release_resources(
        &self,
        ctx: &mut OracleContext,
        _cluster: &ClusterSpec,
    ) -> Result<(), LifecycleError> {
        let Some(vcn_id) = ctx.vcn_id.take() else {
            return Ok(());
        };
        match ctx.cloud.delete_vcn(&vcn_id).await {
            Err(e) if e.is_not_found() => {
                info!(vcn = %vcn_id, "VCN already absent");
                Ok(())
            }
            other => other.map_err(LifecycleError::from),
        }
    }

    async fn describe_control_plane(
        &self,
        ctx: &mut OracleContext,
        cluster: &ClusterSpec,
    ) -> Result<ControlPlane, LifecycleError> {
        let description = Self::describe_cluster(ctx, cluster).await?;
        Ok(ControlPlane {
            ready: description.lifecycle_state == ACTIVE,
            id: description.id,
            version: description.kubernetes_version,
            status: description.lifecycle_state,
        })
    }

    async fn api_endpoint(
        &self,
        ctx: &mut OracleContext,
        cluster: &ClusterSpec,
    ) -> Result<String, LifecycleError> {
        if let Some(endpoint) = ctx.endpoint.get() {
            return Ok(endpoint.to_string());
        }
        let description = Self::describe_cluster(ctx, cluster).await?;
        let endpoint = description.endpoint.ok_or_else(|| LifecycleError::NotReady {
            cluster: cluster.name.clone(),
            reason: "API endpoint is not published yet".to_string(),
        })?;
        ctx.endpoint.store(endpoint.clone());
        Ok(endpoint)
    }
}

#[cfg(test)]
#[path = "oracle_test.rs"]
mod tests;
