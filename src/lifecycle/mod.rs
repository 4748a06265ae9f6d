//! Cluster lifecycle: state machine, collaborators and the provider-agnostic
//! orchestration skeleton
//!
//! Every cloud exposes the same [`ClusterProvider`] capability. The generic
//! [`LifecycleController`] implements it on top of a [`ProviderBackend`], which
//! only knows how to build steps and look up live infrastructure.

mod controller;
mod endpoint;
mod state;

pub use controller::LifecycleController;
pub use endpoint::MemoizedEndpoint;
pub use state::ClusterState;

use crate::error::{LifecycleError, SecretError, StoreError};
use crate::model::{
    CloudCredentials, CloudProvider, ClusterId, ClusterResources, ClusterSpec, Credentials,
    UpdateClusterRequest,
};
use crate::nodepool::{DesiredPools, LiveDescriptions, NodePoolSpec, ReconciledPool};
use crate::pipeline::{BoxedStep, PipelineResult};
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Resolves credentials stored per organization
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SecretResolver: Send + Sync {
    async fn get_secret(
        &self,
        organization: &str,
        secret_id: &str,
    ) -> Result<Credentials, SecretError>;
}

/// Durable storage of cluster records
///
/// `save` and `delete` are the only writes of the pool set; the lifecycle
/// controller issues at most one of them per operation.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// Load a cluster record, `None` when it does not exist
    async fn load(&self, id: &ClusterId) -> Result<Option<ClusterSpec>, StoreError>;

    /// Persist the full record, including its pool set
    async fn save(&self, cluster: &ClusterSpec) -> Result<(), StoreError>;

    /// Remove the record
    async fn delete(&self, id: &ClusterId) -> Result<(), StoreError>;

    /// Record the lifecycle state without touching the pool set
    async fn update_status(
        &self,
        id: &ClusterId,
        state: ClusterState,
        message: &str,
    ) -> Result<(), StoreError>;
}

/// Result of an update call
#[derive(Debug, Clone)]
pub struct UpdateOutcome {
    pub result: PipelineResult,
    /// True when the request matched the stored record and nothing ran
    pub no_op: bool,
    /// The record as persisted after the update
    pub cluster: ClusterSpec,
}

/// Read-only projection of a stored cluster
#[derive(Debug, Clone, PartialEq)]
pub struct StatusSnapshot {
    pub id: ClusterId,
    pub name: String,
    pub cloud: CloudProvider,
    pub location: String,
    pub state: ClusterState,
    pub message: String,
    pub node_pools: BTreeMap<String, NodePoolSpec>,
}

/// Live control plane information
#[derive(Debug, Clone, PartialEq)]
pub struct DetailsSnapshot {
    pub id: ClusterId,
    pub name: String,
    pub kubernetes_version: String,
    pub api_endpoint: String,
    pub control_plane_id: String,
    pub node_pools: BTreeMap<String, NodePoolSpec>,
}

/// Control plane as reported by the cloud
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlPlane {
    pub id: String,
    pub version: String,
    /// Cloud-side lifecycle state, reported in not-ready errors
    pub status: String,
    pub ready: bool,
}

/// Lifecycle capability every cloud provider offers
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterProvider: Send + Sync {
    fn cloud(&self) -> CloudProvider;

    /// Provision a new cluster and its pools; rolls back on failure
    async fn create(
        &self,
        cluster: &mut ClusterSpec,
        node_pools: &DesiredPools,
    ) -> Result<PipelineResult, LifecycleError>;

    /// Converge a stored cluster onto the requested pool set
    async fn update(&self, request: &UpdateClusterRequest) -> Result<UpdateOutcome, LifecycleError>;

    /// Tear down a cluster; the record is removed only on full success
    async fn delete(&self, cluster: &mut ClusterSpec) -> Result<PipelineResult, LifecycleError>;

    fn status(&self, cluster: &ClusterSpec) -> Result<StatusSnapshot, LifecycleError>;

    async fn details(&self, cluster: &ClusterSpec) -> Result<DetailsSnapshot, LifecycleError>;
}

/// Provider-specific part of the lifecycle
///
/// A backend produces steps over its own per-operation context. The context
/// is created by [`ProviderBackend::open`] at the start of every operation and
/// dropped at its end, so nothing a step learns outlives the operation.
#[async_trait]
pub trait ProviderBackend: Send + Sync + 'static {
    type Context: Send + 'static;

    fn cloud(&self) -> CloudProvider;

    /// Open a cloud session for one operation
    async fn open(
        &self,
        cluster: &ClusterSpec,
        credentials: CloudCredentials,
    ) -> Result<Self::Context, LifecycleError>;

    /// Provider-specific checks on a create request, before any step runs
    fn validate_create(
        &self,
        _cluster: &ClusterSpec,
        _node_pools: &DesiredPools,
    ) -> Result<(), LifecycleError> {
        Ok(())
    }

    /// Steps that run before any pool step on create (network, role, control plane)
    fn prerequisite_steps(&self, cluster: &ClusterSpec) -> Vec<BoxedStep<Self::Context>>;

    /// The step applying one reconciled pool change
    fn pool_step(&self, cluster: &ClusterSpec, change: &ReconciledPool)
        -> BoxedStep<Self::Context>;

    /// Steps that run after all pool deletions on delete
    fn teardown_steps(&self, cluster: &ClusterSpec) -> Vec<BoxedStep<Self::Context>>;

    /// Load everything an update needs and describe the live pools
    async fn prepare_update(
        &self,
        ctx: &mut Self::Context,
        cluster: &ClusterSpec,
        node_pools: &DesiredPools,
    ) -> Result<LiveDescriptions, LifecycleError>;

    /// Copy step outputs worth persisting into the record
    fn record_outputs(&self, ctx: &Self::Context, resources: &mut ClusterResources);

    /// Release resources reserved outside the pipeline after a full delete
    async fn release_resources(
        &self,
        _ctx: &mut Self::Context,
        _cluster: &ClusterSpec,
    ) -> Result<(), LifecycleError> {
        Ok(())
    }

    async fn describe_control_plane(
        &self,
        ctx: &mut Self::Context,
        cluster: &ClusterSpec,
    ) -> Result<ControlPlane, LifecycleError>;

    /// API server endpoint, memoized in the context
    async fn api_endpoint(
        &self,
        ctx: &mut Self::Context,
        cluster: &ClusterSpec,
    ) -> Result<String, LifecycleError>;
}

/// One [`ClusterProvider`] per cloud
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<CloudProvider, Arc<dyn ClusterProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider under its own cloud tag, replacing any previous one
    pub fn register(mut self, provider: Arc<dyn ClusterProvider>) -> Self {
        self.providers.insert(provider.cloud(), provider);
        self
    }

    pub fn get(&self, cloud: CloudProvider) -> Result<Arc<dyn ClusterProvider>, LifecycleError> {
        self.providers
            .get(&cloud)
            .cloned()
            .ok_or(LifecycleError::UnsupportedProvider(cloud))
    }

    pub fn clouds(&self) -> Vec<CloudProvider> {
        self.providers.keys().copied().collect()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("clouds", &self.clouds())
            .finish()
    }
}
