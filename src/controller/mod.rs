//! kube-rs control loop for `ManagedCluster` resources
//!
//! The controller translates resource events into lifecycle calls on the
//! provider registered for the cluster's cloud:
//!
//! - new resource → create
//! - spec generation changed on a running cluster → update
//! - deletion timestamp → delete, then release the finalizer

pub mod cdevents;
mod reconcile;
mod secrets;
mod store;

pub use reconcile::{error_policy, reconcile};
pub use secrets::KubeSecretResolver;
pub use store::{split_cluster_id, KubeClusterStore};

use crate::config::RequeueIntervals;
use crate::crd::OperationRecord;
use crate::error::{LifecycleError, StoreError};
use crate::lifecycle::{ClusterStore, ProviderRegistry};
use crate::model::ClusterId;
use crate::server::SharedMetrics;
use async_trait::async_trait;
use cdevents::CDEventsSink;
#[cfg(test)]
use mockall::automock;
use std::sync::Arc;
use thiserror::Error;

/// Finalizer holding a `ManagedCluster` until its infrastructure is torn down
pub const FINALIZER: &str = "provisio.dev/cluster-cleanup";

/// Field manager of every patch the operator sends
pub const FIELD_MANAGER: &str = "provisio-controller";

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("ManagedCluster missing namespace")]
    MissingNamespace,

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error("persistence error: {0}")]
    Store(#[from] StoreError),
}

/// Resource bookkeeping outside the cluster record
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterResourceApi: Send + Sync {
    async fn add_finalizer(&self, id: &ClusterId) -> Result<(), StoreError>;

    async fn remove_finalizer(&self, id: &ClusterId) -> Result<(), StoreError>;

    /// Record the ledger of a finished operation
    ///
    /// `observed_generation` is left untouched when `None`, so the spec is
    /// acted on again.
    async fn record_operation(
        &self,
        id: &ClusterId,
        operation: &OperationRecord,
        observed_generation: Option<i64>,
    ) -> Result<(), StoreError>;

    /// Mark a spec generation as handled without running anything
    async fn observe_generation(&self, id: &ClusterId, generation: i64) -> Result<(), StoreError>;
}

pub struct Context {
    pub registry: ProviderRegistry,
    pub store: Arc<dyn ClusterStore>,
    pub resources: Arc<dyn ClusterResourceApi>,
    pub cdevents_sink: CDEventsSink,
    pub requeue: RequeueIntervals,
    pub metrics: Option<SharedMetrics>,
}

impl Context {
    pub fn new(
        registry: ProviderRegistry,
        store: Arc<dyn ClusterStore>,
        resources: Arc<dyn ClusterResourceApi>,
        cdevents_sink: CDEventsSink,
        requeue: RequeueIntervals,
    ) -> Self {
        Context {
            registry,
            store,
            resources,
            cdevents_sink,
            requeue,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }
}
