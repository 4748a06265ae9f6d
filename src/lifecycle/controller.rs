//! Provider-agnostic lifecycle orchestration
//!
//! Turns lifecycle requests into step sequences, runs them through the
//! pipeline and writes the outcome back to the store exactly once.

use super::{
    ClusterProvider, ClusterState, ClusterStore, DetailsSnapshot, ProviderBackend, SecretResolver,
    StatusSnapshot, UpdateOutcome,
};
use crate::equality::{is_noop_update, project_pools};
use crate::error::LifecycleError;
use crate::model::{CloudCredentials, CloudProvider, ClusterSpec, UpdateClusterRequest};
use crate::nodepool::{
    apply_update_defaults, reconcile_node_pools, DesiredPools, LiveDescriptions, NodePoolCurrent,
    NodePoolIdentity, PoolDefaults, ReconciledPool,
};
use crate::pipeline::{BoxedStep, PipelineExecutor, PipelineResult};
use crate::server::metrics::SharedMetrics;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, info_span, warn, Instrument, Span};

/// Lifecycle implementation shared by every cloud
///
/// Holds no per-cluster state; one instance serves all clusters of its cloud
/// concurrently.
pub struct LifecycleController<B: ProviderBackend> {
    backend: B,
    store: Arc<dyn ClusterStore>,
    secrets: Arc<dyn SecretResolver>,
    executor: PipelineExecutor,
    defaults: PoolDefaults,
    metrics: Option<SharedMetrics>,
    span: Span,
}

impl<B: ProviderBackend> LifecycleController<B> {
    pub fn new(
        backend: B,
        store: Arc<dyn ClusterStore>,
        secrets: Arc<dyn SecretResolver>,
        span: Span,
    ) -> Self {
        Self {
            backend,
            store,
            secrets,
            executor: PipelineExecutor::default(),
            defaults: PoolDefaults::default(),
            metrics: None,
            span,
        }
    }

    /// Executor template (timeout, cancellation) used for every pipeline
    pub fn with_executor(mut self, executor: PipelineExecutor) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_defaults(mut self, defaults: PoolDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn with_metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn operation_span(&self, operation: &'static str, cluster: &ClusterSpec) -> Span {
        info_span!(
            parent: &self.span,
            "cluster_operation",
            operation,
            cluster = %cluster.id,
            cloud = %cluster.cloud
        )
    }

    async fn credentials(&self, cluster: &ClusterSpec) -> Result<CloudCredentials, LifecycleError> {
        let cloud = self
            .secrets
            .get_secret(&cluster.organization, &cluster.secret_id)
            .await?;
        let ssh = match &cluster.properties.ssh_secret_id {
            Some(secret_id) => Some(
                self.secrets
                    .get_secret(&cluster.organization, secret_id)
                    .await?,
            ),
            None => None,
        };
        Ok(CloudCredentials { cloud, ssh })
    }

    async fn open(&self, cluster: &ClusterSpec) -> Result<B::Context, LifecycleError> {
        let credentials = self.credentials(cluster).await?;
        self.backend.open(cluster, credentials).await
    }

    /// Checked transition, recorded through `update_status`
    async fn enter(
        &self,
        cluster: &mut ClusterSpec,
        state: ClusterState,
        message: impl Into<String>,
    ) -> Result<(), LifecycleError> {
        cluster.state = cluster.state.transition(cluster.id.as_str(), state)?;
        cluster.status_message = message.into();
        self.store
            .update_status(&cluster.id, cluster.state, &cluster.status_message)
            .await?;
        Ok(())
    }

    /// Move to Failed; persistence problems are logged and counted, never returned
    ///
    /// A record left in Creating or Deleting by a lost write is marked Failed
    /// as interrupted on the next reconcile.
    async fn fail(
        &self,
        operation: &'static str,
        cluster: &mut ClusterSpec,
        message: String,
        save: bool,
    ) {
        match cluster.state.transition(cluster.id.as_str(), ClusterState::Failed) {
            Ok(state) => cluster.state = state,
            Err(e) => {
                warn!(error = %e, "Cannot mark cluster as failed");
                return;
            }
        }
        cluster.status_message = message;

        let written = if save {
            self.store.save(cluster).await
        } else {
            self.store
                .update_status(&cluster.id, cluster.state, &cluster.status_message)
                .await
        };
        if let Err(e) = written {
            warn!(error = %e, "Failed to persist failed cluster state");
            self.record_persistence_failure(operation);
        }
    }

    async fn run_pipeline(
        &self,
        operation: &'static str,
        steps: &[BoxedStep<B::Context>],
        ctx: &mut B::Context,
        rollback_on_failure: bool,
    ) -> PipelineResult {
        let started = Instant::now();
        let result = self
            .executor
            .clone()
            .with_span(Span::current())
            .execute(steps, ctx, rollback_on_failure)
            .await;

        if let Some(metrics) = &self.metrics {
            metrics.record_pipeline(operation, &result, started.elapsed().as_secs_f64());
        }
        result
    }

    fn record_persistence_failure(&self, operation: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_persistence_failure(operation);
        }
    }

    fn record_early_failure(&self, operation: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_operation(operation, "rejected");
        }
    }

    async fn create_cluster(
        &self,
        cluster: &mut ClusterSpec,
        node_pools: &DesiredPools,
    ) -> Result<PipelineResult, LifecycleError> {
        // validation happens before anything is touched
        let changes =
            reconcile_node_pools(node_pools, &[], &LiveDescriptions::new(), &self.defaults)?;
        self.backend.validate_create(cluster, node_pools)?;

        self.enter(cluster, ClusterState::Creating, "creating cluster")
            .await?;

        let mut ctx = match self.open(cluster).await {
            Ok(ctx) => ctx,
            Err(e) => {
                self.fail("create", cluster, e.to_string(), false).await;
                return Err(e);
            }
        };

        let mut steps = self.backend.prerequisite_steps(cluster);
        steps.extend(
            changes
                .iter()
                .map(|change| self.backend.pool_step(cluster, change)),
        );

        let result = self.run_pipeline("create", &steps, &mut ctx, true).await;

        if let Some(error) = result.error() {
            warn!(summary = %result.summary(), "Cluster creation failed");
            self.fail("create", cluster, result.summary(), false).await;
            return Err(LifecycleError::Pipeline { result, error });
        }

        let pools: Vec<NodePoolCurrent> = changes
            .into_iter()
            .filter_map(|change| match change {
                ReconciledPool::Create { name, spec } => Some(NodePoolCurrent {
                    name,
                    identity: NodePoolIdentity::assign(&cluster.id, &cluster.created_by),
                    spec,
                    marked_for_deletion: false,
                }),
                _ => None,
            })
            .collect();
        cluster.node_pools = pools;
        if cluster.created_at.is_none() {
            cluster.created_at = Some(Utc::now());
        }
        self.backend.record_outputs(&ctx, &mut cluster.resources);
        cluster.state = cluster
            .state
            .transition(cluster.id.as_str(), ClusterState::Running)?;
        cluster.status_message = "cluster is running".to_string();

        self.store.save(cluster).await?;
        info!(pools = cluster.node_pools.len(), "Cluster created");
        Ok(result)
    }

    async fn update_cluster(
        &self,
        request: &UpdateClusterRequest,
    ) -> Result<UpdateOutcome, LifecycleError> {
        let mut cluster = self
            .store
            .load(&request.cluster)
            .await?
            .ok_or_else(|| LifecycleError::NotFound(request.cluster.clone()))?;

        let mut request = request.clone();
        apply_update_defaults(&mut request.node_pools, &cluster.location, &self.defaults);

        if is_noop_update(&request, &cluster)? {
            info!("Update matches stored cluster, nothing to do");
            if let Some(metrics) = &self.metrics {
                metrics.record_operation("update", "noop");
            }
            return Ok(UpdateOutcome {
                result: PipelineResult::empty(),
                no_op: true,
                cluster,
            });
        }

        // reject before touching the cloud
        if !cluster.state.can_transition(ClusterState::Updating) {
            return Err(LifecycleError::InvalidTransition {
                cluster: cluster.id.to_string(),
                from: cluster.state,
                to: ClusterState::Updating,
            });
        }

        let mut ctx = self.open(&cluster).await?;
        let live = self
            .backend
            .prepare_update(&mut ctx, &cluster, &request.node_pools)
            .await?;
        let changes = reconcile_node_pools(
            &request.node_pools,
            &cluster.node_pools,
            &live,
            &self.defaults,
        )?;

        let work: Vec<ReconciledPool> = changes
            .into_iter()
            .filter(|change| change.requires_work(&cluster.node_pools))
            .collect();
        info!(changes = work.len(), "Applying node pool changes");

        self.enter(
            &mut cluster,
            ClusterState::Updating,
            format!("applying {} node pool change(s)", work.len()),
        )
        .await?;

        let steps: Vec<BoxedStep<B::Context>> = work
            .iter()
            .map(|change| self.backend.pool_step(&cluster, change))
            .collect();
        let applied: Vec<(&ReconciledPool, String)> = work
            .iter()
            .zip(steps.iter().map(|step| step.name().to_string()))
            .collect();

        let result = self.run_pipeline("update", &steps, &mut ctx, false).await;

        apply_achieved(&mut cluster, &applied, &result, &request.updated_by);
        self.backend.record_outputs(&ctx, &mut cluster.resources);
        // partial updates go back to Running so the same request can be retried
        cluster.state = cluster
            .state
            .transition(cluster.id.as_str(), ClusterState::Running)?;

        match result.error() {
            None => {
                cluster.status_message = "cluster is running".to_string();
                self.store.save(&cluster).await?;
                info!("Cluster updated");
                Ok(UpdateOutcome {
                    result,
                    no_op: false,
                    cluster,
                })
            }
            Some(error) => {
                cluster.status_message = format!("update partially applied: {}", result.summary());
                warn!(summary = %result.summary(), "Cluster update partially applied");
                if let Err(e) = self.store.save(&cluster).await {
                    warn!(error = %e, "Failed to persist partially updated cluster");
                    self.record_persistence_failure("update");
                }
                Err(LifecycleError::Pipeline { result, error })
            }
        }
    }

    async fn delete_cluster(
        &self,
        cluster: &mut ClusterSpec,
    ) -> Result<PipelineResult, LifecycleError> {
        self.enter(cluster, ClusterState::Deleting, "deleting cluster")
            .await?;
        for pool in &mut cluster.node_pools {
            pool.marked_for_deletion = true;
        }

        let mut ctx = match self.open(cluster).await {
            Ok(ctx) => ctx,
            Err(e) => {
                self.fail("delete", cluster, e.to_string(), true).await;
                return Err(e);
            }
        };

        let deletions: Vec<ReconciledPool> = cluster
            .node_pools
            .iter()
            .map(|pool| ReconciledPool::Delete {
                name: pool.name.clone(),
                identity: pool.identity.clone(),
            })
            .collect();
        let mut steps: Vec<BoxedStep<B::Context>> = deletions
            .iter()
            .map(|change| self.backend.pool_step(cluster, change))
            .collect();
        let applied: Vec<(&ReconciledPool, String)> = deletions
            .iter()
            .zip(steps.iter().map(|step| step.name().to_string()))
            .collect();
        steps.extend(self.backend.teardown_steps(cluster));

        let result = self.run_pipeline("delete", &steps, &mut ctx, false).await;
        apply_achieved(cluster, &applied, &result, "");

        if let Some(error) = result.error() {
            warn!(summary = %result.summary(), "Cluster deletion failed");
            self.fail("delete", cluster, format!("delete failed: {}", result.summary()), true)
                .await;
            return Err(LifecycleError::Pipeline { result, error });
        }

        if let Err(e) = self.backend.release_resources(&mut ctx, cluster).await {
            warn!(error = %e, "Failed to release cluster resources");
            self.fail("delete", cluster, format!("releasing resources failed: {}", e), true)
                .await;
            return Err(e);
        }

        cluster.state = cluster
            .state
            .transition(cluster.id.as_str(), ClusterState::Deleted)?;
        cluster.status_message = "cluster deleted".to_string();
        self.store.delete(&cluster.id).await?;
        info!("Cluster deleted");
        Ok(result)
    }

    async fn cluster_details(&self, cluster: &ClusterSpec) -> Result<DetailsSnapshot, LifecycleError> {
        ensure_provisioned(cluster)?;

        let mut ctx = self.open(cluster).await?;
        let control_plane = self.backend.describe_control_plane(&mut ctx, cluster).await?;
        if !control_plane.ready {
            return Err(LifecycleError::NotReady {
                cluster: cluster.id.to_string(),
                reason: format!("control plane is {}", control_plane.status),
            });
        }
        let api_endpoint = self.backend.api_endpoint(&mut ctx, cluster).await?;

        Ok(DetailsSnapshot {
            id: cluster.id.clone(),
            name: cluster.name.clone(),
            kubernetes_version: control_plane.version,
            api_endpoint,
            control_plane_id: control_plane.id,
            node_pools: project_pools(cluster),
        })
    }
}

#[async_trait]
impl<B: ProviderBackend> ClusterProvider for LifecycleController<B> {
    fn cloud(&self) -> CloudProvider {
        self.backend.cloud()
    }

    async fn create(
        &self,
        cluster: &mut ClusterSpec,
        node_pools: &DesiredPools,
    ) -> Result<PipelineResult, LifecycleError> {
        let span = self.operation_span("create", cluster);
        let outcome = self.create_cluster(cluster, node_pools).instrument(span).await;
        if let Err(e) = &outcome {
            if e.pipeline_result().is_none() {
                self.record_early_failure("create");
            }
        }
        outcome
    }

    async fn update(&self, request: &UpdateClusterRequest) -> Result<UpdateOutcome, LifecycleError> {
        let span = info_span!(
            parent: &self.span,
            "cluster_operation",
            operation = "update",
            cluster = %request.cluster,
            cloud = %request.cloud
        );
        let outcome = self.update_cluster(request).instrument(span).await;
        if let Err(e) = &outcome {
            if e.pipeline_result().is_none() {
                self.record_early_failure("update");
            }
        }
        outcome
    }

    async fn delete(&self, cluster: &mut ClusterSpec) -> Result<PipelineResult, LifecycleError> {
        let span = self.operation_span("delete", cluster);
        let outcome = self.delete_cluster(cluster).instrument(span).await;
        if let Err(e) = &outcome {
            if e.pipeline_result().is_none() {
                self.record_early_failure("delete");
            }
        }
        outcome
    }

    fn status(&self, cluster: &ClusterSpec) -> Result<StatusSnapshot, LifecycleError> {
        ensure_provisioned(cluster)?;
        Ok(StatusSnapshot {
            id: cluster.id.clone(),
            name: cluster.name.clone(),
            cloud: cluster.cloud,
            location: cluster.location.clone(),
            state: cluster.state,
            message: cluster.status_message.clone(),
            node_pools: project_pools(cluster),
        })
    }

    async fn details(&self, cluster: &ClusterSpec) -> Result<DetailsSnapshot, LifecycleError> {
        let span = self.operation_span("details", cluster);
        self.cluster_details(cluster).instrument(span).await
    }
}

fn ensure_provisioned(cluster: &ClusterSpec) -> Result<(), LifecycleError> {
    if cluster.state.is_provisioning() {
        return Err(LifecycleError::NotReady {
            cluster: cluster.id.to_string(),
            reason: format!("cluster is {}", cluster.state),
        });
    }
    Ok(())
}

/// Fold the pool changes the pipeline achieved into the record
///
/// Succeeded creates and updates are applied, succeeded deletes removed.
/// Deletes that did not complete stay on the record marked for deletion.
fn apply_achieved(
    cluster: &mut ClusterSpec,
    applied: &[(&ReconciledPool, String)],
    result: &PipelineResult,
    actor: &str,
) {
    for (change, step) in applied {
        let done = result.step_succeeded(step);
        match change {
            ReconciledPool::Create { name, spec } if done => {
                cluster.node_pools.push(NodePoolCurrent {
                    name: name.clone(),
                    identity: NodePoolIdentity::assign(&cluster.id, actor),
                    spec: spec.clone(),
                    marked_for_deletion: false,
                });
            }
            ReconciledPool::Update { name, spec, .. } if done => {
                if let Some(pool) = cluster.node_pools.iter_mut().find(|p| &p.name == name) {
                    pool.spec = spec.clone();
                    pool.marked_for_deletion = false;
                }
            }
            ReconciledPool::Delete { name, .. } if done => {
                cluster.node_pools.retain(|p| &p.name != name);
            }
            ReconciledPool::Delete { name, .. } => {
                if let Some(pool) = cluster.node_pools.iter_mut().find(|p| &p.name == name) {
                    pool.marked_for_deletion = true;
                }
            }
            _ => {}
        }
    }
    cluster.node_pools.sort_by(|a, b| a.name.cmp(&b.name));
}

#[cfg(test)]
#[path = "controller_test.rs"]
mod tests;
