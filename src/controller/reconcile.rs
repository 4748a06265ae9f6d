use super::cdevents::{emit_environment_event, EnvironmentEvent};
use super::{Context, ReconcileError, FINALIZER};
use crate::crd::{ManagedCluster, OperationRecord};
use crate::error::LifecycleError;
use crate::lifecycle::{ClusterProvider, ClusterState};
use crate::model::{ClusterId, ClusterSpec};
use crate::pipeline::PipelineResult;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Requeue after adding the finalizer, so the next pass sees it
const FINALIZER_REQUEUE: Duration = Duration::from_secs(1);

/// Reconcile a ManagedCluster
///
/// The phase decides the lifecycle call:
///
/// | Phase | Action |
/// |---|---|
/// | Requested | create |
/// | Running, spec generation not observed | update |
/// | Creating / Updating / Deleting | interrupted, marked Failed |
/// | Failed | wait for deletion |
///
/// A deletion timestamp always wins and tears the cluster down. The backend is
/// chosen by the cloud the record was provisioned on, never by the live spec.
pub async fn reconcile(
    cluster: Arc<ManagedCluster>,
    ctx: Arc<Context>,
) -> Result<Action, ReconcileError> {
    let outcome = reconcile_cluster(&cluster, &ctx).await;
    if let Some(metrics) = &ctx.metrics {
        match &outcome {
            Ok(_) => metrics.record_reconciliation_success(),
            Err(_) => metrics.record_reconciliation_error(),
        }
    }
    outcome
}

/// Requeue after a reconcile error
///
/// Uses `warn!` since reconciliation errors are expected and trigger retries.
pub fn error_policy(
    cluster: Arc<ManagedCluster>,
    error: &ReconcileError,
    ctx: Arc<Context>,
) -> Action {
    warn!(cluster = %cluster.name_any(), error = %error, "Reconcile error (will retry)");
    Action::requeue(ctx.requeue.error)
}

fn has_finalizer(cluster: &ManagedCluster) -> bool {
    cluster.finalizers().iter().any(|f| f == FINALIZER)
}

/// Spec generation not yet acted on, if any
fn pending_generation(cluster: &ManagedCluster) -> Option<i64> {
    let generation = cluster.metadata.generation?;
    let observed = cluster.status.as_ref().and_then(|s| s.observed_generation);
    (observed != Some(generation)).then_some(generation)
}

async fn reconcile_cluster(
    cluster: &ManagedCluster,
    ctx: &Context,
) -> Result<Action, ReconcileError> {
    let id = cluster
        .cluster_id()
        .ok_or(ReconcileError::MissingNamespace)?;

    info!(cluster = %id, phase = ?cluster.phase(), "Reconciling ManagedCluster");

    if cluster.metadata.deletion_timestamp.is_some() {
        return handle_deletion(cluster, &id, ctx).await;
    }

    if !has_finalizer(cluster) {
        ctx.resources.add_finalizer(&id).await?;
        return Ok(Action::requeue(FINALIZER_REQUEUE));
    }

    // read through to the API server; the watch cache can lag behind our own writes
    let Some(record) = ctx.store.load(&id).await? else {
        return Ok(Action::await_change());
    };

    let drift = cluster.identity_drift();
    if record.state == ClusterState::Running && !drift.is_empty() {
        warn!(cluster = %id, fields = ?drift, "Immutable fields edited after provisioning");
        let message = format!(
            "{} cannot change after provisioning, revert the spec",
            drift.join(", ")
        );
        ctx.store
            .update_status(&id, record.state, &message)
            .await?;
        return Ok(Action::await_change());
    }

    let provider = match ctx.registry.get(record.cloud) {
        Ok(provider) => provider,
        Err(e) => return reject(ctx, &id, record.state, &e).await,
    };

    match record.state {
        ClusterState::Requested => create(cluster, &id, record, provider.as_ref(), ctx).await,
        ClusterState::Running => match pending_generation(cluster) {
            Some(generation) => update(cluster, &id, generation, provider.as_ref(), ctx).await,
            None => Ok(Action::requeue(ctx.requeue.running)),
        },
        ClusterState::Creating | ClusterState::Updating | ClusterState::Deleting => {
            warn!(cluster = %id, phase = %record.state, "Operation was interrupted, marking cluster as failed");
            let message = format!("{} was interrupted before completion", record.state);
            ctx.store
                .update_status(&id, ClusterState::Failed, &message)
                .await?;
            Ok(Action::requeue(ctx.requeue.failed))
        }
        ClusterState::Failed => {
            info!(cluster = %id, message = %record.status_message, "Cluster failed, delete the resource to tear it down");
            Ok(Action::requeue(ctx.requeue.failed))
        }
        ClusterState::Deleted => Ok(Action::await_change()),
    }
}

async fn create(
    cluster: &ManagedCluster,
    id: &ClusterId,
    mut record: ClusterSpec,
    provider: &dyn ClusterProvider,
    ctx: &Context,
) -> Result<Action, ReconcileError> {
    let generation = cluster.metadata.generation;

    match provider.create(&mut record, &cluster.spec.node_pools).await {
        Ok(result) => {
            info!(cluster = %id, summary = %result.summary(), "Cluster provisioned");
            ctx.resources
                .record_operation(id, &OperationRecord::now("create", result.clone()), generation)
                .await?;
            emit(cluster, EnvironmentEvent::Created, &result, ctx).await;
            Ok(Action::requeue(ctx.requeue.running))
        }
        Err(e) => handle_failure(ctx, id, "create", record.state, e, generation).await,
    }
}

async fn update(
    cluster: &ManagedCluster,
    id: &ClusterId,
    generation: i64,
    provider: &dyn ClusterProvider,
    ctx: &Context,
) -> Result<Action, ReconcileError> {
    let request = cluster.update_request(id.clone());

    match provider.update(&request).await {
        Ok(outcome) if outcome.no_op => {
            ctx.resources.observe_generation(id, generation).await?;
            Ok(Action::requeue(ctx.requeue.running))
        }
        Ok(outcome) => {
            info!(cluster = %id, summary = %outcome.result.summary(), "Cluster updated");
            ctx.resources
                .record_operation(
                    id,
                    &OperationRecord::now("update", outcome.result.clone()),
                    Some(generation),
                )
                .await?;
            emit(cluster, EnvironmentEvent::Modified, &outcome.result, ctx).await;
            Ok(Action::requeue(ctx.requeue.running))
        }
        // a partial update leaves the generation unobserved so it is retried
        Err(e) => handle_failure(ctx, id, "update", ClusterState::Running, e, None).await,
    }
}

async fn handle_deletion(
    cluster: &ManagedCluster,
    id: &ClusterId,
    ctx: &Context,
) -> Result<Action, ReconcileError> {
    if !has_finalizer(cluster) {
        return Ok(Action::await_change());
    }

    let Some(mut record) = ctx.store.load(id).await? else {
        return Ok(Action::await_change());
    };

    match record.state {
        ClusterState::Requested | ClusterState::Deleted => {
            info!(cluster = %id, "Nothing provisioned, releasing ManagedCluster");
            ctx.resources.remove_finalizer(id).await?;
            return Ok(Action::await_change());
        }
        state if state.is_in_progress() => {
            warn!(cluster = %id, phase = %state, "Deleting cluster with interrupted operation");
            record.state = state.transition(id.as_str(), ClusterState::Failed)?;
            record.status_message = format!("{} was interrupted before completion", state);
            ctx.store
                .update_status(id, record.state, &record.status_message)
                .await?;
        }
        _ => {}
    }

    let provider = ctx.registry.get(record.cloud)?;
    match provider.delete(&mut record).await {
        Ok(result) => {
            info!(cluster = %id, summary = %result.summary(), "Cluster torn down");
            emit(cluster, EnvironmentEvent::Deleted, &result, ctx).await;
            Ok(Action::await_change())
        }
        Err(e) => handle_failure(ctx, id, "delete", record.state, e, None).await,
    }
}

/// Map a failed lifecycle call onto status and requeue
///
/// - pipeline failures record the ledger and retry after the failed interval
/// - caller errors are reported in the status and wait for a spec change
/// - everything else goes to the error policy
async fn handle_failure(
    ctx: &Context,
    id: &ClusterId,
    operation: &str,
    state: ClusterState,
    error: LifecycleError,
    observed_generation: Option<i64>,
) -> Result<Action, ReconcileError> {
    if let LifecycleError::Pipeline { result, .. } = &error {
        warn!(cluster = %id, operation, summary = %result.summary(), "Lifecycle operation failed");
        ctx.resources
            .record_operation(
                id,
                &OperationRecord::now(operation, result.clone()),
                observed_generation,
            )
            .await?;
        return Ok(Action::requeue(ctx.requeue.failed));
    }

    if error.is_caller_error() {
        return reject(ctx, id, state, &error).await;
    }

    Err(error.into())
}

async fn reject(
    ctx: &Context,
    id: &ClusterId,
    state: ClusterState,
    error: &LifecycleError,
) -> Result<Action, ReconcileError> {
    warn!(cluster = %id, error = %error, "Request rejected");
    ctx.store
        .update_status(id, state, &error.to_string())
        .await?;
    Ok(Action::await_change())
}

async fn emit(
    cluster: &ManagedCluster,
    kind: EnvironmentEvent,
    result: &PipelineResult,
    ctx: &Context,
) {
    if let Err(e) = emit_environment_event(cluster, kind, result, &ctx.cdevents_sink).await {
        warn!(error = %e, event = kind.as_str(), "Failed to emit CDEvent");
    }
}

#[cfg(test)]
#[path = "reconcile_test.rs"]
mod tests;
