use futures::StreamExt;
use kube::runtime::{watcher, Controller};
use kube::{Api, Client};
use provisio::config::OperatorConfig;
use provisio::controller::cdevents::CDEventsSink;
use provisio::controller::{error_policy, reconcile, Context, KubeClusterStore, KubeSecretResolver};
use provisio::crd::ManagedCluster;
use provisio::error::CloudError;
use provisio::lifecycle::{ClusterStore, LifecycleController, ProviderRegistry, SecretResolver};
use provisio::pipeline::PipelineExecutor;
use provisio::providers::{AmazonBackend, HttpConnector, OracleBackend};
use provisio::server::{create_metrics, run_health_server, ReadinessState, SharedMetrics};
use std::sync::Arc;
use tokio::signal::{self, unix::SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn};

/// Executor template shared by every provider
///
/// Cancelling `shutdown` fails the running step of every pipeline, so
/// creates roll back instead of being killed mid-step.
pub fn pipeline_executor(config: &OperatorConfig, shutdown: CancellationToken) -> PipelineExecutor {
    let mut executor = PipelineExecutor::new(info_span!("pipeline")).with_cancellation(shutdown);
    if let Some(timeout) = config.step_timeout {
        executor = executor.with_step_timeout(timeout);
    }
    executor
}

/// One lifecycle controller per cloud, all talking to the same adapter service
pub fn build_registry(
    config: &OperatorConfig,
    store: Arc<dyn ClusterStore>,
    secrets: Arc<dyn SecretResolver>,
    metrics: SharedMetrics,
    shutdown: CancellationToken,
) -> Result<ProviderRegistry, CloudError> {
    let connector = Arc::new(HttpConnector::new(
        config.cloud_adapter_url.clone(),
        config.cloud_adapter_timeout,
    )?);

    let executor = pipeline_executor(config, shutdown);

    let amazon = LifecycleController::new(
        AmazonBackend::new(connector.clone()),
        store.clone(),
        secrets.clone(),
        info_span!("provider", cloud = "amazon"),
    )
    .with_executor(executor.clone())
    .with_defaults(config.pool_defaults())
    .with_metrics(metrics.clone());

    let oracle = LifecycleController::new(
        OracleBackend::new(connector),
        store,
        secrets,
        info_span!("provider", cloud = "oracle"),
    )
    .with_executor(executor)
    .with_defaults(config.pool_defaults())
    .with_metrics(metrics);

    Ok(ProviderRegistry::new()
        .register(Arc::new(amazon))
        .register(Arc::new(oracle)))
}

/// Cancel `token` on SIGINT or SIGTERM
async fn cancel_on_signal(token: CancellationToken) {
    let terminate = async {
        match signal::unix::signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = signal::ctrl_c() => {}
        _ = terminate => {}
    }
    info!("Shutdown signal received, cancelling running pipelines");
    token.cancel();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting provisio cluster provisioning operator");

    let config = OperatorConfig::from_env()?;
    let metrics = create_metrics()?;

    // Create readiness state (initially not ready)
    let readiness = ReadinessState::new();

    let health_readiness = readiness.clone();
    let health_metrics = metrics.clone();
    let health_port = config.health_port;
    tokio::spawn(async move {
        if let Err(e) = run_health_server(health_port, health_readiness, health_metrics).await {
            warn!(error = %e, "Health server failed");
        }
    });
    info!(port = health_port, "Health server task spawned");

    let client = match Client::try_default().await {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "Failed to create Kubernetes client");
            return Err(e.into());
        }
    };

    info!("Connected to Kubernetes cluster");

    let store = Arc::new(KubeClusterStore::new(client.clone()));
    let secrets = Arc::new(KubeSecretResolver::new(
        client.clone(),
        config.secret_namespace_prefix.clone(),
    ));

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    let registry = build_registry(
        &config,
        store.clone(),
        secrets,
        metrics.clone(),
        shutdown,
    )?;
    info!(
        clouds = ?registry.clouds(),
        adapter = %config.cloud_adapter_url,
        step_timeout = ?config.step_timeout,
        "Cluster providers registered"
    );

    let cdevents_sink = CDEventsSink::new(config.cdevents_enabled, config.cdevents_sink_url.clone());
    info!(enabled = config.cdevents_enabled, "CDEvents sink configured");

    let ctx = Arc::new(
        Context::new(
            registry,
            store.clone(),
            store,
            cdevents_sink,
            config.requeue.clone(),
        )
        .with_metrics(metrics),
    );

    // Mark as ready - controller is initialized and about to start
    readiness.set_ready();
    info!("Controller ready, starting reconciliation loop");

    let clusters = Api::<ManagedCluster>::all(client);

    // error_policy already logs errors with warn!, so only successes are logged here
    Controller::new(clusters, watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            if let Ok(o) = res {
                info!("Reconciled: {:?}", o);
            }
        })
        .await;

    info!("Controller stopped");
    Ok(())
}

#[cfg(test)]
#[path = "main_test.rs"]
mod tests;
