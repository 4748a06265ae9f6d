//! Prometheus metrics for the provisio operator
//!
//! - Reconciliation counts
//! - Lifecycle operations by result and pipeline duration
//! - Step outcomes and rollbacks

use crate::pipeline::PipelineResult;
use prometheus::{
    self, Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

/// Operator metrics registry
///
/// Clone is cheap (metric handles are reference counted).
#[derive(Clone)]
pub struct ControllerMetrics {
    registry: Registry,
    /// Reconciliations by result (success, error)
    pub reconciliations_total: IntCounterVec,
    /// Lifecycle operations by operation (create, update, delete) and result
    pub operations_total: IntCounterVec,
    /// Wall time of pipeline runs in seconds
    pub pipeline_duration_seconds: HistogramVec,
    /// Ledger entries by phase (forward, compensation) and outcome
    pub step_outcomes_total: IntCounterVec,
    /// Pipelines that invoked rollback
    pub rollbacks_total: IntCounterVec,
    /// Failed record writes after a failed operation
    pub persistence_failures_total: IntCounterVec,
}

impl ControllerMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let reconciliations_total = IntCounterVec::new(
            Opts::new(
                "provisio_reconciliations_total",
                "Total number of ManagedCluster reconciliations",
            ),
            &["result"],
        )?;
        registry.register(Box::new(reconciliations_total.clone()))?;

        let operations_total = IntCounterVec::new(
            Opts::new(
                "provisio_operations_total",
                "Total number of cluster lifecycle operations",
            ),
            &["operation", "result"], // result: success, failure, noop
        )?;
        registry.register(Box::new(operations_total.clone()))?;

        // provisioning steps take minutes, buckets go up to an hour
        let pipeline_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "provisio_pipeline_duration_seconds",
                "Duration of provisioning pipelines in seconds",
            )
            .buckets(vec![1.0, 5.0, 30.0, 60.0, 300.0, 600.0, 1200.0, 3600.0]),
            &["operation"],
        )?;
        registry.register(Box::new(pipeline_duration_seconds.clone()))?;

        let step_outcomes_total = IntCounterVec::new(
            Opts::new(
                "provisio_step_outcomes_total",
                "Pipeline step operations by phase and outcome",
            ),
            &["phase", "outcome"],
        )?;
        registry.register(Box::new(step_outcomes_total.clone()))?;

        let rollbacks_total = IntCounterVec::new(
            Opts::new(
                "provisio_rollbacks_total",
                "Number of pipelines that rolled back",
            ),
            &["operation"],
        )?;
        registry.register(Box::new(rollbacks_total.clone()))?;

        let persistence_failures_total = IntCounterVec::new(
            Opts::new(
                "provisio_persistence_failures_total",
                "Cluster records that could not be written after a failed operation",
            ),
            &["operation"],
        )?;
        registry.register(Box::new(persistence_failures_total.clone()))?;

        Ok(Self {
            registry,
            reconciliations_total,
            operations_total,
            pipeline_duration_seconds,
            step_outcomes_total,
            rollbacks_total,
            persistence_failures_total,
        })
    }

    pub fn record_reconciliation_success(&self) {
        self.reconciliations_total
            .with_label_values(&["success"])
            .inc();
    }

    pub fn record_reconciliation_error(&self) {
        self.reconciliations_total
            .with_label_values(&["error"])
            .inc();
    }

    /// Record a terminated pipeline run and its ledger
    pub fn record_pipeline(&self, operation: &str, result: &PipelineResult, duration_secs: f64) {
        self.pipeline_duration_seconds
            .with_label_values(&[operation])
            .observe(duration_secs);

        for record in &result.records {
            let phase = serde_label(&record.phase);
            let outcome = serde_label(&record.outcome);
            self.step_outcomes_total
                .with_label_values(&[phase.as_str(), outcome.as_str()])
                .inc();
        }

        if result.rolled_back {
            self.rollbacks_total.with_label_values(&[operation]).inc();
        }

        let outcome = if result.succeeded() {
            "success"
        } else {
            "failure"
        };
        self.record_operation(operation, outcome);
    }

    /// Record an operation outcome that ran no pipeline (no-op update, early error)
    pub fn record_operation(&self, operation: &str, result: &str) {
        self.operations_total
            .with_label_values(&[operation, result])
            .inc();
    }

    pub fn record_persistence_failure(&self, operation: &str) {
        self.persistence_failures_total
            .with_label_values(&[operation])
            .inc();
    }

    /// Encode all metrics to Prometheus text format
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| {
            prometheus::Error::Msg(format!("Failed to encode metrics as UTF-8: {}", e))
        })
    }
}

/// Label value from a unit enum's serde name
fn serde_label<T: serde::Serialize>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => s,
        _ => "unknown".to_string(),
    }
}

/// Shared metrics handle for use across the operator
pub type SharedMetrics = Arc<ControllerMetrics>;

pub fn create_metrics() -> Result<SharedMetrics, prometheus::Error> {
    Ok(Arc::new(ControllerMetrics::new()?))
}
