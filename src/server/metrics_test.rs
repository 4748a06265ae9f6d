//! Tests for operator metrics

use super::metrics::{create_metrics, ControllerMetrics};
use crate::error::StepError;
use crate::pipeline::{PipelineResult, StepPhase, StepRecord};

fn failed_create() -> PipelineResult {
    PipelineResult {
        records: vec![
            StepRecord::succeeded("create-network", StepPhase::Forward),
            StepRecord::failed(
                "create-control-plane",
                StepPhase::Forward,
                &StepError::Failed("quota exceeded".to_string()),
            ),
            StepRecord::succeeded("create-network", StepPhase::Compensation),
        ],
        rolled_back: true,
    }
}

#[test]
fn test_metrics_creation() {
    let metrics = ControllerMetrics::new().expect("should create metrics");

    // Prometheus only outputs metrics with values
    metrics.record_reconciliation_success();
    metrics.record_pipeline("create", &failed_create(), 12.0);

    let output = metrics.encode().expect("should encode metrics");
    assert!(output.contains("provisio_reconciliations_total"));
    assert!(output.contains("provisio_operations_total"));
    assert!(output.contains("provisio_pipeline_duration_seconds"));
    assert!(output.contains("provisio_step_outcomes_total"));
    assert!(output.contains("provisio_rollbacks_total"));
}

#[test]
fn test_record_pipeline_counts_ledger_entries() {
    let metrics = ControllerMetrics::new().expect("should create metrics");

    metrics.record_pipeline("create", &failed_create(), 42.0);

    let output = metrics.encode().expect("should encode metrics");
    assert!(output
        .contains("provisio_step_outcomes_total{outcome=\"succeeded\",phase=\"forward\"} 1"));
    assert!(output.contains("provisio_step_outcomes_total{outcome=\"failed\",phase=\"forward\"} 1"));
    assert!(output.contains(
        "provisio_step_outcomes_total{outcome=\"succeeded\",phase=\"compensation\"} 1"
    ));
    assert!(output.contains("provisio_rollbacks_total{operation=\"create\"} 1"));
    assert!(output.contains("provisio_operations_total{operation=\"create\",result=\"failure\"} 1"));
    assert!(output.contains("provisio_pipeline_duration_seconds_count{operation=\"create\"} 1"));
}

#[test]
fn test_successful_pipeline_is_not_a_rollback() {
    let metrics = ControllerMetrics::new().expect("should create metrics");
    let result = PipelineResult {
        records: vec![StepRecord::succeeded("delete-stack", StepPhase::Forward)],
        rolled_back: false,
    };

    metrics.record_pipeline("delete", &result, 3.0);

    let output = metrics.encode().expect("should encode metrics");
    assert!(output.contains("provisio_operations_total{operation=\"delete\",result=\"success\"} 1"));
    assert!(!output.contains("provisio_rollbacks_total{"));
}

#[test]
fn test_record_operation_without_pipeline() {
    let metrics = ControllerMetrics::new().expect("should create metrics");

    metrics.record_operation("update", "noop");
    metrics.record_operation("update", "noop");

    let output = metrics.encode().expect("should encode metrics");
    assert!(output.contains("provisio_operations_total{operation=\"update\",result=\"noop\"} 2"));
}

#[test]
fn test_reconciliation_error_counter() {
    let metrics = ControllerMetrics::new().expect("should create metrics");

    metrics.record_reconciliation_error();

    let output = metrics.encode().expect("should encode metrics");
    assert!(output.contains("provisio_reconciliations_total{result=\"error\"} 1"));
}

#[test]
fn test_create_metrics_returns_shared_handle() {
    let metrics = create_metrics().expect("should create shared metrics");
    let clone = metrics.clone();

    clone.record_reconciliation_success();

    let output = metrics.encode().expect("should encode metrics");
    assert!(output.contains("provisio_reconciliations_total{result=\"success\"} 1"));
}

#[test]
fn test_persistence_failure_counter() {
    let metrics = ControllerMetrics::new().expect("should create metrics");

    metrics.record_persistence_failure("delete");

    let output = metrics.encode().expect("should encode metrics");
    assert!(output.contains("provisio_persistence_failures_total{operation=\"delete\"} 1"));
}
