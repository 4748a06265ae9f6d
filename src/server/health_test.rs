//! Tests for the probe and metrics endpoints

#![allow(clippy::expect_used)] // Tests can use expect for better error messages

use super::*;
use crate::pipeline::{PipelineResult, StepPhase, StepRecord};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Start a server on `port` and wait until it answers
///
/// Retries with exponential backoff instead of a fixed sleep.
async fn start(
    port: u16,
    readiness: ReadinessState,
    metrics: SharedMetrics,
) -> (reqwest::Client, JoinHandle<Result<(), std::io::Error>>) {
    let handle = tokio::spawn(run_health_server(port, readiness, metrics));
    let client = reqwest::Client::new();
    let mut delay = Duration::from_millis(10);

    for attempt in 1..=10 {
        match client
            .get(format!("http://127.0.0.1:{}/healthz", port))
            .timeout(Duration::from_millis(100))
            .send()
            .await
        {
            Ok(_) => return (client, handle),
            Err(_) if attempt < 10 => {
                tokio::time::sleep(delay).await;
                delay = std::cmp::min(delay * 2, Duration::from_millis(200));
            }
            Err(e) => panic!("Server not ready after {} attempts: {}", attempt, e),
        }
    }
    (client, handle)
}

async fn get(client: &reqwest::Client, port: u16, path: &str) -> reqwest::Response {
    client
        .get(format!("http://127.0.0.1:{}{}", port, path))
        .timeout(Duration::from_secs(5))
        .send()
        .await
        .expect("Failed to connect to health server")
}

#[tokio::test]
async fn test_healthz_returns_200() {
    let port = 18180;
    let (client, handle) = start(
        port,
        ReadinessState::new(),
        create_metrics().expect("create metrics"),
    )
    .await;

    let response = get(&client, port, "/healthz").await;

    assert_eq!(response.status(), 200, "Liveness probe should return 200");
    handle.abort();
}

#[tokio::test]
async fn test_readyz_follows_readiness_state() {
    // ARRANGE: not ready by default
    let port = 18181;
    let readiness = ReadinessState::new();
    let (client, handle) = start(
        port,
        readiness.clone(),
        create_metrics().expect("create metrics"),
    )
    .await;

    // ACT
    let before = get(&client, port, "/readyz").await.status();
    readiness.set_ready();
    let after = get(&client, port, "/readyz").await.status();

    // ASSERT
    assert_eq!(before, 503, "Readiness probe should return 503 when not ready");
    assert_eq!(after, 200, "Readiness probe should return 200 when ready");
    handle.abort();
}

#[test]
fn test_readiness_state_is_shared_by_clones() {
    let state = ReadinessState::new();
    let cloned = state.clone();
    assert!(!cloned.is_ready());

    state.set_ready();

    assert!(cloned.is_ready());
}

#[tokio::test]
async fn test_metrics_returns_prometheus_format() {
    // ARRANGE: record something so the families are exported
    let port = 18182;
    let metrics = create_metrics().expect("create metrics");
    metrics.record_reconciliation_success();
    metrics.record_pipeline(
        "create",
        &PipelineResult {
            records: vec![StepRecord::succeeded("create-vcn", StepPhase::Forward)],
            rolled_back: false,
        },
        3.0,
    );
    let (client, handle) = start(port, ReadinessState::new(), metrics.clone()).await;

    // ACT
    let response = get(&client, port, "/metrics").await;

    // ASSERT
    assert_eq!(response.status(), 200, "Metrics should return 200");
    let content_type = response
        .headers()
        .get("content-type")
        .expect("should have content-type")
        .to_str()
        .expect("content-type should be string")
        .to_string();
    assert!(content_type.contains("text/plain"));

    let body = response.text().await.expect("should have body");
    assert!(body.contains("provisio_reconciliations_total"));
    assert!(body.contains("provisio_pipeline_duration_seconds"));
    assert!(body.contains("provisio_operations_total{operation=\"create\",result=\"success\"} 1"));
    handle.abort();
}
