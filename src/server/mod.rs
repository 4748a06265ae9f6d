//! HTTP surface of the operator
//!
//! - `/healthz` and `/readyz` for Kubernetes probes
//! - `/metrics` for Prometheus

mod health;
pub mod metrics;

pub use health::{run_health_server, ReadinessState};
pub use metrics::{create_metrics, ControllerMetrics, SharedMetrics};

#[cfg(test)]
#[path = "health_test.rs"]
mod tests;

#[cfg(test)]
#[path = "metrics_test.rs"]
mod metrics_tests;
