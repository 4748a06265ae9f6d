//! CDEvents emission for cluster lifecycle observability
//!
//! A provisioned cluster is a CDEvents *environment*:
//!
//! | Lifecycle outcome | Event |
//! |---|---|
//! | create succeeded | `environment.created` |
//! | update applied changes | `environment.modified` |
//! | delete succeeded | `environment.deleted` |
//!
//! The pipeline ledger of the operation travels in the custom data.

use crate::crd::ManagedCluster;
use crate::pipeline::PipelineResult;
use cloudevents::Event;
use kube::ResourceExt;
use serde_json::json;
use std::fmt::Display;
use thiserror::Error;

#[cfg(test)]
use std::sync::{Arc, Mutex};

const EVENT_SOURCE: &str = "https://provisio.dev";
const SUBJECT_SOURCE: &str = "https://provisio.dev/controller";

#[derive(Debug, Error)]
pub enum CDEventsError {
    #[error("cdevents error: {0}")]
    Generic(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvironmentEvent {
    Created,
    Modified,
    Deleted,
}

impl EnvironmentEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvironmentEvent::Created => "created",
            EnvironmentEvent::Modified => "modified",
            EnvironmentEvent::Deleted => "deleted",
        }
    }
}

/// CDEvents sink for emitting events
pub struct CDEventsSink {
    #[cfg(not(test))]
    enabled: bool,
    #[cfg(not(test))]
    sink_url: Option<String>,
    #[cfg(not(test))]
    client: reqwest::Client,
    #[cfg(test)]
    mock_events: Arc<Mutex<Vec<Event>>>,
}

impl CDEventsSink {
    /// Create a sink posting CloudEvents to `sink_url`
    ///
    /// Nothing is sent unless `enabled` is set and a URL is configured.
    #[cfg(not(test))]
    pub fn new(enabled: bool, sink_url: Option<String>) -> Self {
        CDEventsSink {
            enabled,
            sink_url,
            client: reqwest::Client::new(),
        }
    }

    #[cfg(test)]
    pub fn new_mock() -> Self {
        CDEventsSink {
            mock_events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    #[cfg(test)]
    #[allow(clippy::unwrap_used)] // Test helper can use unwrap
    pub fn get_emitted_events(&self) -> Vec<Event> {
        self.mock_events.lock().unwrap().clone()
    }

    #[cfg(test)]
    #[allow(clippy::unwrap_used)] // Test helper can use unwrap
    async fn send_event(&self, event: &Event) -> Result<(), CDEventsError> {
        self.mock_events.lock().unwrap().push(event.clone());
        Ok(())
    }

    /// Send CloudEvent to HTTP sink (production mode)
    #[cfg(not(test))]
    async fn send_event(&self, event: &Event) -> Result<(), CDEventsError> {
        if !self.enabled {
            return Ok(());
        }

        let Some(url) = &self.sink_url else {
            return Ok(());
        };

        let response = self
            .client
            .post(url)
            .header("Content-Type", "application/cloudevents+json")
            .json(event)
            .send()
            .await
            .map_err(|e| CDEventsError::Generic(format!("HTTP POST failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(CDEventsError::Generic(format!(
                "sink returned status {}",
                response.status()
            )));
        }

        Ok(())
    }
}

/// Emit the environment event for a finished lifecycle operation
pub async fn emit_environment_event(
    cluster: &ManagedCluster,
    kind: EnvironmentEvent,
    result: &PipelineResult,
    sink: &CDEventsSink,
) -> Result<(), CDEventsError> {
    let event = build_environment_event(cluster, kind, result)?;
    sink.send_event(&event).await
}

fn convert<T, S>(value: S, what: &str) -> Result<T, CDEventsError>
where
    S: TryInto<T>,
    S::Error: Display,
{
    value
        .try_into()
        .map_err(|e| CDEventsError::Generic(format!("Invalid {}: {}", what, e)))
}

fn build_environment_event(
    cluster: &ManagedCluster,
    kind: EnvironmentEvent,
    result: &PipelineResult,
) -> Result<Event, CDEventsError> {
    use cdevents_sdk::latest::{environment_created, environment_deleted, environment_modified};
    use cdevents_sdk::{CDEvent, Subject};

    let namespace = cluster
        .metadata
        .namespace
        .as_ref()
        .ok_or_else(|| CDEventsError::Generic("ManagedCluster missing namespace".to_string()))?;
    let name = cluster.name_any();
    let url = format!(
        "/apis/provisio.dev/v1alpha1/namespaces/{}/managedclusters/{}",
        namespace, name
    );

    let subject = match kind {
        EnvironmentEvent::Created => Subject::from(environment_created::Content {
            name: Some(convert(name.clone(), "environment name")?),
            url: Some(convert(url, "environment url")?),
        }),
        EnvironmentEvent::Modified => Subject::from(environment_modified::Content {
            name: Some(convert(name.clone(), "environment name")?),
            url: Some(convert(url, "environment url")?),
        }),
        EnvironmentEvent::Deleted => Subject::from(environment_deleted::Content {
            name: Some(convert(name.clone(), "environment name")?),
        }),
    };

    let cdevent = CDEvent::from(
        subject
            .with_id(convert(
                format!("/managedclusters/{}/{}", namespace, name),
                "subject id",
            )?)
            .with_source(convert(SUBJECT_SOURCE, "subject source")?),
    )
    .with_id(convert(uuid::Uuid::new_v4().to_string(), "event id")?)
    .with_source(convert(EVENT_SOURCE, "event source")?)
    .with_custom_data(build_custom_data(cluster, kind, result));

    cdevent
        .try_into()
        .map_err(|e| CDEventsError::Generic(format!("Failed to convert to CloudEvent: {}", e)))
}

fn build_custom_data(
    cluster: &ManagedCluster,
    kind: EnvironmentEvent,
    result: &PipelineResult,
) -> serde_json::Value {
    json!({
        "provisio": {
            "version": "v1",
            "cluster": cluster.name_any(),
            "cloud": cluster.spec.cloud,
            "location": cluster.spec.location,
            "organization": cluster.spec.organization,
            "transition": kind.as_str(),
            "nodePools": cluster.spec.node_pools.keys().collect::<Vec<_>>(),
            "completedSteps": result.completed_steps(),
        }
    })
}

#[cfg(test)]
#[path = "cdevents_test.rs"]
mod tests;
