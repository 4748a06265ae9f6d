//! Error taxonomy for cluster provisioning
//!
//! Validation and configuration errors are raised before any infrastructure
//! is touched. Pipeline errors carry the full step ledger so callers can
//! report partial progress.

use crate::lifecycle::ClusterState;
use crate::model::{CloudProvider, ClusterId};
use crate::pipeline::{PipelineError, PipelineResult};
use std::time::Duration;
use thiserror::Error;

/// Caller input error on a node pool, never retried
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("instanceType is missing for node pool {pool}")]
    MissingInstanceType { pool: String },

    #[error("image is missing for node pool {pool}")]
    MissingImage { pool: String },

    #[error("node pool {pool} enables autoscaling but does not set minCount/maxCount")]
    MissingAutoscalingBounds { pool: String },

    #[error("node pool {pool} has minCount {min} greater than maxCount {max}")]
    InvalidAutoscalingBounds { pool: String, min: u32, max: u32 },
}

/// Topology the caller has to fix before provisioning can proceed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("node pool {pool} needs at least {required} worker subnets, {available} available")]
    InsufficientSubnets {
        pool: String,
        required: usize,
        available: usize,
    },

    #[error("node pool {pool} cannot be placed with a count of {count}")]
    Unplaceable { pool: String, count: u32 },

    #[error("{output} output not found on stack {stack}")]
    MissingStackOutput { stack: String, output: String },

    #[error("invalid network config: {0}")]
    InvalidNetwork(String),
}

/// Failure reported by a cloud adapter
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CloudError {
    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("cloud API error: {0}")]
    Api(String),

    #[error("cloud adapter transport error: {0}")]
    Transport(String),
}

impl CloudError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CloudError::NotFound(_))
    }
}

/// Why a single step's forward or compensating operation failed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StepError {
    #[error(transparent)]
    Cloud(#[from] CloudError),

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("step timed out after {0:?}")]
    TimedOut(Duration),

    #[error("pipeline cancelled")]
    Cancelled,

    #[error("{0}")]
    Failed(String),
}

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("secret {secret_id} not found for organization {organization}")]
    NotFound {
        organization: String,
        secret_id: String,
    },

    #[error("secret {secret_id} is missing key {key}")]
    MissingKey { secret_id: String, key: String },

    #[error("secret backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("stored record is invalid: {0}")]
    Corrupt(String),
}

/// Error returned by lifecycle operations
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("{error}")]
    Pipeline {
        result: PipelineResult,
        #[source]
        error: PipelineError,
    },

    #[error("cluster {cluster} is not ready: {reason}")]
    NotReady { cluster: String, reason: String },

    #[error("cluster {cluster} cannot move from {from} to {to}")]
    InvalidTransition {
        cluster: String,
        from: ClusterState,
        to: ClusterState,
    },

    #[error("cluster {0} not found")]
    NotFound(ClusterId),

    #[error("request targets {requested} but cluster is managed by {stored}")]
    ProviderMismatch {
        requested: CloudProvider,
        stored: CloudProvider,
    },

    #[error("no provider registered for cloud {0}")]
    UnsupportedProvider(CloudProvider),

    #[error("failed to resolve credentials: {0}")]
    Credentials(#[from] SecretError),

    #[error("persistence error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Cloud(#[from] CloudError),
}

impl LifecycleError {
    /// Pipeline ledger attached to the error, if a pipeline ran
    pub fn pipeline_result(&self) -> Option<&PipelineResult> {
        match self {
            LifecycleError::Pipeline { result, .. } => Some(result),
            _ => None,
        }
    }

    /// Errors the caller has to fix; retrying the same request cannot succeed
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            LifecycleError::Validation(_)
                | LifecycleError::Configuration(_)
                | LifecycleError::ProviderMismatch { .. }
                | LifecycleError::UnsupportedProvider(_)
        )
    }
}
