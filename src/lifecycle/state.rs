//! Per-cluster lifecycle state machine
//!
//! ```text
//! Requested → Creating → Running ⇄ Updating
//!                 │         │         │
//!                 ▼         ▼         ▼
//!               Failed → Deleting → Deleted
//! ```
//!
//! Creating, Updating and Deleting may fail; a failed cluster can only be
//! deleted.

use crate::error::LifecycleError;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
pub enum ClusterState {
    #[default]
    Requested,
    Creating,
    Running,
    Updating,
    Deleting,
    Deleted,
    Failed,
}

impl ClusterState {
    /// Whether moving from `self` to `to` is legal
    pub fn can_transition(self, to: ClusterState) -> bool {
        use ClusterState::*;
        matches!(
            (self, to),
            (Requested, Creating)
                | (Creating, Running)
                | (Creating, Failed)
                | (Running, Updating)
                | (Running, Deleting)
                | (Updating, Running)
                | (Updating, Failed)
                | (Deleting, Deleted)
                | (Deleting, Failed)
                | (Failed, Deleting)
        )
    }

    /// Checked transition
    ///
    /// # Errors
    /// [`LifecycleError::InvalidTransition`] for an illegal move.
    pub fn transition(self, cluster: &str, to: ClusterState) -> Result<ClusterState, LifecycleError> {
        if self.can_transition(to) {
            Ok(to)
        } else {
            Err(LifecycleError::InvalidTransition {
                cluster: cluster.to_string(),
                from: self,
                to,
            })
        }
    }

    /// A pipeline is expected to be running for the cluster
    pub fn is_in_progress(self) -> bool {
        matches!(
            self,
            ClusterState::Creating | ClusterState::Updating | ClusterState::Deleting
        )
    }

    /// Control plane not provisioned yet
    pub fn is_provisioning(self) -> bool {
        matches!(self, ClusterState::Requested | ClusterState::Creating)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ClusterState::Requested => "Requested",
            ClusterState::Creating => "Creating",
            ClusterState::Running => "Running",
            ClusterState::Updating => "Updating",
            ClusterState::Deleting => "Deleting",
            ClusterState::Deleted => "Deleted",
            ClusterState::Failed => "Failed",
        }
    }
}

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
