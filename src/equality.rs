//! Update no-op detection
//!
//! Projects a stored cluster into the shape of an update request and compares
//! the two structurally. Server-managed fields (pool ids, creators,
//! timestamps) are not part of the projection.

use crate::error::LifecycleError;
use crate::model::{ClusterSpec, UpdateClusterRequest};
use crate::nodepool::DesiredPools;

/// Desired-shape view of the stored active pools
pub fn project_pools(cluster: &ClusterSpec) -> DesiredPools {
    cluster
        .active_pools()
        .map(|pool| (pool.name.clone(), pool.spec.clone()))
        .collect()
}

/// Whether `request` would leave `stored` unchanged
///
/// A stored record with pools still pending deletion is never equal to a
/// request: the outstanding deletions have to run.
///
/// # Errors
/// [`LifecycleError::ProviderMismatch`] when the request targets a different
/// cloud than the one managing the stored cluster.
pub fn is_noop_update(
    request: &UpdateClusterRequest,
    stored: &ClusterSpec,
) -> Result<bool, LifecycleError> {
    if request.cloud != stored.cloud {
        return Err(LifecycleError::ProviderMismatch {
            requested: request.cloud,
            stored: stored.cloud,
        });
    }

    if stored.node_pools.iter().any(|p| p.marked_for_deletion) {
        return Ok(false);
    }

    Ok(request.node_pools == project_pools(stored))
}

#[cfg(test)]
#[path = "equality_test.rs"]
mod tests;
