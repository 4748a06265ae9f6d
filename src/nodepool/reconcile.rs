//! Node pool reconciliation
//!
//! Joins the desired pool set with the persisted one by name and classifies
//! each pool. Immutable attributes of existing pools are taken from the live
//! infrastructure, never from the caller.

use super::{
    DesiredPools, LiveDescriptions, LivePoolDescription, NodePoolCurrent, NodePoolSpec,
    PoolDefaults, ReconciledPool,
};
use crate::error::ValidationError;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Compute the create / update / delete classification
///
/// # Arguments
/// * `desired` - Pools requested by the caller, keyed by name
/// * `current` - Persisted pools of the cluster
/// * `live` - Live descriptions of existing pools, keyed by name
/// * `defaults` - Defaults applied to new pools
///
/// # Returns
/// Creates, then updates, then deletes, each sorted by name.
///
/// # Errors
/// A [`ValidationError`] when a new pool lacks an instance type or image, or
/// an autoscaled pool lacks consistent bounds. Nothing is emitted in that case.
pub fn reconcile_node_pools(
    desired: &DesiredPools,
    current: &[NodePoolCurrent],
    live: &LiveDescriptions,
    defaults: &PoolDefaults,
) -> Result<Vec<ReconciledPool>, ValidationError> {
    let current_by_name: BTreeMap<&str, &NodePoolCurrent> =
        current.iter().map(|p| (p.name.as_str(), p)).collect();

    let mut creates = Vec::new();
    let mut updates = Vec::new();

    for (name, requested) in desired {
        validate_autoscaling(name, requested)?;

        match current_by_name.get(name.as_str()) {
            Some(existing) => {
                debug!(pool = %name, "Node pool exists, will be updated");
                updates.push(reconcile_existing(name, existing, requested, live.get(name)));
            }
            None => {
                debug!(pool = %name, "Node pool does not exist, will be created");
                creates.push(reconcile_new(name, requested, defaults)?);
            }
        }
    }

    let deletes = current_by_name
        .iter()
        .filter(|(name, _)| !desired.contains_key(**name))
        .map(|(name, existing)| ReconciledPool::Delete {
            name: name.to_string(),
            identity: existing.identity.clone(),
        })
        .collect::<Vec<_>>();

    info!(
        create = creates.len(),
        update = updates.len(),
        delete = deletes.len(),
        "Node pools reconciled"
    );

    Ok(creates.into_iter().chain(updates).chain(deletes).collect())
}

fn reconcile_existing(
    name: &str,
    existing: &NodePoolCurrent,
    requested: &NodePoolSpec,
    live: Option<&LivePoolDescription>,
) -> ReconciledPool {
    // immutable attributes start from what was persisted
    let mut spec = NodePoolSpec {
        instance_type: existing.spec.instance_type.clone(),
        image: existing.spec.image.clone(),
        spot_price: existing.spec.spot_price.clone(),
        count: requested.count,
        autoscaling: requested.autoscaling,
        min_count: requested.min_count,
        max_count: requested.max_count,
    };

    if let Some(live) = live {
        if let Some(instance_type) = &live.instance_type {
            spec.instance_type = instance_type.clone();
        }
        if let Some(image) = &live.image {
            spec.image = image.clone();
        }
        if let Some(spot_price) = &live.spot_price {
            spec.spot_price = Some(spot_price.clone());
        }
        if spec.autoscaling {
            // keep organic scaling decisions instead of the caller's count
            if let Some(observed) = live.observed_capacity {
                spec.count = observed;
            }
        }
    }

    if spec.autoscaling {
        spec.count = clamp_count(&spec);
        debug!(pool = %name, count = spec.count, "Autoscaled node pool capacity");
    }

    ReconciledPool::Update {
        name: name.to_string(),
        identity: existing.identity.clone(),
        spec,
    }
}

fn reconcile_new(
    name: &str,
    requested: &NodePoolSpec,
    defaults: &PoolDefaults,
) -> Result<ReconciledPool, ValidationError> {
    if requested.instance_type.is_empty() {
        return Err(ValidationError::MissingInstanceType {
            pool: name.to_string(),
        });
    }
    if requested.image.is_empty() {
        return Err(ValidationError::MissingImage {
            pool: name.to_string(),
        });
    }

    let mut spec = requested.clone();
    if spec.spot_price.as_deref().map_or(true, str::is_empty) {
        spec.spot_price = Some(defaults.spot_price.clone());
    }
    if spec.autoscaling {
        spec.count = clamp_count(&spec);
    }

    Ok(ReconciledPool::Create {
        name: name.to_string(),
        spec,
    })
}

fn validate_autoscaling(name: &str, spec: &NodePoolSpec) -> Result<(), ValidationError> {
    if !spec.autoscaling {
        return Ok(());
    }
    match (spec.min_count, spec.max_count) {
        (Some(min), Some(max)) if min > max => Err(ValidationError::InvalidAutoscalingBounds {
            pool: name.to_string(),
            min,
            max,
        }),
        (Some(_), Some(_)) => Ok(()),
        _ => Err(ValidationError::MissingAutoscalingBounds {
            pool: name.to_string(),
        }),
    }
}

/// Clamp into `[min_count, max_count]`; bounds are validated beforehand
fn clamp_count(spec: &NodePoolSpec) -> u32 {
    let min = spec.min_count.unwrap_or(0);
    let max = spec.max_count.unwrap_or(u32::MAX);
    spec.count.clamp(min, max)
}

/// Fill caller omissions the way new pools are filled on create
///
/// An empty spot price gets the default bid and an empty image the
/// location's default image. Applied to update requests before the equality
/// check, so resubmitting a create request compares equal to the stored
/// cluster.
pub fn apply_update_defaults(pools: &mut DesiredPools, location: &str, defaults: &PoolDefaults) {
    let default_image = defaults.images.get(location);
    for pool in pools.values_mut() {
        if pool.spot_price.as_deref().map_or(true, str::is_empty) {
            pool.spot_price = Some(defaults.spot_price.clone());
        }
        if let Some(image) = default_image {
            if pool.image.is_empty() {
                pool.image = image.clone();
            }
        }
    }
}

#[cfg(test)]
#[path = "reconcile_test.rs"]
mod tests;
