//! Node pool model, reconciliation and placement
//!
//! - [`reconcile`]: classify desired vs. persisted pools into create / update / delete
//! - [`distribute`]: spread a pool's instances over worker subnets

pub mod distribute;
pub mod reconcile;

pub use distribute::{distribute, place, Allocation, SubnetId};
pub use reconcile::{apply_update_defaults, reconcile_node_pools};

use crate::model::ClusterId;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Spot price applied to new pools that do not set one
pub const DEFAULT_SPOT_PRICE: &str = "0.0";

/// Caller-supplied shape of a node pool
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodePoolSpec {
    /// Machine type; immutable once the pool exists
    #[serde(default)]
    pub instance_type: String,

    /// Node image; immutable once the pool exists
    #[serde(default)]
    pub image: String,

    /// Maximum spot bid; immutable once the pool exists
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spot_price: Option<String>,

    /// Desired number of nodes
    #[serde(default)]
    pub count: u32,

    #[serde(default)]
    pub autoscaling: bool,

    /// Lower autoscaling bound, required when autoscaling
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_count: Option<u32>,

    /// Upper autoscaling bound, required when autoscaling
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_count: Option<u32>,
}

/// Desired pools keyed by name; names are unique by construction
pub type DesiredPools = BTreeMap<String, NodePoolSpec>;

/// Identity assigned when a pool record is first persisted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodePoolIdentity {
    pub id: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub cluster_id: ClusterId,
}

impl NodePoolIdentity {
    /// Fresh identity for a pool created now
    pub fn assign(cluster_id: &ClusterId, created_by: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            created_by: created_by.to_string(),
            created_at: Utc::now(),
            cluster_id: cluster_id.clone(),
        }
    }
}

/// Previously reconciled and persisted pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodePoolCurrent {
    pub name: String,
    pub identity: NodePoolIdentity,
    pub spec: NodePoolSpec,
    pub marked_for_deletion: bool,
}

/// Authoritative attributes observed on the live pool infrastructure
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LivePoolDescription {
    #[serde(default)]
    pub instance_type: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub spot_price: Option<String>,
    /// Capacity currently requested by the pool's autoscaler
    #[serde(default)]
    pub observed_capacity: Option<u32>,
}

/// Live descriptions keyed by pool name; missing means "not found"
pub type LiveDescriptions = BTreeMap<String, LivePoolDescription>;

/// Defaults filled into caller input
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolDefaults {
    pub spot_price: String,
    /// Default node image per location
    pub images: BTreeMap<String, String>,
}

impl Default for PoolDefaults {
    fn default() -> Self {
        Self {
            spot_price: DEFAULT_SPOT_PRICE.to_string(),
            images: BTreeMap::new(),
        }
    }
}

/// Classified work item for one pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconciledPool {
    /// New pool; identity is assigned when it is persisted
    Create { name: String, spec: NodePoolSpec },
    /// Existing pool, updated in place
    Update {
        name: String,
        identity: NodePoolIdentity,
        spec: NodePoolSpec,
    },
    /// Existing pool absent from the desired set
    Delete {
        name: String,
        identity: NodePoolIdentity,
    },
}

impl ReconciledPool {
    pub fn name(&self) -> &str {
        match self {
            ReconciledPool::Create { name, .. }
            | ReconciledPool::Update { name, .. }
            | ReconciledPool::Delete { name, .. } => name,
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, ReconciledPool::Delete { .. })
    }

    /// Target spec, `None` for deletions
    pub fn spec(&self) -> Option<&NodePoolSpec> {
        match self {
            ReconciledPool::Create { spec, .. } | ReconciledPool::Update { spec, .. } => Some(spec),
            ReconciledPool::Delete { .. } => None,
        }
    }

    pub fn identity(&self) -> Option<&NodePoolIdentity> {
        match self {
            ReconciledPool::Update { identity, .. } | ReconciledPool::Delete { identity, .. } => {
                Some(identity)
            }
            ReconciledPool::Create { .. } => None,
        }
    }

    /// Whether applying this item changes anything relative to `current`
    ///
    /// Creates and deletes always do. An update is a no-op when the
    /// reconciled spec equals the persisted one and the pool is not pending
    /// deletion.
    pub fn requires_work(&self, current: &[NodePoolCurrent]) -> bool {
        match self {
            ReconciledPool::Update { name, spec, .. } => !current
                .iter()
                .any(|p| &p.name == name && &p.spec == spec && !p.marked_for_deletion),
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn current(name: &str, spec: NodePoolSpec) -> NodePoolCurrent {
        NodePoolCurrent {
            name: name.to_string(),
            identity: NodePoolIdentity::assign(&ClusterId::new("default/c1"), "alice"),
            spec,
            marked_for_deletion: false,
        }
    }

    #[test]
    fn test_update_identical_to_persisted_requires_no_work() {
        let spec = NodePoolSpec {
            instance_type: "m5.large".to_string(),
            count: 3,
            ..Default::default()
        };
        let pool = current("pool1", spec.clone());
        let change = ReconciledPool::Update {
            name: "pool1".to_string(),
            identity: pool.identity.clone(),
            spec,
        };

        assert!(!change.requires_work(&[pool]));
    }

    #[test]
    fn test_update_with_new_count_requires_work() {
        let spec = NodePoolSpec {
            count: 3,
            ..Default::default()
        };
        let pool = current("pool1", spec.clone());
        let change = ReconciledPool::Update {
            name: "pool1".to_string(),
            identity: pool.identity.clone(),
            spec: NodePoolSpec { count: 4, ..spec },
        };

        assert!(change.requires_work(&[pool]));
    }

    #[test]
    fn test_node_pool_spec_deserializes_camel_case() {
        let yaml = r#"
instanceType: m5.xlarge
image: ami-123
count: 2
autoscaling: true
minCount: 1
maxCount: 4
"#;

        let spec: NodePoolSpec = serde_yaml::from_str(yaml).expect("valid pool spec");

        assert_eq!(spec.instance_type, "m5.xlarge");
        assert_eq!(spec.min_count, Some(1));
        assert_eq!(spec.max_count, Some(4));
        assert_eq!(spec.spot_price, None);
    }
}
