//! Instance placement across worker subnets
//!
//! Spreads a pool evenly over 3, 2 or 1 subnets, preferring the widest even
//! split. Placement needs at least three worker subnets to exist.

use crate::error::ConfigurationError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Worker subnets the placement logic needs to be available
pub const MIN_WORKER_SUBNETS: usize = 3;

/// Opaque worker subnet identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubnetId(pub String);

impl SubnetId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for SubnetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Nodes per subnet and the chosen subnets
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Allocation {
    pub per_subnet: u32,
    pub subnets: Vec<SubnetId>,
}

impl Allocation {
    /// Empty result: the pool cannot be placed
    pub fn is_empty(&self) -> bool {
        self.per_subnet == 0 && self.subnets.is_empty()
    }

    /// Nodes placed in total
    pub fn total(&self) -> u32 {
        self.per_subnet * self.subnets.len() as u32
    }
}

/// Compute the per-subnet split of `count` nodes
///
/// Returns an empty allocation when `count` is zero or fewer than
/// [`MIN_WORKER_SUBNETS`] subnets are given. Otherwise the first 3 subnets
/// are used if `count` divides by 3, the first 2 if it divides by 2, and
/// the first one with the whole count otherwise.
pub fn distribute(count: u32, subnets: &[SubnetId]) -> Allocation {
    if count == 0 || subnets.len() < MIN_WORKER_SUBNETS {
        return Allocation::default();
    }

    let width = if count % 3 == 0 {
        3
    } else if count % 2 == 0 {
        2
    } else {
        1
    };

    Allocation {
        per_subnet: count / width as u32,
        subnets: subnets[..width].to_vec(),
    }
}

/// Like [`distribute`], but an empty allocation is a configuration error
pub fn place(pool: &str, count: u32, subnets: &[SubnetId]) -> Result<Allocation, ConfigurationError> {
    if count > 0 && subnets.len() < MIN_WORKER_SUBNETS {
        return Err(ConfigurationError::InsufficientSubnets {
            pool: pool.to_string(),
            required: MIN_WORKER_SUBNETS,
            available: subnets.len(),
        });
    }

    let allocation = distribute(count, subnets);
    if allocation.is_empty() {
        return Err(ConfigurationError::Unplaceable {
            pool: pool.to_string(),
            count,
        });
    }
    Ok(allocation)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subnets(n: usize) -> Vec<SubnetId> {
        (1..=n).map(|i| SubnetId::new(format!("s{}", i))).collect()
    }

    #[test]
    fn test_divisible_by_three_spreads_over_three_subnets() {
        let allocation = distribute(12, &subnets(5));

        assert_eq!(allocation.per_subnet, 4);
        assert_eq!(allocation.subnets, subnets(3));
        assert_eq!(allocation.total(), 12);
    }

    #[test]
    fn test_divisible_by_two_spreads_over_two_subnets() {
        let allocation = distribute(10, &subnets(4));

        assert_eq!(allocation.per_subnet, 5);
        assert_eq!(allocation.subnets, subnets(2));
    }

    #[test]
    fn test_prime_count_lands_in_first_subnet() {
        let allocation = distribute(7, &subnets(3));

        assert_eq!(allocation.per_subnet, 7);
        assert_eq!(allocation.subnets, subnets(1));
    }

    #[test]
    fn test_six_prefers_three_way_split() {
        let allocation = distribute(6, &subnets(3));

        assert_eq!(allocation.per_subnet, 2);
        assert_eq!(allocation.subnets.len(), 3);
    }

    #[test]
    fn test_too_few_subnets_yields_empty_allocation() {
        let allocation = distribute(5, &subnets(2));

        assert!(allocation.is_empty());
        assert_eq!(allocation.total(), 0);
    }

    #[test]
    fn test_zero_count_yields_empty_allocation() {
        assert!(distribute(0, &subnets(3)).is_empty());
    }

    #[test]
    fn test_place_reports_insufficient_subnets() {
        let err = place("workers", 5, &subnets(2)).unwrap_err();

        assert!(matches!(
            err,
            ConfigurationError::InsufficientSubnets {
                required: 3,
                available: 2,
                ..
            }
        ));
    }

    #[test]
    fn test_place_rejects_zero_count() {
        let err = place("workers", 0, &subnets(3)).unwrap_err();

        assert!(matches!(err, ConfigurationError::Unplaceable { count: 0, .. }));
    }

    #[test]
    fn test_total_never_exceeds_count() {
        for count in 1..=30 {
            let allocation = distribute(count, &subnets(3));
            assert_eq!(allocation.total(), count, "count {}", count);
        }
    }
}
