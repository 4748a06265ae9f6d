#![allow(clippy::unwrap_used)] // Tests can use unwrap for brevity

use super::*;
use crate::model::ClusterId;
use crate::nodepool::NodePoolIdentity;

fn fixed(instance_type: &str, count: u32) -> NodePoolSpec {
    NodePoolSpec {
        instance_type: instance_type.to_string(),
        image: "ami-base".to_string(),
        spot_price: Some("0.0".to_string()),
        count,
        autoscaling: false,
        min_count: None,
        max_count: None,
    }
}

fn autoscaled(count: u32, min: u32, max: u32) -> NodePoolSpec {
    NodePoolSpec {
        autoscaling: true,
        min_count: Some(min),
        max_count: Some(max),
        ..fixed("m5.large", count)
    }
}

fn persisted(name: &str, spec: NodePoolSpec) -> NodePoolCurrent {
    NodePoolCurrent {
        name: name.to_string(),
        identity: NodePoolIdentity::assign(&ClusterId::new("default/c1"), "alice"),
        spec,
        marked_for_deletion: false,
    }
}

fn desired(pools: &[(&str, NodePoolSpec)]) -> DesiredPools {
    pools
        .iter()
        .map(|(name, spec)| (name.to_string(), spec.clone()))
        .collect()
}

#[test]
fn test_new_pool_is_created_with_default_spot_price() {
    // ARRANGE
    let mut spec = fixed("m5.large", 3);
    spec.spot_price = None;
    let desired = desired(&[("pool1", spec)]);

    // ACT
    let result = reconcile_node_pools(
        &desired,
        &[],
        &LiveDescriptions::new(),
        &PoolDefaults::default(),
    )
    .unwrap();

    // ASSERT
    assert_eq!(result.len(), 1);
    match &result[0] {
        ReconciledPool::Create { name, spec } => {
            assert_eq!(name, "pool1");
            assert_eq!(spec.spot_price.as_deref(), Some("0.0"));
            assert_eq!(spec.count, 3);
        }
        other => panic!("expected Create, got {:?}", other),
    }
}

#[test]
fn test_create_update_delete_classification_and_order() {
    // ARRANGE: current {a, b}, desired {b, c}
    let current = vec![
        persisted("a", fixed("m5.large", 1)),
        persisted("b", fixed("m5.large", 2)),
    ];
    let desired = desired(&[("b", fixed("m5.large", 4)), ("c", fixed("m5.large", 1))]);

    // ACT
    let result = reconcile_node_pools(
        &desired,
        &current,
        &LiveDescriptions::new(),
        &PoolDefaults::default(),
    )
    .unwrap();

    // ASSERT: creates, updates, deletes
    let names: Vec<&str> = result.iter().map(ReconciledPool::name).collect();
    assert_eq!(names, vec!["c", "b", "a"]);
    assert!(matches!(result[0], ReconciledPool::Create { .. }));
    assert!(matches!(result[1], ReconciledPool::Update { .. }));
    assert!(result[2].is_delete());
}

#[test]
fn test_delete_carries_identity_unchanged() {
    let current = vec![persisted("old", fixed("m5.large", 2))];
    let identity = current[0].identity.clone();

    let result = reconcile_node_pools(
        &DesiredPools::new(),
        &current,
        &LiveDescriptions::new(),
        &PoolDefaults::default(),
    )
    .unwrap();

    assert_eq!(
        result,
        vec![ReconciledPool::Delete {
            name: "old".to_string(),
            identity,
        }]
    );
}

#[test]
fn test_update_keeps_identity_and_takes_caller_count() {
    let current = vec![persisted("pool1", fixed("m5.large", 2))];
    let desired = desired(&[("pool1", fixed("m5.large", 5))]);

    let result = reconcile_node_pools(
        &desired,
        &current,
        &LiveDescriptions::new(),
        &PoolDefaults::default(),
    )
    .unwrap();

    assert_eq!(result[0].identity(), Some(&current[0].identity));
    assert_eq!(result[0].spec().unwrap().count, 5);
}

#[test]
fn test_live_description_overrides_immutable_attributes() {
    // ARRANGE: caller asks for a different instance type, live says m5.large
    let current = vec![persisted("pool1", fixed("m5.large", 2))];
    let desired = desired(&[("pool1", fixed("c5.4xlarge", 2))]);
    let live = LiveDescriptions::from([(
        "pool1".to_string(),
        LivePoolDescription {
            instance_type: Some("m5.large".to_string()),
            image: Some("ami-live".to_string()),
            spot_price: Some("0.12".to_string()),
            observed_capacity: None,
        },
    )]);

    // ACT
    let result =
        reconcile_node_pools(&desired, &current, &live, &PoolDefaults::default()).unwrap();

    // ASSERT
    let spec = result[0].spec().unwrap();
    assert_eq!(spec.instance_type, "m5.large");
    assert_eq!(spec.image, "ami-live");
    assert_eq!(spec.spot_price.as_deref(), Some("0.12"));
}

#[test]
fn test_without_live_description_persisted_immutables_are_kept() {
    let current = vec![persisted("pool1", fixed("m5.large", 2))];
    let desired = desired(&[("pool1", fixed("c5.4xlarge", 3))]);

    let result = reconcile_node_pools(
        &desired,
        &current,
        &LiveDescriptions::new(),
        &PoolDefaults::default(),
    )
    .unwrap();

    let spec = result[0].spec().unwrap();
    assert_eq!(spec.instance_type, "m5.large");
    assert_eq!(spec.count, 3);
}

#[test]
fn test_autoscaled_pool_keeps_observed_capacity_clamped_to_new_bounds() {
    // ARRANGE: autoscaler grew the pool to 7, new max is 5
    let current = vec![persisted("pool1", autoscaled(3, 1, 10))];
    let desired = desired(&[("pool1", autoscaled(2, 1, 5))]);
    let live = LiveDescriptions::from([(
        "pool1".to_string(),
        LivePoolDescription {
            observed_capacity: Some(7),
            ..Default::default()
        },
    )]);

    // ACT
    let result =
        reconcile_node_pools(&desired, &current, &live, &PoolDefaults::default()).unwrap();

    // ASSERT
    assert_eq!(result[0].spec().unwrap().count, 5);
}

#[test]
fn test_autoscaled_pool_observed_capacity_within_bounds_is_kept() {
    let current = vec![persisted("pool1", autoscaled(3, 1, 10))];
    let desired = desired(&[("pool1", autoscaled(2, 1, 10))]);
    let live = LiveDescriptions::from([(
        "pool1".to_string(),
        LivePoolDescription {
            observed_capacity: Some(6),
            ..Default::default()
        },
    )]);

    let result =
        reconcile_node_pools(&desired, &current, &live, &PoolDefaults::default()).unwrap();

    assert_eq!(result[0].spec().unwrap().count, 6);
}

#[test]
fn test_autoscaled_pool_below_new_minimum_is_raised() {
    let current = vec![persisted("pool1", autoscaled(2, 1, 10))];
    let desired = desired(&[("pool1", autoscaled(2, 4, 10))]);
    let live = LiveDescriptions::from([(
        "pool1".to_string(),
        LivePoolDescription {
            observed_capacity: Some(2),
            ..Default::default()
        },
    )]);

    let result =
        reconcile_node_pools(&desired, &current, &live, &PoolDefaults::default()).unwrap();

    assert_eq!(result[0].spec().unwrap().count, 4);
}

#[test]
fn test_missing_instance_type_on_new_pool_is_rejected() {
    let desired = desired(&[("pool1", fixed("", 2))]);

    let err = reconcile_node_pools(
        &desired,
        &[],
        &LiveDescriptions::new(),
        &PoolDefaults::default(),
    )
    .unwrap_err();

    assert_eq!(
        err,
        ValidationError::MissingInstanceType {
            pool: "pool1".to_string()
        }
    );
}

#[test]
fn test_missing_image_on_new_pool_is_rejected() {
    let mut spec = fixed("m5.large", 2);
    spec.image.clear();
    let desired = desired(&[("pool1", spec)]);

    let err = reconcile_node_pools(
        &desired,
        &[],
        &LiveDescriptions::new(),
        &PoolDefaults::default(),
    )
    .unwrap_err();

    assert!(matches!(err, ValidationError::MissingImage { .. }));
}

#[test]
fn test_existing_pool_does_not_require_instance_type() {
    // immutables of existing pools come from persistence and live state
    let current = vec![persisted("pool1", fixed("m5.large", 2))];
    let desired = desired(&[("pool1", fixed("", 3))]);

    let result = reconcile_node_pools(
        &desired,
        &current,
        &LiveDescriptions::new(),
        &PoolDefaults::default(),
    );

    assert!(result.is_ok());
}

#[test]
fn test_autoscaling_without_bounds_is_rejected() {
    let mut spec = autoscaled(2, 1, 3);
    spec.max_count = None;
    let desired = desired(&[("pool1", spec)]);

    let err = reconcile_node_pools(
        &desired,
        &[],
        &LiveDescriptions::new(),
        &PoolDefaults::default(),
    )
    .unwrap_err();

    assert!(matches!(err, ValidationError::MissingAutoscalingBounds { .. }));
}

#[test]
fn test_autoscaling_with_inverted_bounds_is_rejected() {
    let desired = desired(&[("pool1", autoscaled(2, 5, 3))]);

    let err = reconcile_node_pools(
        &desired,
        &[],
        &LiveDescriptions::new(),
        &PoolDefaults::default(),
    )
    .unwrap_err();

    assert_eq!(
        err,
        ValidationError::InvalidAutoscalingBounds {
            pool: "pool1".to_string(),
            min: 5,
            max: 3
        }
    );
}

#[test]
fn test_new_autoscaled_pool_count_is_clamped() {
    let desired = desired(&[("pool1", autoscaled(0, 2, 6))]);

    let result = reconcile_node_pools(
        &desired,
        &[],
        &LiveDescriptions::new(),
        &PoolDefaults::default(),
    )
    .unwrap();

    assert_eq!(result[0].spec().unwrap().count, 2);
}

#[test]
fn test_reconciliation_is_idempotent() {
    let current = vec![
        persisted("a", fixed("m5.large", 1)),
        persisted("b", autoscaled(3, 1, 5)),
    ];
    let desired = desired(&[("b", autoscaled(3, 1, 4)), ("c", fixed("t3.small", 2))]);
    let live = LiveDescriptions::from([(
        "b".to_string(),
        LivePoolDescription {
            observed_capacity: Some(5),
            ..Default::default()
        },
    )]);

    let first = reconcile_node_pools(&desired, &current, &live, &PoolDefaults::default()).unwrap();
    let second = reconcile_node_pools(&desired, &current, &live, &PoolDefaults::default()).unwrap();

    assert_eq!(first, second);
}

#[test]
fn test_update_defaults_fill_missing_image_per_location() {
    let defaults = PoolDefaults {
        images: [("eu-west-1".to_string(), "ami-eu".to_string())].into(),
        ..Default::default()
    };
    let mut with_image = fixed("m5.large", 1);
    with_image.image = "ami-custom".to_string();
    let mut without_image = fixed("m5.large", 1);
    without_image.image.clear();
    let mut pools = desired(&[("a", with_image), ("b", without_image)]);

    apply_update_defaults(&mut pools, "eu-west-1", &defaults);

    assert_eq!(pools["a"].image, "ami-custom");
    assert_eq!(pools["b"].image, "ami-eu");
}

#[test]
fn test_update_defaults_unknown_location_leaves_pools_alone() {
    let mut spec = fixed("m5.large", 1);
    spec.image.clear();
    let mut pools = desired(&[("a", spec)]);

    apply_update_defaults(&mut pools, "mars-1", &PoolDefaults::default());

    assert!(pools["a"].image.is_empty());
}

#[test]
fn test_update_defaults_fill_missing_spot_price() {
    let defaults = PoolDefaults {
        spot_price: "0.05".to_string(),
        ..Default::default()
    };
    let mut bid = fixed("m5.large", 1);
    bid.spot_price = Some("0.3".to_string());
    let mut unset = fixed("m5.large", 1);
    unset.spot_price = None;
    let mut empty = fixed("m5.large", 1);
    empty.spot_price = Some(String::new());
    let mut pools = desired(&[("a", bid), ("b", unset), ("c", empty)]);

    apply_update_defaults(&mut pools, "mars-1", &defaults);

    assert_eq!(pools["a"].spot_price.as_deref(), Some("0.3"));
    assert_eq!(pools["b"].spot_price.as_deref(), Some("0.05"));
    assert_eq!(pools["c"].spot_price.as_deref(), Some("0.05"));
}

#[test]
fn test_update_defaults_match_what_create_stores() {
    // ARRANGE: a create request relying on the default bid
    let mut spec = fixed("m5.large", 2);
    spec.spot_price = None;
    let request = desired(&[("a", spec)]);
    let defaults = PoolDefaults::default();
    let created = reconcile_node_pools(&request, &[], &LiveDescriptions::new(), &defaults).unwrap();

    // ACT
    let mut resubmitted = request.clone();
    apply_update_defaults(&mut resubmitted, "eu-west-1", &defaults);

    // ASSERT
    assert_eq!(created[0].spec(), Some(&resubmitted["a"]));
}
