#![allow(clippy::unwrap_used)] // Tests can use unwrap for brevity
#![allow(clippy::expect_used)] // Tests can use expect for better error messages

use super::*;
use kube::CustomResourceExt;

const MANIFEST: &str = r#"
apiVersion: provisio.dev/v1alpha1
kind: ManagedCluster
metadata:
  name: c1
  namespace: team-a
  annotations:
    provisio.dev/requested-by: alice
spec:
  organization: acme
  location: eu-west-1
  cloud: amazon
  secretRef: aws-credentials
  properties:
    kubernetesVersion: "1.30"
    sshSecretId: ssh-key
  nodePools:
    workers:
      instanceType: m5.large
      image: ami-123
      count: 3
    batch:
      instanceType: c5.xlarge
      spotPrice: "0.1"
      count: 2
      autoscaling: true
      minCount: 1
      maxCount: 5
"#;

const STATUS: &str = r#"
phase: Running
message: cluster is running
createdBy: alice
createdAt: "2026-03-01T10:00:00Z"
nodePools:
  - name: workers
    id: 5f0e4a8e-0000-4000-8000-000000000001
    createdBy: alice
    createdAt: "2026-03-01T10:05:00Z"
    spec:
      instanceType: m5.large
      image: ami-123
      spotPrice: "0.0"
      count: 3
resources:
  networkId: vpc-1
  controlPlaneId: cp-1
observedGeneration: 2
"#;

const PROVISIONED: &str = r#"
provisioned:
  organization: acme
  location: eu-west-1
  cloud: amazon
  secretRef: aws-credentials
  properties:
    kubernetesVersion: "1.30"
    sshSecretId: ssh-key
"#;

/// Running cluster whose status pins the identity it was provisioned with
fn provisioned_cluster() -> ManagedCluster {
    let mut cluster = cluster();
    cluster.status = Some(serde_yaml::from_str(&format!("{}{}", STATUS, PROVISIONED)).unwrap());
    cluster
}

fn cluster() -> ManagedCluster {
    serde_yaml::from_str(MANIFEST).expect("Failed to deserialize ManagedCluster")
}

#[test]
fn test_deserialize_from_yaml() {
    let cluster = cluster();

    assert_eq!(cluster.metadata.name.as_deref(), Some("c1"));
    assert_eq!(cluster.spec.cloud, CloudProvider::Amazon);
    assert_eq!(cluster.spec.secret_ref, "aws-credentials");
    assert_eq!(cluster.spec.properties.kubernetes_version, "1.30");
    assert_eq!(cluster.spec.properties.ssh_secret_id.as_deref(), Some("ssh-key"));
    assert_eq!(cluster.spec.node_pools.len(), 2);

    let batch = &cluster.spec.node_pools["batch"];
    assert!(batch.autoscaling);
    assert_eq!(batch.min_count, Some(1));
    assert_eq!(batch.max_count, Some(5));
    assert_eq!(batch.image, "", "image defaults to empty when omitted");
    assert!(cluster.status.is_none());
}

#[test]
fn test_cluster_id_and_requester() {
    let cluster = cluster();

    assert_eq!(cluster.cluster_id(), Some(ClusterId::new("team-a/c1")));
    assert_eq!(cluster.requested_by(), "alice");
}

#[test]
fn test_requester_defaults_to_operator() {
    let mut cluster = cluster();
    cluster.metadata.annotations = None;

    assert_eq!(cluster.requested_by(), DEFAULT_ACTOR);
}

#[test]
fn test_cluster_id_requires_namespace() {
    let mut cluster = cluster();
    cluster.metadata.namespace = None;

    assert_eq!(cluster.cluster_id(), None);
}

#[test]
fn test_requests_mirror_the_spec() {
    let cluster = cluster();
    let id = cluster.cluster_id().unwrap();

    let create = cluster.create_request(id.clone());
    let update = cluster.update_request(id.clone());

    assert_eq!(create.name, "c1");
    assert_eq!(create.organization, "acme");
    assert_eq!(create.secret_id, "aws-credentials");
    assert_eq!(create.created_by, "alice");
    assert_eq!(create.node_pools, cluster.spec.node_pools);
    assert_eq!(update.cluster, id);
    assert_eq!(update.cloud, CloudProvider::Amazon);
    assert_eq!(update.updated_by, "alice");
}

#[test]
fn test_record_without_status_is_requested() {
    let cluster = cluster();
    let id = cluster.cluster_id().unwrap();

    let record = cluster.to_cluster_spec(&id).unwrap();

    assert_eq!(record.state, ClusterState::Requested);
    assert!(record.node_pools.is_empty());
    assert_eq!(record.created_at, None);
}

#[test]
fn test_record_is_restored_from_status() {
    // ARRANGE
    let mut cluster = cluster();
    cluster.status = Some(serde_yaml::from_str(STATUS).unwrap());
    let id = cluster.cluster_id().unwrap();

    // ACT
    let record = cluster.to_cluster_spec(&id).unwrap();

    // ASSERT
    assert_eq!(record.state, ClusterState::Running);
    assert_eq!(record.status_message, "cluster is running");
    assert_eq!(record.resources.network_id.as_deref(), Some("vpc-1"));
    assert_eq!(
        record.created_at.unwrap().to_rfc3339(),
        "2026-03-01T10:00:00+00:00"
    );
    assert_eq!(record.node_pools.len(), 1);
    let workers = &record.node_pools[0];
    assert_eq!(workers.identity.cluster_id, id);
    assert_eq!(workers.spec.count, 3);
    assert!(!workers.marked_for_deletion);
}

#[test]
fn test_status_round_trips_through_cluster_record() {
    let mut cluster = cluster();
    cluster.status = Some(serde_yaml::from_str(STATUS).unwrap());
    let id = cluster.cluster_id().unwrap();
    let record = cluster.to_cluster_spec(&id).unwrap();

    let status = ManagedClusterStatus::from_cluster(&record);

    let original = cluster.status.as_ref().unwrap();
    assert_eq!(status.phase, original.phase);
    assert_eq!(status.created_at, original.created_at);
    assert_eq!(status.node_pools, original.node_pools);
    assert_eq!(status.resources, original.resources);
}

#[test]
fn test_corrupt_timestamp_is_reported() {
    let mut cluster = cluster();
    let mut status: ManagedClusterStatus = serde_yaml::from_str(STATUS).unwrap();
    status.node_pools[0].created_at = "yesterday".to_string();
    cluster.status = Some(status);

    let err = cluster
        .to_cluster_spec(&cluster.cluster_id().unwrap())
        .unwrap_err();

    assert!(matches!(err, StoreError::Corrupt(_)));
}

#[test]
fn test_empty_pool_list_is_serialized() {
    // A merge patch must be able to clear the pool records
    let status = ManagedClusterStatus::default();

    let json = serde_json::to_value(&status).unwrap();

    assert_eq!(json["nodePools"], serde_json::json!([]));
    assert_eq!(json["message"], "");
    assert!(json.get("lastOperation").is_none());
}

#[test]
fn test_crd_metadata() {
    let crd = ManagedCluster::crd();

    assert_eq!(crd.spec.group, "provisio.dev");
    assert_eq!(crd.spec.names.kind, "ManagedCluster");
    assert_eq!(crd.spec.scope, "Namespaced");
    assert_eq!(crd.spec.versions[0].name, "v1alpha1");
    assert!(crd.spec.versions[0].subresources.is_some());
}

#[test]
fn test_saved_status_pins_identity() {
    let cluster = cluster();
    let record = cluster.to_cluster_spec(&cluster.cluster_id().unwrap()).unwrap();

    let status = ManagedClusterStatus::from_cluster(&record);

    let pinned = status.provisioned.expect("identity should be pinned");
    assert_eq!(pinned.cloud, CloudProvider::Amazon);
    assert_eq!(pinned.location, "eu-west-1");
    assert_eq!(pinned.secret_ref, "aws-credentials");
    assert_eq!(pinned.properties.ssh_secret_id.as_deref(), Some("ssh-key"));
}

#[test]
fn test_record_keeps_provisioned_identity_after_spec_edit() {
    // ARRANGE
    let mut cluster = provisioned_cluster();
    cluster.spec.cloud = CloudProvider::Oracle;
    cluster.spec.location = "us-east-1".to_string();
    cluster.spec.organization = "other".to_string();
    cluster.spec.secret_ref = "oci-credentials".to_string();
    cluster.spec.properties.kubernetes_version = "1.31".to_string();
    let id = cluster.cluster_id().unwrap();

    // ACT
    let record = cluster.to_cluster_spec(&id).unwrap();

    // ASSERT
    assert_eq!(record.cloud, CloudProvider::Amazon);
    assert_eq!(record.location, "eu-west-1");
    assert_eq!(record.organization, "acme");
    assert_eq!(record.secret_id, "aws-credentials");
    assert_eq!(record.properties.kubernetes_version, "1.30");
    assert_eq!(record.state, ClusterState::Running);
}

#[test]
fn test_cloud_edit_is_a_provider_mismatch() {
    let mut cluster = provisioned_cluster();
    cluster.spec.cloud = CloudProvider::Oracle;
    let id = cluster.cluster_id().unwrap();
    let record = cluster.to_cluster_spec(&id).unwrap();

    let result = crate::equality::is_noop_update(&cluster.update_request(id), &record);

    assert!(matches!(
        result,
        Err(crate::error::LifecycleError::ProviderMismatch {
            requested: CloudProvider::Oracle,
            stored: CloudProvider::Amazon,
        })
    ));
}

#[test]
fn test_identity_drift_names_edited_fields() {
    let mut cluster = provisioned_cluster();
    assert!(cluster.identity_drift().is_empty());

    cluster.spec.location = "us-east-1".to_string();
    cluster.spec.secret_ref = "other".to_string();

    assert_eq!(cluster.identity_drift(), vec!["location", "secretRef"]);
}

#[test]
fn test_unpinned_cluster_has_no_drift() {
    let mut cluster = cluster();
    cluster.status = Some(serde_yaml::from_str(STATUS).unwrap());
    cluster.spec.cloud = CloudProvider::Oracle;

    assert!(cluster.identity_drift().is_empty());
}
