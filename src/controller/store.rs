//! Cluster records persisted in the `ManagedCluster` status subresource

use super::{ClusterResourceApi, FIELD_MANAGER, FINALIZER};
use crate::crd::{ManagedCluster, ManagedClusterStatus, OperationRecord, ProvisionedIdentity};
use crate::error::StoreError;
use crate::lifecycle::{ClusterState, ClusterStore};
use crate::model::{ClusterId, ClusterSpec};
use async_trait::async_trait;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use serde_json::{json, Value};
use tracing::debug;

/// Split `namespace/name`
pub fn split_cluster_id(id: &ClusterId) -> Result<(&str, &str), StoreError> {
    match id.as_str().split_once('/') {
        Some((namespace, name)) if !namespace.is_empty() && !name.is_empty() => {
            Ok((namespace, name))
        }
        _ => Err(StoreError::Corrupt(format!(
            "cluster id {:?} is not namespace/name",
            id.as_str()
        ))),
    }
}

/// Kubernetes-backed [`ClusterStore`]
///
/// The spec of a `ManagedCluster` is the caller's request; everything the
/// lifecycle persists goes to its status. Deleting a record releases the
/// finalizer so Kubernetes can remove the object.
#[derive(Clone)]
pub struct KubeClusterStore {
    client: Client,
}

impl KubeClusterStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<ManagedCluster> {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn get(&self, id: &ClusterId) -> Result<Option<ManagedCluster>, StoreError> {
        let (namespace, name) = split_cluster_id(id)?;
        match self.api(namespace).get(name).await {
            Ok(cluster) => Ok(Some(cluster)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_status(&self, id: &ClusterId, status: Value) -> Result<(), StoreError> {
        let (namespace, name) = split_cluster_id(id)?;
        let patch = json!({ "status": status });
        self.api(namespace)
            .patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn patch_finalizers(&self, id: &ClusterId, finalizers: Vec<String>) -> Result<(), StoreError> {
        let (namespace, name) = split_cluster_id(id)?;
        let patch = json!({
            "metadata": {
                "finalizers": finalizers
            }
        });
        self.api(namespace)
            .patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ClusterStore for KubeClusterStore {
    async fn load(&self, id: &ClusterId) -> Result<Option<ClusterSpec>, StoreError> {
        match self.get(id).await? {
            Some(cluster) => cluster.to_cluster_spec(id).map(Some),
            None => Ok(None),
        }
    }

    async fn save(&self, cluster: &ClusterSpec) -> Result<(), StoreError> {
        let status = serde_json::to_value(ManagedClusterStatus::from_cluster(cluster))
            .map_err(|e| StoreError::Corrupt(format!("cannot encode status: {}", e)))?;
        debug!(cluster = %cluster.id, phase = %cluster.state, "Saving cluster record");
        self.patch_status(&cluster.id, status).await
    }

    async fn delete(&self, id: &ClusterId) -> Result<(), StoreError> {
        self.remove_finalizer(id).await
    }

    async fn update_status(
        &self,
        id: &ClusterId,
        state: ClusterState,
        message: &str,
    ) -> Result<(), StoreError> {
        debug!(cluster = %id, phase = %state, "Updating cluster phase");
        let mut status = json!({ "phase": state, "message": message });
        // identity is pinned when provisioning starts
        if state == ClusterState::Creating {
            if let Some(cluster) = self.get(id).await? {
                let pinned = ProvisionedIdentity::from_cluster(&cluster.to_cluster_spec(id)?);
                status["provisioned"] = serde_json::to_value(pinned)
                    .map_err(|e| StoreError::Corrupt(format!("cannot encode identity: {}", e)))?;
            }
        }
        self.patch_status(id, status).await
    }
}

#[async_trait]
impl ClusterResourceApi for KubeClusterStore {
    async fn add_finalizer(&self, id: &ClusterId) -> Result<(), StoreError> {
        let Some(cluster) = self.get(id).await? else {
            return Ok(());
        };
        let mut finalizers = cluster.metadata.finalizers.unwrap_or_default();
        if finalizers.iter().any(|f| f == FINALIZER) {
            return Ok(());
        }
        finalizers.push(FINALIZER.to_string());
        self.patch_finalizers(id, finalizers).await
    }

    async fn remove_finalizer(&self, id: &ClusterId) -> Result<(), StoreError> {
        let Some(cluster) = self.get(id).await? else {
            debug!(cluster = %id, "ManagedCluster already gone");
            return Ok(());
        };
        let finalizers = cluster.metadata.finalizers.unwrap_or_default();
        if !finalizers.iter().any(|f| f == FINALIZER) {
            return Ok(());
        }
        let remaining = finalizers.into_iter().filter(|f| f != FINALIZER).collect();
        self.patch_finalizers(id, remaining).await
    }

    async fn record_operation(
        &self,
        id: &ClusterId,
        operation: &OperationRecord,
        observed_generation: Option<i64>,
    ) -> Result<(), StoreError> {
        let mut status = json!({ "lastOperation": operation });
        if let Some(generation) = observed_generation {
            status["observedGeneration"] = json!(generation);
        }
        self.patch_status(id, status).await
    }

    async fn observe_generation(&self, id: &ClusterId, generation: i64) -> Result<(), StoreError> {
        self.patch_status(id, json!({ "observedGeneration": generation }))
            .await
    }
}
