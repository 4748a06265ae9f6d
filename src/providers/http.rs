//! REST client for cloud adapter services
//!
//! Vendor SDK calls live behind an adapter service. Every operation is a
//! `POST {base}/v1/{cloud}/{operation}` with a JSON envelope:
//!
//! ```json
//! { "region": "eu-west-1", "credentials": { ... }, "args": { ... } }
//! ```
//!
//! A 2xx response carries the operation result as JSON. 404 means the
//! resource does not exist; any other status is an API error.

use super::amazon::{
    AmazonCloud, AmazonConnector, ControlPlaneDescription, ControlPlaneRequest, StackDescription,
    StackRequest,
};
use super::oracle::{
    NetworkValues, OracleCloud, OracleClusterDescription, OracleClusterRequest, OracleConnector,
    OracleNodePoolDescription, OracleNodePoolRequest,
};
use crate::error::CloudError;
use crate::model::{CloudProvider, Credentials};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Serialize)]
struct Envelope<'a> {
    region: &'a str,
    credentials: &'a BTreeMap<String, String>,
    args: Value,
}

/// Connects both providers to an adapter service
#[derive(Debug, Clone)]
pub struct HttpConnector {
    client: reqwest::Client,
    base_url: String,
}

impl HttpConnector {
    /// # Errors
    /// [`CloudError::Transport`] if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, CloudError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CloudError::Transport(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn adapter(
        &self,
        cloud: CloudProvider,
        region: &str,
        credentials: &Credentials,
    ) -> Arc<HttpCloudAdapter> {
        Arc::new(HttpCloudAdapter {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            cloud,
            region: region.to_string(),
            credentials: credentials.clone(),
        })
    }
}

#[async_trait]
impl AmazonConnector for HttpConnector {
    async fn connect_amazon(
        &self,
        region: &str,
        credentials: &Credentials,
    ) -> Result<Arc<dyn AmazonCloud>, CloudError> {
        Ok(self.adapter(CloudProvider::Amazon, region, credentials))
    }
}

#[async_trait]
impl OracleConnector for HttpConnector {
    async fn connect_oracle(
        &self,
        region: &str,
        credentials: &Credentials,
    ) -> Result<Arc<dyn OracleCloud>, CloudError> {
        Ok(self.adapter(CloudProvider::Oracle, region, credentials))
    }
}

/// One cloud session: a region and the credentials resolved for it
pub struct HttpCloudAdapter {
    client: reqwest::Client,
    base_url: String,
    cloud: CloudProvider,
    region: String,
    credentials: Credentials,
}

impl HttpCloudAdapter {
    async fn send(&self, operation: &str, args: Value) -> Result<reqwest::Response, CloudError> {
        let url = format!("{}/v1/{}/{}", self.base_url, self.cloud, operation);
        debug!(url = %url, region = %self.region, "Calling cloud adapter");

        let envelope = Envelope {
            region: &self.region,
            credentials: self.credentials.values(),
            args,
        };
        let response = self
            .client
            .post(&url)
            .json(&envelope)
            .send()
            .await
            .map_err(|e| {
                warn!(url = %url, error = %e, "Cloud adapter request failed");
                CloudError::Transport(format!("POST {} failed: {}", url, e))
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::NOT_FOUND {
            let what = if body.is_empty() {
                operation.to_string()
            } else {
                body
            };
            return Err(CloudError::NotFound(what));
        }

        warn!(url = %url, status = status.as_u16(), "Cloud adapter returned error status");
        Err(CloudError::Api(format!(
            "{} returned {}: {}",
            operation, status, body
        )))
    }

    async fn call<R: DeserializeOwned>(&self, operation: &str, args: Value) -> Result<R, CloudError> {
        self.send(operation, args)
            .await?
            .json::<R>()
            .await
            .map_err(|e| CloudError::Transport(format!("invalid {} response: {}", operation, e)))
    }

    async fn call_unit(&self, operation: &str, args: Value) -> Result<(), CloudError> {
        self.send(operation, args).await.map(|_| ())
    }

    /// Like [`Self::call`], with 404 mapped to `None`
    async fn lookup<R: DeserializeOwned>(
        &self,
        operation: &str,
        args: Value,
    ) -> Result<Option<R>, CloudError> {
        match self.call(operation, args).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn to_args<T: Serialize>(value: &T) -> Result<Value, CloudError> {
    serde_json::to_value(value)
        .map_err(|e| CloudError::Transport(format!("failed to encode request: {}", e)))
}

#[async_trait]
impl AmazonCloud for HttpCloudAdapter {
    async fn ensure_role(&self, name: &str) -> Result<String, CloudError> {
        self.call("ensure-role", json!({ "name": name })).await
    }

    async fn delete_role(&self, name: &str) -> Result<(), CloudError> {
        self.call_unit("delete-role", json!({ "name": name })).await
    }

    async fn import_key_pair(&self, name: &str, public_key: &str) -> Result<(), CloudError> {
        self.call_unit(
            "import-key-pair",
            json!({ "name": name, "publicKey": public_key }),
        )
        .await
    }

    async fn delete_key_pair(&self, name: &str) -> Result<(), CloudError> {
        self.call_unit("delete-key-pair", json!({ "name": name }))
            .await
    }

    async fn create_stack(&self, request: &StackRequest) -> Result<(), CloudError> {
        self.call_unit("create-stack", to_args(request)?).await
    }

    async fn update_stack(&self, request: &StackRequest) -> Result<(), CloudError> {
        self.call_unit("update-stack", to_args(request)?).await
    }

    async fn delete_stack(&self, name: &str) -> Result<(), CloudError> {
        self.call_unit("delete-stack", json!({ "name": name })).await
    }

    async fn describe_stack(&self, name: &str) -> Result<Option<StackDescription>, CloudError> {
        self.lookup("describe-stack", json!({ "name": name })).await
    }

    async fn node_group_capacity(&self, stack: &str) -> Result<Option<u32>, CloudError> {
        self.lookup("node-group-capacity", json!({ "stack": stack }))
            .await
    }

    async fn create_cluster(
        &self,
        request: &ControlPlaneRequest,
    ) -> Result<ControlPlaneDescription, CloudError> {
        self.call("create-cluster", to_args(request)?).await
    }

    async fn delete_cluster(&self, name: &str) -> Result<(), CloudError> {
        self.call_unit("delete-cluster", json!({ "name": name })).await
    }

    async fn describe_cluster(
        &self,
        name: &str,
    ) -> Result<Option<ControlPlaneDescription>, CloudError> {
        self.lookup("describe-cluster", json!({ "name": name })).await
    }
}

#[async_trait]
impl OracleCloud for HttpCloudAdapter {
    async fn create_vcn(&self, name: &str) -> Result<String, CloudError> {
        self.call("create-vcn", json!({ "name": name })).await
    }

    async fn delete_vcn(&self, vcn_id: &str) -> Result<(), CloudError> {
        self.call_unit("delete-vcn", json!({ "vcnId": vcn_id })).await
    }

    async fn network_values(&self, vcn_id: &str) -> Result<NetworkValues, CloudError> {
        self.call("network-values", json!({ "vcnId": vcn_id })).await
    }

    async fn create_cluster(&self, request: &OracleClusterRequest) -> Result<String, CloudError> {
        self.call("create-cluster", to_args(request)?).await
    }

    async fn delete_cluster(&self, cluster_id: &str) -> Result<(), CloudError> {
        self.call_unit("delete-cluster", json!({ "clusterId": cluster_id }))
            .await
    }

    async fn get_cluster(
        &self,
        cluster_id: &str,
    ) -> Result<Option<OracleClusterDescription>, CloudError> {
        self.lookup("get-cluster", json!({ "clusterId": cluster_id }))
            .await
    }

    async fn create_node_pool(&self, request: &OracleNodePoolRequest) -> Result<(), CloudError> {
        self.call_unit("create-node-pool", to_args(request)?).await
    }

    async fn update_node_pool(&self, request: &OracleNodePoolRequest) -> Result<(), CloudError> {
        self.call_unit("update-node-pool", to_args(request)?).await
    }

    async fn delete_node_pool(&self, cluster_id: &str, name: &str) -> Result<(), CloudError> {
        self.call_unit(
            "delete-node-pool",
            json!({ "clusterId": cluster_id, "name": name }),
        )
        .await
    }

    async fn describe_node_pool(
        &self,
        cluster_id: &str,
        name: &str,
    ) -> Result<Option<OracleNodePoolDescription>, CloudError> {
        self.lookup(
            "describe-node-pool",
            json!({ "clusterId": cluster_id, "name": name }),
        )
        .await
    }
}

#[cfg(test)]
#[path = "http_test.rs"]
mod tests;
