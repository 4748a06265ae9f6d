//! In-memory collaborators for end-to-end lifecycle tests
//!
//! - [`FakeAmazon`]: stack-based cloud keeping stacks, roles and control planes in maps
//! - [`MemoryStore`]: cluster records plus a log of every write
//! - [`StaticSecrets`]: the same credentials for every organization

#![allow(dead_code)]
#![allow(clippy::unwrap_used)] // Test fakes can use unwrap for brevity

use async_trait::async_trait;
use provisio::error::{CloudError, SecretError, StoreError};
use provisio::lifecycle::{ClusterState, ClusterStore, SecretResolver};
use provisio::model::{ClusterId, ClusterSpec, Credentials};
use provisio::providers::amazon::{
    ControlPlaneDescription, ControlPlaneRequest, StackDescription, StackRequest, StackTemplate,
    ACTIVE, OUTPUT_SECURITY_GROUPS, OUTPUT_SUBNET_IDS, OUTPUT_VPC_ID, PARAM_DESIRED,
};
use provisio::providers::{AmazonCloud, AmazonConnector};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
pub struct CloudState {
    pub roles: BTreeSet<String>,
    pub key_pairs: BTreeSet<String>,
    pub stacks: BTreeMap<String, StackDescription>,
    pub control_planes: BTreeMap<String, ControlPlaneDescription>,
}

/// Stack-based cloud in memory
///
/// Stacks listed with [`FakeAmazon::fail_stack`] fail to create.
#[derive(Default)]
pub struct FakeAmazon {
    state: Mutex<CloudState>,
    failing_stacks: Mutex<BTreeSet<String>>,
}

impl FakeAmazon {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_stack(&self, name: &str) {
        self.failing_stacks.lock().unwrap().insert(name.to_string());
    }

    pub fn stack_names(&self) -> Vec<String> {
        self.state.lock().unwrap().stacks.keys().cloned().collect()
    }

    pub fn stack(&self, name: &str) -> Option<StackDescription> {
        self.state.lock().unwrap().stacks.get(name).cloned()
    }

    pub fn is_empty(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.roles.is_empty()
            && state.key_pairs.is_empty()
            && state.stacks.is_empty()
            && state.control_planes.is_empty()
    }
}

fn not_found(what: &str) -> CloudError {
    CloudError::NotFound(what.to_string())
}

#[async_trait]
impl AmazonCloud for FakeAmazon {
    async fn ensure_role(&self, name: &str) -> Result<String, CloudError> {
        self.state.lock().unwrap().roles.insert(name.to_string());
        Ok(format!("arn:aws:iam::000000000000:role/{}", name))
    }

    async fn delete_role(&self, name: &str) -> Result<(), CloudError> {
        if self.state.lock().unwrap().roles.remove(name) {
            Ok(())
        } else {
            Err(not_found(name))
        }
    }

    async fn import_key_pair(&self, name: &str, _public_key: &str) -> Result<(), CloudError> {
        self.state.lock().unwrap().key_pairs.insert(name.to_string());
        Ok(())
    }

    async fn delete_key_pair(&self, name: &str) -> Result<(), CloudError> {
        if self.state.lock().unwrap().key_pairs.remove(name) {
            Ok(())
        } else {
            Err(not_found(name))
        }
    }

    async fn create_stack(&self, request: &StackRequest) -> Result<(), CloudError> {
        if self.failing_stacks.lock().unwrap().contains(&request.name) {
            return Err(CloudError::Api(format!(
                "stack {} is in CREATE_FAILED",
                request.name
            )));
        }

        let outputs = match request.template {
            StackTemplate::Network => BTreeMap::from([
                (OUTPUT_SECURITY_GROUPS.to_string(), "sg-1".to_string()),
                (OUTPUT_VPC_ID.to_string(), "vpc-1".to_string()),
                (OUTPUT_SUBNET_IDS.to_string(), "subnet-a,subnet-b".to_string()),
            ]),
            StackTemplate::NodePool => BTreeMap::new(),
        };
        self.state.lock().unwrap().stacks.insert(
            request.name.clone(),
            StackDescription {
                name: request.name.clone(),
                outputs,
                parameters: request.parameters.clone(),
            },
        );
        Ok(())
    }

    async fn update_stack(&self, request: &StackRequest) -> Result<(), CloudError> {
        let mut state = self.state.lock().unwrap();
        let stack = state
            .stacks
            .get_mut(&request.name)
            .ok_or_else(|| not_found(&request.name))?;
        stack.parameters = request.parameters.clone();
        Ok(())
    }

    async fn delete_stack(&self, name: &str) -> Result<(), CloudError> {
        match self.state.lock().unwrap().stacks.remove(name) {
            Some(_) => Ok(()),
            None => Err(not_found(name)),
        }
    }

    async fn describe_stack(&self, name: &str) -> Result<Option<StackDescription>, CloudError> {
        Ok(self.stack(name))
    }

    async fn node_group_capacity(&self, stack: &str) -> Result<Option<u32>, CloudError> {
        Ok(self
            .stack(stack)
            .and_then(|s| s.parameters.get(PARAM_DESIRED).cloned())
            .and_then(|desired| desired.parse().ok()))
    }

    async fn create_cluster(
        &self,
        request: &ControlPlaneRequest,
    ) -> Result<ControlPlaneDescription, CloudError> {
        let description = ControlPlaneDescription {
            id: format!("cp-{}", request.name),
            version: request.version.clone(),
            status: ACTIVE.to_string(),
            endpoint: Some(format!("https://{}.eks.example.com", request.name)),
        };
        self.state
            .lock()
            .unwrap()
            .control_planes
            .insert(request.name.clone(), description.clone());
        Ok(description)
    }

    async fn delete_cluster(&self, name: &str) -> Result<(), CloudError> {
        match self.state.lock().unwrap().control_planes.remove(name) {
            Some(_) => Ok(()),
            None => Err(not_found(name)),
        }
    }

    async fn describe_cluster(
        &self,
        name: &str,
    ) -> Result<Option<ControlPlaneDescription>, CloudError> {
        Ok(self.state.lock().unwrap().control_planes.get(name).cloned())
    }
}

pub struct FakeConnector(pub Arc<FakeAmazon>);

#[async_trait]
impl AmazonConnector for FakeConnector {
    async fn connect_amazon(
        &self,
        _region: &str,
        _credentials: &Credentials,
    ) -> Result<Arc<dyn AmazonCloud>, CloudError> {
        Ok(self.0.clone())
    }
}

/// One write issued against the store
#[derive(Debug, Clone, PartialEq)]
pub enum StoreWrite {
    Save(ClusterState),
    Delete,
    Status(ClusterState, String),
}

#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<BTreeMap<ClusterId, ClusterSpec>>,
    writes: Mutex<Vec<StoreWrite>>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record(&self, id: &ClusterId) -> Option<ClusterSpec> {
        self.records.lock().unwrap().get(id).cloned()
    }

    pub fn writes(&self) -> Vec<StoreWrite> {
        self.writes.lock().unwrap().clone()
    }

    pub fn saves(&self) -> usize {
        self.writes()
            .iter()
            .filter(|w| matches!(w, StoreWrite::Save(_)))
            .count()
    }

    pub fn clear_writes(&self) {
        self.writes.lock().unwrap().clear();
    }
}

#[async_trait]
impl ClusterStore for MemoryStore {
    async fn load(&self, id: &ClusterId) -> Result<Option<ClusterSpec>, StoreError> {
        Ok(self.record(id))
    }

    async fn save(&self, cluster: &ClusterSpec) -> Result<(), StoreError> {
        self.records
            .lock()
            .unwrap()
            .insert(cluster.id.clone(), cluster.clone());
        self.writes
            .lock()
            .unwrap()
            .push(StoreWrite::Save(cluster.state));
        Ok(())
    }

    async fn delete(&self, id: &ClusterId) -> Result<(), StoreError> {
        self.records.lock().unwrap().remove(id);
        self.writes.lock().unwrap().push(StoreWrite::Delete);
        Ok(())
    }

    async fn update_status(
        &self,
        id: &ClusterId,
        state: ClusterState,
        message: &str,
    ) -> Result<(), StoreError> {
        if let Some(record) = self.records.lock().unwrap().get_mut(id) {
            record.state = state;
            record.status_message = message.to_string();
        }
        self.writes
            .lock()
            .unwrap()
            .push(StoreWrite::Status(state, message.to_string()));
        Ok(())
    }
}

pub struct StaticSecrets;

#[async_trait]
impl SecretResolver for StaticSecrets {
    async fn get_secret(
        &self,
        _organization: &str,
        _secret_id: &str,
    ) -> Result<Credentials, SecretError> {
        Ok(Credentials::new(BTreeMap::from([
            ("access_key_id".to_string(), "AKIA".to_string()),
            ("secret_access_key".to_string(), "secret".to_string()),
        ])))
    }
}
