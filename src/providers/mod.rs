//! Cloud provider backends
//!
//! Each backend turns lifecycle work into [`Step`](crate::pipeline::Step)s over
//! a cloud adapter trait. The adapters are the only code that talks to a
//! vendor; [`http::HttpCloudAdapter`] reaches them over REST.
//!
//! - [`amazon`]: stack-based provisioning (role, network stack, control plane, pool stacks)
//! - [`oracle`]: managed network provisioning (VCN, cluster, pools spread over subnets)

pub mod amazon;
pub mod http;
pub mod oracle;

pub use amazon::{AmazonBackend, AmazonCloud, AmazonConnector};
pub use http::HttpConnector;
pub use oracle::{OracleBackend, OracleCloud, OracleConnector};

use crate::error::{CloudError, SecretError, StepError};
use crate::model::CloudCredentials;
use tracing::info;

/// Key of the SSH public key inside an SSH secret
pub const SSH_PUBLIC_KEY: &str = "public_key";

/// Public key from the resolved SSH secret, if one was configured
fn ssh_public_key(
    credentials: &CloudCredentials,
    secret_id: Option<&str>,
) -> Result<Option<String>, SecretError> {
    let (Some(ssh), Some(secret_id)) = (&credentials.ssh, secret_id) else {
        return Ok(None);
    };
    ssh.get(SSH_PUBLIC_KEY)
        .map(|key| Some(key.to_string()))
        .ok_or_else(|| SecretError::MissingKey {
            secret_id: secret_id.to_string(),
            key: SSH_PUBLIC_KEY.to_string(),
        })
}

/// Treat "already gone" as success for deletions
fn tolerate_missing(result: Result<(), CloudError>, resource: &str) -> Result<(), StepError> {
    match result {
        Err(e) if e.is_not_found() => {
            info!(resource = %resource, "Resource already absent");
            Ok(())
        }
        other => other.map_err(StepError::from),
    }
}

/// Missing step input that an earlier step should have produced
fn missing_input(what: &str) -> StepError {
    StepError::Failed(format!("{} is not available, an earlier step did not run", what))
}
