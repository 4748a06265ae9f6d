use crate::error::SecretError;
use crate::lifecycle::SecretResolver;
use crate::model::Credentials;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::api::Api;
use kube::Client;
use std::collections::BTreeMap;

/// Resolves organization secrets from Kubernetes `Secret`s
///
/// Each organization owns one namespace, `{prefix}{organization}`; the secret
/// id is the `Secret` name inside it.
#[derive(Clone)]
pub struct KubeSecretResolver {
    client: Client,
    namespace_prefix: String,
}

impl KubeSecretResolver {
    pub fn new(client: Client, namespace_prefix: impl Into<String>) -> Self {
        Self {
            client,
            namespace_prefix: namespace_prefix.into(),
        }
    }

    pub fn namespace_for(&self, organization: &str) -> String {
        organization_namespace(&self.namespace_prefix, organization)
    }
}

pub(crate) fn organization_namespace(prefix: &str, organization: &str) -> String {
    format!("{}{}", prefix, organization)
}

/// Decode the `data` of a secret into credential values
pub(crate) fn decode_secret(secret_id: &str, secret: Secret) -> Result<Credentials, SecretError> {
    let mut values = BTreeMap::new();
    for (key, value) in secret.data.unwrap_or_default() {
        let text = String::from_utf8(value.0).map_err(|_| {
            SecretError::Backend(format!("key {} of secret {} is not UTF-8", key, secret_id))
        })?;
        values.insert(key, text);
    }
    // stringData is write-only on the API server but shows up in fixtures
    for (key, value) in secret.string_data.unwrap_or_default() {
        values.entry(key).or_insert(value);
    }
    Ok(Credentials::new(values))
}

#[async_trait]
impl SecretResolver for KubeSecretResolver {
    async fn get_secret(
        &self,
        organization: &str,
        secret_id: &str,
    ) -> Result<Credentials, SecretError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &self.namespace_for(organization));
        match api.get(secret_id).await {
            Ok(secret) => decode_secret(secret_id, secret),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Err(SecretError::NotFound {
                organization: organization.to_string(),
                secret_id: secret_id.to_string(),
            }),
            Err(e) => Err(SecretError::Backend(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)] // Tests can use unwrap for brevity

    use super::*;
    use k8s_openapi::ByteString;

    #[test]
    fn test_namespace_per_organization() {
        assert_eq!(organization_namespace("org-", "acme"), "org-acme");
        assert_eq!(organization_namespace("", "acme"), "acme");
    }

    #[test]
    fn test_decode_secret_data() {
        let secret = Secret {
            data: Some(BTreeMap::from([(
                "access_key_id".to_string(),
                ByteString(b"AKIA".to_vec()),
            )])),
            string_data: Some(BTreeMap::from([
                ("region".to_string(), "eu-west-1".to_string()),
                ("access_key_id".to_string(), "ignored".to_string()),
            ])),
            ..Default::default()
        };

        let credentials = decode_secret("aws", secret).unwrap();

        assert_eq!(credentials.get("access_key_id"), Some("AKIA"));
        assert_eq!(credentials.get("region"), Some("eu-west-1"));
    }

    #[test]
    fn test_non_utf8_value_is_backend_error() {
        let secret = Secret {
            data: Some(BTreeMap::from([(
                "public_key".to_string(),
                ByteString(vec![0xff, 0xfe]),
            )])),
            ..Default::default()
        };

        let err = decode_secret("ssh", secret).unwrap_err();

        assert!(matches!(err, SecretError::Backend(message) if message.contains("public_key")));
    }
}
