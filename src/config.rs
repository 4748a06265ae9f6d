//! Operator configuration from `PROVISIO_*` environment variables
//!
//! | Variable | Default |
//! |---|---|
//! | `PROVISIO_HEALTH_PORT` | `8080` |
//! | `PROVISIO_STEP_TIMEOUT_SECS` | `3600` (`0` disables the timeout) |
//! | `PROVISIO_DEFAULT_SPOT_PRICE` | `0.0` |
//! | `PROVISIO_DEFAULT_IMAGES` | empty, `location=image,...` |
//! | `PROVISIO_CLOUD_ADAPTER_URL` | `http://localhost:8090` |
//! | `PROVISIO_CLOUD_ADAPTER_TIMEOUT_SECS` | `300` |
//! | `PROVISIO_SECRET_NAMESPACE_PREFIX` | `org-` |
//! | `PROVISIO_REQUEUE_RUNNING_SECS` | `300` |
//! | `PROVISIO_REQUEUE_FAILED_SECS` | `60` |
//! | `PROVISIO_REQUEUE_ERROR_SECS` | `10` |
//! | `PROVISIO_CDEVENTS_ENABLED` | `false` |
//! | `PROVISIO_CDEVENTS_SINK_URL` | unset |

use crate::nodepool::{PoolDefaults, DEFAULT_SPOT_PRICE};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_HEALTH_PORT: u16 = 8080;
pub const DEFAULT_CLOUD_ADAPTER_URL: &str = "http://localhost:8090";
pub const DEFAULT_SECRET_NAMESPACE_PREFIX: &str = "org-";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{variable} has invalid value {value:?}: {reason}")]
    Invalid {
        variable: String,
        value: String,
        reason: String,
    },
}

/// When the controller looks at a cluster again
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequeueIntervals {
    /// Drift check of a Running cluster
    pub running: Duration,
    /// Retry of a Failed or interrupted cluster
    pub failed: Duration,
    /// Backoff after a reconcile error
    pub error: Duration,
}

impl Default for RequeueIntervals {
    fn default() -> Self {
        Self {
            running: Duration::from_secs(300),
            failed: Duration::from_secs(60),
            error: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorConfig {
    pub health_port: u16,
    /// Bound on every step operation; `None` runs steps unbounded
    pub step_timeout: Option<Duration>,
    pub default_spot_price: String,
    /// Default node image per location
    pub default_images: BTreeMap<String, String>,
    pub cloud_adapter_url: String,
    pub cloud_adapter_timeout: Duration,
    /// Organization `acme` keeps its secrets in namespace `{prefix}acme`
    pub secret_namespace_prefix: String,
    pub requeue: RequeueIntervals,
    pub cdevents_enabled: bool,
    pub cdevents_sink_url: Option<String>,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            health_port: DEFAULT_HEALTH_PORT,
            step_timeout: Some(Duration::from_secs(3600)),
            default_spot_price: DEFAULT_SPOT_PRICE.to_string(),
            default_images: BTreeMap::new(),
            cloud_adapter_url: DEFAULT_CLOUD_ADAPTER_URL.to_string(),
            cloud_adapter_timeout: Duration::from_secs(300),
            secret_namespace_prefix: DEFAULT_SECRET_NAMESPACE_PREFIX.to_string(),
            requeue: RequeueIntervals::default(),
            cdevents_enabled: false,
            cdevents_sink_url: None,
        }
    }
}

impl OperatorConfig {
    /// Read the configuration from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read the configuration through `lookup`; unset or empty variables keep their default
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let step_timeout = match get("PROVISIO_STEP_TIMEOUT_SECS") {
            None => defaults.step_timeout,
            Some(raw) => match parse::<u64>("PROVISIO_STEP_TIMEOUT_SECS", &raw)? {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
        };

        Ok(Self {
            health_port: parse_or(&get, "PROVISIO_HEALTH_PORT", defaults.health_port)?,
            step_timeout,
            default_spot_price: get("PROVISIO_DEFAULT_SPOT_PRICE")
                .unwrap_or(defaults.default_spot_price),
            default_images: match get("PROVISIO_DEFAULT_IMAGES") {
                Some(raw) => parse_images(&raw)?,
                None => defaults.default_images,
            },
            cloud_adapter_url: get("PROVISIO_CLOUD_ADAPTER_URL")
                .unwrap_or(defaults.cloud_adapter_url),
            cloud_adapter_timeout: seconds_or(
                &get,
                "PROVISIO_CLOUD_ADAPTER_TIMEOUT_SECS",
                defaults.cloud_adapter_timeout,
            )?,
            secret_namespace_prefix: lookup("PROVISIO_SECRET_NAMESPACE_PREFIX")
                .unwrap_or(defaults.secret_namespace_prefix),
            requeue: RequeueIntervals {
                running: seconds_or(&get, "PROVISIO_REQUEUE_RUNNING_SECS", defaults.requeue.running)?,
                failed: seconds_or(&get, "PROVISIO_REQUEUE_FAILED_SECS", defaults.requeue.failed)?,
                error: seconds_or(&get, "PROVISIO_REQUEUE_ERROR_SECS", defaults.requeue.error)?,
            },
            cdevents_enabled: get("PROVISIO_CDEVENTS_ENABLED")
                .map(|v| v.trim().eq_ignore_ascii_case("true"))
                .unwrap_or(defaults.cdevents_enabled),
            cdevents_sink_url: get("PROVISIO_CDEVENTS_SINK_URL"),
        })
    }

    pub fn pool_defaults(&self) -> PoolDefaults {
        PoolDefaults {
            spot_price: self.default_spot_price.clone(),
            images: self.default_images.clone(),
        }
    }
}

fn parse<T>(variable: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        variable: variable.to_string(),
        value: raw.to_string(),
        reason: e.to_string(),
    })
}

fn parse_or<T, G>(get: &G, variable: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(variable) {
        Some(raw) => parse(variable, &raw),
        None => Ok(default),
    }
}

fn seconds_or<G>(get: &G, variable: &str, default: Duration) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    parse_or(get, variable, default.as_secs()).map(Duration::from_secs)
}

/// `eu-west-1=ami-1, us-east-1=ami-2`
fn parse_images(raw: &str) -> Result<BTreeMap<String, String>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| match entry.split_once('=') {
            Some((location, image)) if !location.trim().is_empty() && !image.trim().is_empty() => {
                Ok((location.trim().to_string(), image.trim().to_string()))
            }
            _ => Err(ConfigError::Invalid {
                variable: "PROVISIO_DEFAULT_IMAGES".to_string(),
                value: raw.to_string(),
                reason: format!("entry {:?} is not location=image", entry),
            }),
        })
        .collect()
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
