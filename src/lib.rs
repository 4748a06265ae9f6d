//! provisio: managed Kubernetes cluster provisioning
//!
//! The core is an ordered, rollback-capable step pipeline ([`pipeline`]) fed
//! by the node pool reconciler ([`nodepool`]). The lifecycle controller
//! ([`lifecycle`]) drives both for every cloud through a provider backend
//! ([`providers`]); the kube-rs operator ([`controller`]) exposes it as the
//! `ManagedCluster` custom resource.

pub mod config;
pub mod controller;
pub mod crd;
pub mod equality;
pub mod error;
pub mod lifecycle;
pub mod model;
pub mod nodepool;
pub mod pipeline;
pub mod providers;
pub mod server;

// Re-export for main.rs tests
pub use crate::controller::{error_policy, reconcile, Context, ReconcileError};
