//! capa-gc - garbage collection of cloud resources created from inside CAPA clusters
//!
//! Workloads running in a cluster create AWS resources the cluster API
//! provider never sees: the cloud-controller-manager provisions load
//! balancers, target groups and security groups for `Service` objects of type
//! `LoadBalancer`. Once the cluster is being deleted nothing inside it is left
//! to remove them, and they block teardown of the VPC. This crate finds them
//! by tag, decides which ones the cluster owns, and deletes those in
//! dependency order.
//!
//! # Modules
//!
//! - [`tags`] - Ownership tag convention (`kubernetes.io/cluster/<id>`)
//! - [`tasks`] - Per-cluster GC task annotation parsing
//! - [`resource`] - Tracked resources and ARN parsing
//! - [`cloud`] - Cloud API abstraction and error classification
//! - [`discovery`] - Polling and event-driven discovery strategies
//! - [`classify`] - Owned / not owned / ambiguous verdicts
//! - [`order`] - Dependency ordering of detach and delete steps
//! - [`delete`] - Idempotent step execution with retry
//! - [`controller`] - Per-cluster reconcile state machine
//! - [`config`] - Tunables shared by every reconcile
//! - [`retry`] - Exponential backoff with jitter
//! - [`metrics`] - OpenTelemetry instruments
//! - [`testing`] - In-memory cloud for tests
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod classify;
pub mod cloud;
pub mod config;
pub mod controller;
pub mod delete;
pub mod discovery;
pub mod error;
pub mod metrics;
pub mod order;
pub mod resource;
pub mod retry;
pub mod tags;
pub mod tasks;
pub mod testing;

pub use classify::{classify, AmbiguousReason, NotOwnedReason, Ownership};
pub use cloud::{CloudApi, CloudError, CloudErrorKind};
pub use config::GcConfig;
pub use controller::{GcController, GcRequest, GcRunResult, GcState, RemainingReason};
pub use discovery::{DiscoveryStrategy, ResourceDiscoverer, StrategySelector};
pub use error::Error;
pub use resource::TrackedResource;
pub use tasks::{GcTaskKind, GcTaskSet};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
