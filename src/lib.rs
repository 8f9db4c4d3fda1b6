//! Steward - single-leader coordination and resource watches for Kubernetes controllers
//!
//! Redundant controller processes elect one leader through a
//! `coordination.k8s.io/v1` Lease. Only the leader runs privileged work, and
//! it typically starts watch subscriptions that stream pod and replica set
//! changes into application handlers.
//!
//! # Modules
//!
//! - [`election`] - Lease-based leader election state machine
//! - [`lease`] - Lease records and the compare-and-swap store abstraction
//! - [`watch`] - Watch subscriptions, event handlers, pod and replica set clients
//! - [`client`] - Cluster client capability and its kube-rs adapter
//! - [`fake`] - In-memory cluster client for tests and local runs
//! - [`kubeconfig`] - Client configuration from kubeconfig content or paths
//! - [`lifecycle`] - Shutdown signals and fatal exit policy
//! - [`telemetry`] - Tracing subscriber setup
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod client;
pub mod election;
pub mod error;
pub mod fake;
pub mod kubeconfig;
pub mod lease;
pub mod lifecycle;
pub mod telemetry;
pub mod watch;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// Lease name used when no lock name is configured
pub const DEFAULT_LEASE_LOCK_NAME: &str = "default-kubernetes-lock";

/// Namespace used when neither configuration nor the pod environment names one
pub const DEFAULT_NAMESPACE: &str = "default";

/// Field manager recorded on lease and resource writes
pub const FIELD_MANAGER: &str = "steward";
