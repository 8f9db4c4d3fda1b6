//! Lease records and the compare-and-swap store they live in
//!
//! A [`LeaseRecord`] is the storage-neutral view of a
//! `coordination.k8s.io/v1` Lease. Stores hand out records stamped with an
//! opaque `resource_version`; [`LeaseStore::update`] only succeeds if the
//! stored version still matches, otherwise it fails with
//! [`Error::Conflict`]. That conditional write is the sole mutual exclusion
//! between candidates.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::Error;

const LEASE_KIND: &str = "Lease";

/// Name and namespace of a lease object
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LeaseKey {
    /// Lease object name
    pub name: String,
    /// Namespace the lease lives in
    pub namespace: String,
}

impl LeaseKey {
    /// Create a key for the named lease
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
        }
    }
}

impl std::fmt::Display for LeaseKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Storage-neutral lease contents
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeaseRecord {
    /// Current holder, `None` when released
    pub holder_identity: Option<String>,
    /// How long the holder may go without renewing
    pub lease_duration: Duration,
    /// When the current holder acquired the lease
    pub acquire_time: Option<DateTime<Utc>>,
    /// When the current holder last renewed
    pub renew_time: Option<DateTime<Utc>>,
    /// Number of times the lease changed hands
    pub lease_transitions: i32,
    /// Store version used for compare-and-swap; assigned by the store
    pub resource_version: Option<String>,
}

impl LeaseRecord {
    /// Holder identity, if any
    pub fn holder(&self) -> Option<&str> {
        self.holder_identity.as_deref()
    }

    /// Whether `identity` currently holds this record
    pub fn is_held_by(&self, identity: &str) -> bool {
        self.holder() == Some(identity)
    }
}

/// Compare-and-swap access to a single lease
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Read the lease, `None` if it has never been created
    async fn get(&self) -> Result<Option<LeaseRecord>, Error>;

    /// Create the lease; fails with [`Error::Conflict`] if it already exists
    async fn create(&self, record: LeaseRecord) -> Result<LeaseRecord, Error>;

    /// Replace the lease if `record.resource_version` still matches the stored version
    async fn update(&self, record: LeaseRecord) -> Result<LeaseRecord, Error>;
}

/// Lease store backed by the Kubernetes Lease API
///
/// Uses resourceVersion for compare-and-swap: a replace carrying a stale
/// version is rejected by the API server with 409 Conflict.
pub struct KubeLeaseStore {
    api: Api<Lease>,
    key: LeaseKey,
}

impl KubeLeaseStore {
    /// Create a store for the lease named by `key`
    pub fn new(client: Client, key: LeaseKey) -> Self {
        Self {
            api: Api::namespaced(client, &key.namespace),
            key,
        }
    }
}

#[async_trait]
impl LeaseStore for KubeLeaseStore {
    async fn get(&self) -> Result<Option<LeaseRecord>, Error> {
        let lease = self
            .api
            .get_opt(&self.key.name)
            .await
            .map_err(|e| Error::from_kube(LEASE_KIND, &self.key.name, e))?;
        Ok(lease.as_ref().map(record_from_lease))
    }

    async fn create(&self, record: LeaseRecord) -> Result<LeaseRecord, Error> {
        let lease = lease_from_record(&self.key, &record);
        let created = self
            .api
            .create(&post_params(), &lease)
            .await
            .map_err(|e| Error::from_kube(LEASE_KIND, &self.key.name, e))?;
        debug!(lease = %self.key, "Created lease");
        Ok(record_from_lease(&created))
    }

    async fn update(&self, record: LeaseRecord) -> Result<LeaseRecord, Error> {
        if record.resource_version.is_none() {
            return Err(Error::validation_for_field(
                "resource_version",
                format!("lease {} update without resourceVersion", self.key),
            ));
        }

        let lease = lease_from_record(&self.key, &record);
        let replaced = self
            .api
            .replace(&self.key.name, &post_params(), &lease)
            .await
            .map_err(|e| Error::from_kube(LEASE_KIND, &self.key.name, e))?;
        Ok(record_from_lease(&replaced))
    }
}

/// Convert a Kubernetes Lease into a record
pub fn record_from_lease(lease: &Lease) -> LeaseRecord {
    let spec = lease.spec.as_ref();
    let duration_secs = spec
        .and_then(|s| s.lease_duration_seconds)
        .unwrap_or(0)
        .max(0);

    LeaseRecord {
        holder_identity: spec
            .and_then(|s| s.holder_identity.clone())
            .filter(|h| !h.is_empty()),
        lease_duration: Duration::from_secs(duration_secs as u64),
        acquire_time: spec.and_then(|s| s.acquire_time.as_ref()).map(|t| t.0),
        renew_time: spec.and_then(|s| s.renew_time.as_ref()).map(|t| t.0),
        lease_transitions: spec.and_then(|s| s.lease_transitions).unwrap_or(0),
        resource_version: lease.metadata.resource_version.clone(),
    }
}

/// Convert a record into a Kubernetes Lease for `key`
pub fn lease_from_record(key: &LeaseKey, record: &LeaseRecord) -> Lease {
    // Leases store whole seconds; never round a live lease down to zero
    let duration_secs = record.lease_duration.as_secs().max(1).min(i32::MAX as u64) as i32;

    Lease {
        metadata: ObjectMeta {
            name: Some(key.name.clone()),
            namespace: Some(key.namespace.clone()),
            resource_version: record.resource_version.clone(),
            ..Default::default()
        },
        spec: Some(LeaseSpec {
            holder_identity: record.holder_identity.clone(),
            lease_duration_seconds: Some(duration_secs),
            acquire_time: record.acquire_time.map(MicroTime),
            renew_time: record.renew_time.map(MicroTime),
            lease_transitions: Some(record.lease_transitions),
            ..Default::default()
        }),
    }
}

fn post_params() -> PostParams {
    PostParams {
        field_manager: Some(crate::FIELD_MANAGER.to_string()),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> LeaseRecord {
        let now = Utc::now();
        LeaseRecord {
            holder_identity: Some("pod-a".to_string()),
            lease_duration: Duration::from_secs(15),
            acquire_time: Some(now),
            renew_time: Some(now),
            lease_transitions: 3,
            resource_version: Some("42".to_string()),
        }
    }

    #[test]
    fn lease_conversion_keeps_holder_and_version() {
        let key = LeaseKey::new("lock", "ops");
        let record = sample_record();

        let lease = lease_from_record(&key, &record);
        assert_eq!(lease.metadata.name.as_deref(), Some("lock"));
        assert_eq!(lease.metadata.namespace.as_deref(), Some("ops"));

        let back = record_from_lease(&lease);
        assert_eq!(back, record);
    }

    #[test]
    fn empty_holder_reads_as_released() {
        let lease = Lease {
            metadata: ObjectMeta::default(),
            spec: Some(LeaseSpec {
                holder_identity: Some(String::new()),
                ..Default::default()
            }),
        };

        let record = record_from_lease(&lease);
        assert_eq!(record.holder(), None);
        assert_eq!(record.lease_duration, Duration::ZERO);
    }

    #[test]
    fn sub_second_durations_round_up() {
        let key = LeaseKey::new("lock", "ops");
        let record = LeaseRecord {
            lease_duration: Duration::from_millis(200),
            ..Default::default()
        };

        let lease = lease_from_record(&key, &record);
        let spec = lease.spec.unwrap_or_default();
        assert_eq!(spec.lease_duration_seconds, Some(1));
    }

    #[test]
    fn key_displays_as_namespace_and_name() {
        assert_eq!(LeaseKey::new("lock", "ops").to_string(), "ops/lock");
    }

    #[test]
    fn holder_checks() {
        let record = sample_record();
        assert!(record.is_held_by("pod-a"));
        assert!(!record.is_held_by("pod-b"));
        assert!(!LeaseRecord::default().is_held_by("pod-a"));
    }
}
