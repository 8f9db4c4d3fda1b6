//! Leader election using Kubernetes Leases
//!
//! Candidates race to write themselves into a single Lease. Writes are
//! conditional on the lease's resourceVersion, so when two candidates read
//! the same expired lease only one update lands; the other gets a conflict
//! and stays a follower.
//!
//! # State machine
//!
//! ```text
//! Follower --(lease acquired)--> Leader --(renew deadline missed | released)--> Terminated
//! Follower --(lease held by other)--> Follower   (on_new_leader only)
//! ```
//!
//! There is no way back from Leader to Follower inside one process. Losing
//! leadership is reported as a [`FatalShutdown`](crate::lifecycle::FatalShutdown)
//! and the process is expected to restart into a fresh election.
//!
//! # Expiry
//!
//! A follower does not compare the holder's renew timestamp against its own
//! clock. It remembers the local instant at which it last saw the record
//! change and treats the lease as expired once `lease_duration` has passed
//! since then, which keeps clock skew between nodes out of the picture.

mod elector;
mod session;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::client::ClusterClient;
use crate::lease::LeaseKey;
use crate::{Error, DEFAULT_LEASE_LOCK_NAME, DEFAULT_NAMESPACE};

pub use elector::{resolve_identity, LeaderElector};

/// Default time non-leaders wait before forcing acquisition of an unrenewed lease
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(15);

/// Default time the leader keeps retrying a renewal before giving up
pub const DEFAULT_RENEW_DEADLINE: Duration = Duration::from_secs(10);

/// Default wait between acquire and renew attempts
pub const DEFAULT_RETRY_PERIOD: Duration = Duration::from_secs(2);

/// The renew deadline must exceed the retry period by this factor
pub const JITTER_FACTOR: f64 = 1.2;

/// Service account namespace file mounted into every pod
const SERVICE_ACCOUNT_NAMESPACE_PATH: &str =
    "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

/// Leader election and watch scoping options
///
/// Unset (or zero) durations and names fall back to the defaults above.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderElectionOptions {
    /// Run an election; when false this process is the sole leader
    pub leader_elect: bool,
    /// Namespace of the lease object
    pub leader_election_namespace: Option<String>,
    /// Lease duration
    pub lease_duration: Option<Duration>,
    /// Renew deadline
    pub renew_deadline: Option<Duration>,
    /// Retry period
    pub retry_period: Option<Duration>,
    /// Name of the lease object
    pub lease_lock_name: Option<String>,
    /// Cluster code handed to the leader callback and to watch handlers
    pub cluster_code: String,
    /// Namespace the leader should watch
    pub namespace: String,
    /// Label selector the leader should watch with
    pub label_selector: String,
}

impl Default for LeaderElectionOptions {
    fn default() -> Self {
        Self {
            leader_elect: true,
            leader_election_namespace: None,
            lease_duration: None,
            renew_deadline: None,
            retry_period: None,
            lease_lock_name: None,
            cluster_code: String::new(),
            namespace: String::new(),
            label_selector: String::new(),
        }
    }
}

impl LeaderElectionOptions {
    /// Effective lease duration
    pub fn lease_duration(&self) -> Duration {
        or_default(self.lease_duration, DEFAULT_LEASE_DURATION)
    }

    /// Effective renew deadline
    pub fn renew_deadline(&self) -> Duration {
        or_default(self.renew_deadline, DEFAULT_RENEW_DEADLINE)
    }

    /// Effective retry period
    pub fn retry_period(&self) -> Duration {
        or_default(self.retry_period, DEFAULT_RETRY_PERIOD)
    }

    /// Effective lease name
    pub fn lock_name(&self) -> &str {
        self.lease_lock_name
            .as_deref()
            .filter(|n| !n.is_empty())
            .unwrap_or(DEFAULT_LEASE_LOCK_NAME)
    }

    /// Key of the lease to contend for, resolving the namespace from the pod environment if unset
    pub fn lease_key(&self) -> LeaseKey {
        let namespace = match self
            .leader_election_namespace
            .as_deref()
            .filter(|ns| !ns.is_empty())
        {
            Some(ns) => ns.to_string(),
            None => default_namespace(),
        };
        LeaseKey::new(self.lock_name(), namespace)
    }

    /// Effective timing, validated
    pub fn timing(&self) -> Result<ElectionTiming, Error> {
        let timing = ElectionTiming {
            lease_duration: self.lease_duration(),
            renew_deadline: self.renew_deadline(),
            retry_period: self.retry_period(),
        };
        timing.validate()?;
        Ok(timing)
    }
}

fn or_default(value: Option<Duration>, default: Duration) -> Duration {
    value.filter(|d| !d.is_zero()).unwrap_or(default)
}

/// Resolved election timing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElectionTiming {
    /// How long a lease stays valid without renewal
    pub lease_duration: Duration,
    /// How long the leader may spend on one renewal round
    pub renew_deadline: Duration,
    /// Wait between attempts
    pub retry_period: Duration,
}

impl Default for ElectionTiming {
    fn default() -> Self {
        Self {
            lease_duration: DEFAULT_LEASE_DURATION,
            renew_deadline: DEFAULT_RENEW_DEADLINE,
            retry_period: DEFAULT_RETRY_PERIOD,
        }
    }
}

impl ElectionTiming {
    /// Check the ordering `lease_duration > renew_deadline > JITTER_FACTOR * retry_period`
    pub fn validate(&self) -> Result<(), Error> {
        if self.retry_period.is_zero() {
            return Err(Error::validation_for_field(
                "retry_period",
                "retry period must be greater than zero",
            ));
        }
        if self.lease_duration <= self.renew_deadline {
            return Err(Error::validation_for_field(
                "lease_duration",
                format!(
                    "lease duration {:?} must be greater than renew deadline {:?}",
                    self.lease_duration, self.renew_deadline
                ),
            ));
        }
        if self.renew_deadline <= self.retry_period.mul_f64(JITTER_FACTOR) {
            return Err(Error::validation_for_field(
                "renew_deadline",
                format!(
                    "renew deadline {:?} must be greater than {JITTER_FACTOR} x retry period {:?}",
                    self.renew_deadline, self.retry_period
                ),
            ));
        }
        Ok(())
    }
}

/// Namespace of the running pod, or `default` outside a cluster
pub fn default_namespace() -> String {
    resolve_namespace(
        std::env::var("POD_NAMESPACE").ok(),
        std::fs::read_to_string(SERVICE_ACCOUNT_NAMESPACE_PATH).ok(),
    )
}

fn resolve_namespace(env: Option<String>, service_account: Option<String>) -> String {
    [env, service_account]
        .into_iter()
        .flatten()
        .map(|ns| ns.trim().to_string())
        .find(|ns| !ns.is_empty())
        .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string())
}

/// Application hooks driven by the elector
#[async_trait]
pub trait LeaderCallback: Send + Sync {
    /// Called once this process becomes leader
    ///
    /// `ctx` is cancelled when leadership ends. An error here is fatal: the
    /// elector reports [`FatalShutdown::StartupFailed`](crate::lifecycle::FatalShutdown)
    /// instead of retrying.
    async fn on_started_leading(
        &self,
        ctx: CancellationToken,
        cluster_code: &str,
        namespace: &str,
        label_selector: &str,
        client: Arc<dyn ClusterClient>,
    ) -> Result<(), Error>;

    /// Called when this process stops leading, just before the fatal shutdown is reported
    async fn on_stopped_leading(&self);

    /// Called when a follower observes a new leader other than itself
    fn on_new_leader(&self, identity: &str) {
        info!(leader = %identity, "new leader");
    }
}
