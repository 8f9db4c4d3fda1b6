//! Per-process election state machine

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{ElectionTiming, LeaderCallback, LeaderElectionOptions};
use crate::client::ClusterClient;
use crate::lease::{LeaseKey, LeaseRecord, LeaseStore};
use crate::lifecycle::{FatalShutdown, ShutdownSender};
use crate::Error;

/// Lease duration written on release so the next candidate can take over at once
const RELEASED_LEASE_DURATION: Duration = Duration::from_secs(1);

/// Role of this process in the election
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    /// Waiting for the lease
    Follower,
    /// Holding the lease
    Leader,
}

/// Why a leader stopped leading
#[derive(Debug, Clone, PartialEq, Eq)]
enum LeadershipEnd {
    /// The session was cancelled and gave the lease up
    Released,
    /// A renewal round did not succeed within the renew deadline
    DeadlineExceeded(Duration),
    /// The leader callback returned an error or panicked
    StartupFailed(String),
}

impl std::fmt::Display for LeadershipEnd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LeadershipEnd::Released => write!(f, "lease released"),
            LeadershipEnd::DeadlineExceeded(deadline) => {
                write!(f, "failed to renew lease within {deadline:?}")
            }
            LeadershipEnd::StartupFailed(reason) => write!(f, "{reason}"),
        }
    }
}

/// Runtime state of one candidate
pub(crate) struct ElectionSession {
    identity: String,
    key: LeaseKey,
    store: Arc<dyn LeaseStore>,
    timing: ElectionTiming,
    role: Role,
    /// Last record seen in the store and the local instant it was first seen
    observed: Option<(LeaseRecord, Instant)>,
    reported_leader: Option<String>,
}

impl ElectionSession {
    pub(crate) fn new(
        identity: String,
        key: LeaseKey,
        store: Arc<dyn LeaseStore>,
        timing: ElectionTiming,
    ) -> Self {
        Self {
            identity,
            key,
            store,
            timing,
            role: Role::Follower,
            observed: None,
            reported_leader: None,
        }
    }

    /// Drive the session from follower to termination
    ///
    /// Returns without reporting anything if cancelled while still a follower.
    pub(crate) async fn run(
        mut self,
        ctx: CancellationToken,
        options: LeaderElectionOptions,
        callback: Arc<dyn LeaderCallback>,
        client: Arc<dyn ClusterClient>,
        shutdown: ShutdownSender,
    ) {
        if !self.acquire(&ctx, callback.as_ref()).await {
            debug!(identity = %self.identity, "Election cancelled before acquiring the lease");
            return;
        }

        info!(identity = %self.identity, role = ?self.role, "Starting leader callback");
        let leader_ctx = ctx.child_token();
        let mut startup = StartupTask::spawn(
            Arc::clone(&callback),
            leader_ctx.clone(),
            &options,
            client,
        );

        let end = self.hold(&ctx, &mut startup).await;
        leader_ctx.cancel();

        match end {
            LeadershipEnd::StartupFailed(reason) => {
                error!(identity = %self.identity, reason = %reason, "Leader startup failed");
                shutdown.send(FatalShutdown::StartupFailed {
                    identity: self.identity.clone(),
                    reason,
                });
            }
            end => {
                if end == LeadershipEnd::Released {
                    self.release_with_deadline().await;
                }
                error!(identity = %self.identity, reason = %end, "stopped leading");
                callback.on_stopped_leading().await;
                shutdown.send(FatalShutdown::LeadershipLost {
                    identity: self.identity.clone(),
                    reason: end.to_string(),
                });
            }
        }
    }

    /// Retry until the lease is ours; `false` if cancelled first
    async fn acquire(&mut self, ctx: &CancellationToken, callback: &dyn LeaderCallback) -> bool {
        info!(
            identity = %self.identity,
            lease = %self.key,
            "Attempting to acquire leader lease"
        );

        loop {
            let attempt = tokio::select! {
                biased;
                _ = ctx.cancelled() => return false,
                attempt = self.try_acquire_or_renew() => attempt,
            };

            match attempt {
                Ok(true) => {
                    self.role = Role::Leader;
                    info!(identity = %self.identity, lease = %self.key, "Successfully acquired lease");
                    return true;
                }
                Ok(false) => {
                    debug!(
                        identity = %self.identity,
                        retry_secs = self.timing.retry_period.as_secs_f64(),
                        "Lease held by another, waiting"
                    );
                }
                Err(e) => {
                    warn!(
                        identity = %self.identity,
                        error = %e,
                        retry_secs = self.timing.retry_period.as_secs_f64(),
                        "Failed to acquire lease, retrying"
                    );
                }
            }

            self.report_new_leader(callback);

            tokio::select! {
                _ = ctx.cancelled() => return false,
                _ = tokio::time::sleep(self.timing.retry_period) => {}
            }
        }
    }

    /// Renew every retry period until a round misses its deadline or the session ends
    async fn hold(
        &mut self,
        ctx: &CancellationToken,
        startup: &mut StartupTask,
    ) -> LeadershipEnd {
        loop {
            if let Some(end) = self.wait_retry_period(ctx, startup).await {
                return end;
            }

            let deadline = self.timing.renew_deadline;
            match tokio::time::timeout(deadline, self.renew_round(ctx)).await {
                Ok(true) => debug!(identity = %self.identity, "Lease renewed"),
                Ok(false) => return LeadershipEnd::Released,
                Err(_) => {
                    warn!(
                        identity = %self.identity,
                        deadline_secs = deadline.as_secs_f64(),
                        "Renew deadline exceeded, giving up leadership"
                    );
                    return LeadershipEnd::DeadlineExceeded(deadline);
                }
            }
        }
    }

    /// Sleep one retry period while watching for cancellation and startup failure
    async fn wait_retry_period(
        &self,
        ctx: &CancellationToken,
        startup: &mut StartupTask,
    ) -> Option<LeadershipEnd> {
        let tick = tokio::time::sleep(self.timing.retry_period);
        tokio::pin!(tick);

        loop {
            tokio::select! {
                _ = ctx.cancelled() => return Some(LeadershipEnd::Released),
                outcome = startup.wait(), if startup.is_pending() => {
                    if let Err(reason) = outcome {
                        return Some(LeadershipEnd::StartupFailed(reason));
                    }
                }
                _ = &mut tick => return None,
            }
        }
    }

    /// Retry renewal until it succeeds; `false` if cancelled first
    async fn renew_round(&mut self, ctx: &CancellationToken) -> bool {
        loop {
            let attempt = tokio::select! {
                biased;
                _ = ctx.cancelled() => return false,
                attempt = self.try_acquire_or_renew() => attempt,
            };

            match attempt {
                Ok(true) => return true,
                Ok(false) => {
                    warn!(identity = %self.identity, "Lease renewal rejected, lease changed hands");
                }
                Err(e) => {
                    warn!(identity = %self.identity, error = %e, "Failed to renew lease");
                }
            }

            tokio::select! {
                _ = ctx.cancelled() => return false,
                _ = tokio::time::sleep(self.timing.retry_period) => {}
            }
        }
    }

    /// One acquire-or-renew attempt against the store
    ///
    /// `Ok(false)` means someone else validly holds the lease or won a
    /// concurrent write; errors are store failures.
    pub(crate) async fn try_acquire_or_renew(&mut self) -> Result<bool, Error> {
        let now = Instant::now();
        let wall = Utc::now();

        let Some(existing) = self.store.get().await? else {
            let record = LeaseRecord {
                holder_identity: Some(self.identity.clone()),
                lease_duration: self.timing.lease_duration,
                acquire_time: Some(wall),
                renew_time: Some(wall),
                lease_transitions: 0,
                resource_version: None,
            };
            return match self.store.create(record).await {
                Ok(created) => {
                    info!(identity = %self.identity, lease = %self.key, "Created new lease");
                    self.observe(created, now);
                    Ok(true)
                }
                Err(e) if e.is_conflict() => {
                    debug!(identity = %self.identity, "Lease creation conflict, will retry");
                    Ok(false)
                }
                Err(e) => Err(e),
            };
        };

        self.observe(existing.clone(), now);

        let held_by_self = existing.is_held_by(&self.identity);
        if !held_by_self && existing.holder().is_some() && !self.observed_expired(now) {
            return Ok(false);
        }

        let (acquire_time, lease_transitions) = if held_by_self {
            (existing.acquire_time, existing.lease_transitions)
        } else {
            (Some(wall), existing.lease_transitions + 1)
        };
        let record = LeaseRecord {
            holder_identity: Some(self.identity.clone()),
            lease_duration: self.timing.lease_duration,
            acquire_time,
            renew_time: Some(wall),
            lease_transitions,
            resource_version: existing.resource_version.clone(),
        };

        match self.store.update(record).await {
            Ok(updated) => {
                if !held_by_self {
                    info!(
                        identity = %self.identity,
                        previous = existing.holder().unwrap_or("<none>"),
                        transitions = lease_transitions,
                        "Took over lease"
                    );
                }
                self.observe(updated, now);
                Ok(true)
            }
            Err(e) if e.is_conflict() => {
                debug!(identity = %self.identity, "Lease update conflict, will retry");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Give the lease up so a standby does not have to wait for expiry
    async fn release(&mut self) -> Result<(), Error> {
        let Some((observed, _)) = self.observed.as_ref() else {
            return Ok(());
        };
        if !observed.is_held_by(&self.identity) {
            debug!(identity = %self.identity, "Not the lease holder, nothing to release");
            return Ok(());
        }

        let now = Utc::now();
        let record = LeaseRecord {
            holder_identity: None,
            lease_duration: RELEASED_LEASE_DURATION,
            acquire_time: Some(now),
            renew_time: Some(now),
            lease_transitions: observed.lease_transitions,
            resource_version: observed.resource_version.clone(),
        };

        let released = self.store.update(record).await?;
        self.observe(released, Instant::now());
        info!(identity = %self.identity, lease = %self.key, "Lease released for fast failover");
        Ok(())
    }

    async fn release_with_deadline(&mut self) {
        let deadline = self.timing.renew_deadline;
        match tokio::time::timeout(deadline, self.release()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(identity = %self.identity, error = %e, "Failed to release lease"),
            Err(_) => warn!(identity = %self.identity, "Timed out releasing lease"),
        }
    }

    /// Remember `record`, restarting the expiry clock only if it changed
    fn observe(&mut self, record: LeaseRecord, now: Instant) {
        match &self.observed {
            Some((seen, _)) if *seen == record => {}
            _ => self.observed = Some((record, now)),
        }
    }

    fn observed_expired(&self, now: Instant) -> bool {
        match &self.observed {
            Some((record, seen_at)) => *seen_at + record.lease_duration <= now,
            None => true,
        }
    }

    /// Tell the callback about a holder change it has not heard of yet
    fn report_new_leader(&mut self, callback: &dyn LeaderCallback) {
        let Some(holder) = self.observed.as_ref().and_then(|(r, _)| r.holder()) else {
            // Released; whoever takes it next is new again
            self.reported_leader = None;
            return;
        };
        if holder == self.identity || self.reported_leader.as_deref() == Some(holder) {
            return;
        }
        let holder = holder.to_string();
        callback.on_new_leader(&holder);
        self.reported_leader = Some(holder);
    }

    #[cfg(test)]
    pub(crate) fn role(&self) -> Role {
        self.role
    }
}

/// The leader callback running in the background
struct StartupTask {
    handle: Option<JoinHandle<Result<(), Error>>>,
}

impl StartupTask {
    fn spawn(
        callback: Arc<dyn LeaderCallback>,
        ctx: CancellationToken,
        options: &LeaderElectionOptions,
        client: Arc<dyn ClusterClient>,
    ) -> Self {
        let cluster_code = options.cluster_code.clone();
        let namespace = options.namespace.clone();
        let label_selector = options.label_selector.clone();

        let handle = tokio::spawn(async move {
            callback
                .on_started_leading(ctx, &cluster_code, &namespace, &label_selector, client)
                .await
        });
        Self {
            handle: Some(handle),
        }
    }

    fn is_pending(&self) -> bool {
        self.handle.is_some()
    }

    /// Wait for the callback to finish; cancel-safe
    async fn wait(&mut self) -> Result<(), String> {
        let Some(handle) = self.handle.as_mut() else {
            return Ok(());
        };
        let result = handle.await;
        self.handle = None;

        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(e) => Err(format!("leader callback panicked: {e}")),
        }
    }
}
