//! Entry point wiring options, identity and the session task together

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::session::ElectionSession;
use super::{LeaderCallback, LeaderElectionOptions};
use crate::client::ClusterClient;
use crate::lifecycle::{FatalShutdown, ShutdownSender};
use crate::Error;

/// Time allowed for leader callbacks to wind down once `stop` resolves
///
/// With election enabled the session also gets its release window
/// (`renew_deadline`) on top of this.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

const HOSTNAME_FILES: &[&str] = &["/proc/sys/kernel/hostname", "/etc/hostname"];

/// Runs the leader callback on exactly one process of a replicated deployment
pub struct LeaderElector {
    client: Arc<dyn ClusterClient>,
    shutdown: ShutdownSender,
    identity: Option<String>,
}

impl LeaderElector {
    /// Create an elector that contends through `client` and reports fatal conditions on `shutdown`
    pub fn new(client: Arc<dyn ClusterClient>, shutdown: ShutdownSender) -> Self {
        Self {
            client,
            shutdown,
            identity: None,
        }
    }

    /// Use a fixed candidate identity instead of the hostname
    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    /// Start the election (or single-instance mode) and block until `stop` resolves
    ///
    /// Configuration and identity errors are returned before anything is
    /// spawned. Leadership loss and leader startup failure are not errors of
    /// `run`; they are reported on the shutdown channel.
    pub async fn run<F>(
        &self,
        ctx: CancellationToken,
        options: LeaderElectionOptions,
        callback: Arc<dyn LeaderCallback>,
        stop: F,
    ) -> Result<(), Error>
    where
        F: Future<Output = ()> + Send,
    {
        let ctx = ctx.child_token();
        let _guard = ctx.clone().drop_guard();

        let (task, grace) = if options.leader_elect {
            self.spawn_election(&ctx, options, callback)?
        } else {
            (
                self.spawn_single_instance(&ctx, options, callback),
                SHUTDOWN_GRACE,
            )
        };

        stop.await;
        info!("Shutting down workers");
        ctx.cancel();
        join_with_grace(task, grace).await;
        Ok(())
    }

    fn spawn_election(
        &self,
        ctx: &CancellationToken,
        options: LeaderElectionOptions,
        callback: Arc<dyn LeaderCallback>,
    ) -> Result<(JoinHandle<()>, Duration), Error> {
        let timing = options.timing()?;
        let identity = match &self.identity {
            Some(identity) if !identity.is_empty() => identity.clone(),
            _ => resolve_identity()?,
        };
        let key = options.lease_key();

        info!(
            identity = %identity,
            lease = %key,
            lease_duration_secs = timing.lease_duration.as_secs(),
            renew_deadline_secs = timing.renew_deadline.as_secs(),
            retry_period_secs = timing.retry_period.as_secs(),
            "Starting leader election"
        );

        let store = self.client.lease_store(&key);
        let session = ElectionSession::new(identity, key, store, timing);
        let task = tokio::spawn(session.run(
            ctx.clone(),
            options,
            callback,
            Arc::clone(&self.client),
            self.shutdown.clone(),
        ));
        Ok((task, timing.renew_deadline + SHUTDOWN_GRACE))
    }

    fn spawn_single_instance(
        &self,
        ctx: &CancellationToken,
        options: LeaderElectionOptions,
        callback: Arc<dyn LeaderCallback>,
    ) -> JoinHandle<()> {
        info!("Leader election is turned off. Running in single-instance mode");

        let ctx = ctx.clone();
        let client = Arc::clone(&self.client);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let started = tokio::spawn({
                let ctx = ctx.clone();
                async move {
                    callback
                        .on_started_leading(
                            ctx,
                            &options.cluster_code,
                            &options.namespace,
                            &options.label_selector,
                            client,
                        )
                        .await
                }
            });

            let reason = match started.await {
                Ok(Ok(())) => return,
                Ok(Err(e)) => e.to_string(),
                Err(e) => format!("leader callback panicked: {e}"),
            };
            error!(reason = %reason, "Startup callback failed in single-instance mode");
            ctx.cancel();
            shutdown.send(FatalShutdown::StartupFailed {
                identity: single_instance_identity(),
                reason,
            });
        })
    }
}

async fn join_with_grace(mut task: JoinHandle<()>, grace: Duration) {
    match tokio::time::timeout(grace, &mut task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Election task failed"),
        Err(_) => {
            warn!(
                grace_secs = grace.as_secs_f64(),
                "Election task did not stop in time, aborting"
            );
            task.abort();
        }
    }
}

fn single_instance_identity() -> String {
    resolve_identity().unwrap_or_else(|_| "single-instance".to_string())
}

/// Candidate identity for this process, derived from the hostname
pub fn resolve_identity() -> Result<String, Error> {
    let files = HOSTNAME_FILES
        .iter()
        .map(|path| std::fs::read_to_string(path).ok());
    identity_from(std::env::var("HOSTNAME").ok(), files)
}

fn identity_from(
    env: Option<String>,
    files: impl IntoIterator<Item = Option<String>>,
) -> Result<String, Error> {
    std::iter::once(env)
        .chain(files)
        .flatten()
        .map(|name| name.trim().to_string())
        .find(|name| !name.is_empty())
        .ok_or_else(|| Error::identity("unable to determine hostname for leader election"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::MemoryClusterClient;
    use crate::lifecycle::fatal_channel;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingCallback {
        started: AtomicUsize,
        fail: bool,
    }

    impl CountingCallback {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                started: AtomicUsize::new(0),
                fail,
            })
        }
    }

    #[async_trait]
    impl LeaderCallback for CountingCallback {
        async fn on_started_leading(
            &self,
            _ctx: CancellationToken,
            _cluster_code: &str,
            _namespace: &str,
            _label_selector: &str,
            _client: Arc<dyn ClusterClient>,
        ) -> Result<(), Error> {
            self.started.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Error::callback("on_started_leading", "informer sync failed"));
            }
            Ok(())
        }

        async fn on_stopped_leading(&self) {}
    }

    #[test]
    fn identity_prefers_env_then_files() {
        assert_eq!(
            identity_from(Some("pod-a".into()), [Some("node".into())]).unwrap(),
            "pod-a"
        );
        assert_eq!(
            identity_from(None, [None, Some("node-b\n".into())]).unwrap(),
            "node-b"
        );
        assert_eq!(
            identity_from(Some(" ".into()), [Some("node-c".into())]).unwrap(),
            "node-c"
        );
    }

    #[test]
    fn missing_hostname_is_an_identity_error() {
        let err = identity_from(None, [None, Some(String::new())]).unwrap_err();
        assert!(matches!(err, Error::Identity { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_timing_fails_before_touching_the_lease() {
        let cluster = Arc::new(MemoryClusterClient::new());
        let (tx, mut rx) = fatal_channel();
        let elector = LeaderElector::new(cluster.clone(), tx).with_identity("a");
        let callback = CountingCallback::new(false);

        let options = LeaderElectionOptions {
            lease_duration: Some(Duration::from_secs(5)),
            ..Default::default()
        };
        let result = elector
            .run(CancellationToken::new(), options, callback.clone(), async {})
            .await;

        assert!(matches!(result, Err(Error::Validation { .. })));
        assert_eq!(cluster.lease_count(), 0);
        assert_eq!(callback.started.load(Ordering::SeqCst), 0);
        assert!(rx.try_recv().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn single_instance_mode_runs_callback_once_without_lease() {
        let cluster = Arc::new(MemoryClusterClient::new());
        let (tx, mut rx) = fatal_channel();
        let elector = LeaderElector::new(cluster.clone(), tx);
        let callback = CountingCallback::new(false);

        let options = LeaderElectionOptions {
            leader_elect: false,
            ..Default::default()
        };
        elector
            .run(
                CancellationToken::new(),
                options,
                callback.clone(),
                tokio::time::sleep(Duration::from_secs(30)),
            )
            .await
            .unwrap();

        assert_eq!(callback.started.load(Ordering::SeqCst), 1);
        assert_eq!(cluster.lease_count(), 0);
        assert!(rx.try_recv().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn single_instance_startup_error_is_fatal() {
        let cluster = Arc::new(MemoryClusterClient::new());
        let (tx, mut rx) = fatal_channel();
        let elector = LeaderElector::new(cluster, tx);

        let options = LeaderElectionOptions {
            leader_elect: false,
            ..Default::default()
        };
        elector
            .run(
                CancellationToken::new(),
                options,
                CountingCallback::new(true),
                tokio::time::sleep(Duration::from_secs(1)),
            )
            .await
            .unwrap();

        let fatal = rx.try_recv().unwrap();
        assert_eq!(fatal.exit_code(), crate::lifecycle::EXIT_STARTUP_CALLBACK_FAILED);
        assert!(fatal.reason().contains("informer sync failed"));
    }
}
