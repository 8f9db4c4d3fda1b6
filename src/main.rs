//! Steward - leader-elected pod and replica set watcher

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use k8s_openapi::api::apps::v1::ReplicaSet;
use k8s_openapi::api::core::v1::Pod;
use kube::api::WatchEvent;
use kube::ResourceExt;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use steward::client::{ClusterClient, KubeClusterClient};
use steward::election::{LeaderCallback, LeaderElectionOptions, LeaderElector};
use steward::kubeconfig::{create_client, KubeconfigSource};
use steward::lifecycle::{cancel_on_signal, fatal_channel, EXIT_STARTUP_ERROR};
use steward::telemetry::{init_telemetry, TelemetryConfig};
use steward::watch::{
    event_kind, pod_condition_status, PodClient, ReplicaSetClient, WatchEventHandler,
    WatchHandle, Watcher,
};
use steward::Error;

/// Steward - runs pod and replica set watches on a single elected replica
#[derive(Parser, Debug)]
#[command(name = "steward", version, about, long_about = None)]
struct Cli {
    /// Contend for a lease instead of assuming sole leadership
    #[arg(long, env = "LEADER_ELECT", default_value_t = true, action = clap::ArgAction::Set)]
    leader_elect: bool,

    /// Namespace of the lease (defaults to the pod's namespace)
    #[arg(long, env = "LEADER_ELECTION_NAMESPACE")]
    leader_election_namespace: Option<String>,

    /// Name of the lease
    #[arg(long, env = "LEASE_LOCK_NAME")]
    lease_lock_name: Option<String>,

    /// Lease duration in seconds
    #[arg(long, env = "LEASE_DURATION")]
    lease_duration: Option<u64>,

    /// Renew deadline in seconds
    #[arg(long, env = "RENEW_DEADLINE")]
    renew_deadline: Option<u64>,

    /// Retry period in seconds
    #[arg(long, env = "RETRY_PERIOD")]
    retry_period: Option<u64>,

    /// Cluster code passed to watch handlers
    #[arg(long, env = "CLUSTER_CODE", default_value = "")]
    cluster_code: String,

    /// Namespace to watch
    #[arg(long, env = "WATCH_NAMESPACE", default_value = "default")]
    namespace: String,

    /// Label selector for watches (empty matches everything)
    #[arg(long, env = "LABEL_SELECTOR", default_value = "")]
    label_selector: String,

    /// Path to a kubeconfig file
    #[arg(long, env = "KUBECONFIG_PATH")]
    kubeconfig: Option<PathBuf>,

    /// Raw kubeconfig content; takes precedence over --kubeconfig
    #[arg(long, env = "KUBECONFIG_CONTENT", hide_env_values = true)]
    kubeconfig_content: Option<String>,

    /// Emit text logs instead of JSON
    #[arg(long, env = "LOG_TEXT")]
    log_text: bool,
}

impl Cli {
    fn election_options(&self) -> LeaderElectionOptions {
        LeaderElectionOptions {
            leader_elect: self.leader_elect,
            leader_election_namespace: self.leader_election_namespace.clone(),
            lease_duration: self.lease_duration.map(Duration::from_secs),
            renew_deadline: self.renew_deadline.map(Duration::from_secs),
            retry_period: self.retry_period.map(Duration::from_secs),
            lease_lock_name: self.lease_lock_name.clone(),
            cluster_code: self.cluster_code.clone(),
            namespace: self.namespace.clone(),
            label_selector: self.label_selector.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Err(e) = init_telemetry(TelemetryConfig {
        json: !cli.log_text,
        ..Default::default()
    }) {
        eprintln!("{e}");
        std::process::exit(EXIT_STARTUP_ERROR);
    }

    let source = KubeconfigSource::from_options(cli.kubeconfig_content.clone(), cli.kubeconfig.clone());
    let client = match create_client(&source).await {
        Ok(client) => client,
        Err(e) => {
            error!(error = %e, "Failed to create Kubernetes client");
            std::process::exit(EXIT_STARTUP_ERROR);
        }
    };
    let cluster: Arc<dyn ClusterClient> = Arc::new(KubeClusterClient::new(client));

    let root = CancellationToken::new();
    let signals = cancel_on_signal(root.clone());
    let (shutdown_tx, mut shutdown_rx) = fatal_channel();

    let elector = LeaderElector::new(cluster, shutdown_tx);
    let callback = Arc::new(WatchLauncher::default());
    let stop = root.clone().cancelled_owned();

    let outcome = tokio::select! {
        result = elector.run(root.clone(), cli.election_options(), callback, stop) => {
            result.map(|()| shutdown_rx.try_recv())
        }
        fatal = shutdown_rx.recv() => Ok(fatal),
    };
    root.cancel();
    signals.abort();

    match outcome {
        Ok(Some(fatal)) => {
            error!(reason = %fatal, exit_code = fatal.exit_code(), "Exiting");
            std::process::exit(fatal.exit_code());
        }
        Ok(None) => {
            info!("Shutdown complete");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Failed to start leader election");
            std::process::exit(EXIT_STARTUP_ERROR);
        }
    }
}

/// Starts the pod and replica set watches once this replica leads
#[derive(Default)]
struct WatchLauncher {
    handles: Mutex<Vec<WatchHandle>>,
}

#[async_trait]
impl LeaderCallback for WatchLauncher {
    async fn on_started_leading(
        &self,
        ctx: CancellationToken,
        cluster_code: &str,
        namespace: &str,
        label_selector: &str,
        client: Arc<dyn ClusterClient>,
    ) -> Result<(), Error> {
        info!(namespace, label_selector, "Started leading, opening watches");

        let pods = PodClient::new(
            client.pods(namespace),
            cluster_code,
            namespace,
            label_selector,
            Arc::new(PodLogger),
        );
        let replica_sets = ReplicaSetClient::new(
            client.replica_sets(namespace),
            cluster_code,
            namespace,
            label_selector,
            Arc::new(ReplicaSetLogger),
        );

        let pod_handle = pods.do_watch(ctx.clone()).await?;
        let replica_set_handle = replica_sets.do_watch(ctx).await?;
        self.handles.lock().extend([pod_handle, replica_set_handle]);
        Ok(())
    }

    async fn on_stopped_leading(&self) {
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in &handles {
            handle.close();
        }
        info!(watches = handles.len(), "Stopped leading, watches closed");
    }
}

struct PodLogger;

#[async_trait]
impl WatchEventHandler<Pod> for PodLogger {
    async fn handle(
        &self,
        _ctx: &CancellationToken,
        cluster_code: &str,
        event: WatchEvent<Pod>,
    ) -> Result<(), Error> {
        let kind = event_kind(&event);
        match event {
            WatchEvent::Added(pod) | WatchEvent::Modified(pod) | WatchEvent::Deleted(pod) => {
                let conditions = pod_condition_status(&pod);
                info!(
                    cluster = cluster_code,
                    event = kind,
                    pod = %pod.name_any(),
                    ready = ?conditions.ready,
                    scheduled = ?conditions.scheduled,
                    "Pod event"
                );
            }
            WatchEvent::Bookmark(_) => debug!(cluster = cluster_code, "Pod watch bookmark"),
            WatchEvent::Error(status) => {
                return Err(Error::internal_with_context("pod watch", status.message));
            }
        }
        Ok(())
    }
}

struct ReplicaSetLogger;

#[async_trait]
impl WatchEventHandler<ReplicaSet> for ReplicaSetLogger {
    async fn handle(
        &self,
        _ctx: &CancellationToken,
        cluster_code: &str,
        event: WatchEvent<ReplicaSet>,
    ) -> Result<(), Error> {
        let kind = event_kind(&event);
        match event {
            WatchEvent::Added(rs) | WatchEvent::Modified(rs) | WatchEvent::Deleted(rs) => {
                let ready = rs.status.as_ref().and_then(|s| s.ready_replicas).unwrap_or(0);
                info!(
                    cluster = cluster_code,
                    event = kind,
                    replica_set = %rs.name_any(),
                    ready,
                    "ReplicaSet event"
                );
            }
            WatchEvent::Bookmark(_) => {
                debug!(cluster = cluster_code, "ReplicaSet watch bookmark")
            }
            WatchEvent::Error(status) => {
                return Err(Error::internal_with_context(
                    "replica set watch",
                    status.message,
                ));
            }
        }
        Ok(())
    }
}
