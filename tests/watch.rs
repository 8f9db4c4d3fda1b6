//! Watch subscriptions driven through the cluster client

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{ReplicaSet, ReplicaSetSpec};
use k8s_openapi::api::core::v1::{Pod, PodCondition, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::WatchEvent;
use kube::ResourceExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use steward::client::ClusterClient;
use steward::election::{LeaderCallback, LeaderElectionOptions, LeaderElector};
use steward::fake::MemoryClusterClient;
use steward::lifecycle::fatal_channel;
use steward::watch::{
    event_kind, pod_condition_status, ConditionStatus, PodClient, PodConditionStatuses,
    ReplicaSetClient, WatchEventHandler, WatchHandle, Watcher,
};
use steward::Error;

// =============================================================================
// Test Fixtures
// =============================================================================

fn pod(name: &str, conditions: &[(&str, &str)]) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("apps".to_string()),
            ..Default::default()
        },
        status: Some(PodStatus {
            conditions: Some(
                conditions
                    .iter()
                    .map(|(type_, status)| PodCondition {
                        type_: type_.to_string(),
                        status: status.to_string(),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn replica_set(name: &str, replicas: i32) -> ReplicaSet {
    ReplicaSet {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("apps".to_string()),
            ..Default::default()
        },
        spec: Some(ReplicaSetSpec {
            replicas: Some(replicas),
            ..Default::default()
        }),
        ..Default::default()
    }
}

type Observation = (String, String, PodConditionStatuses);

/// Forwards (event kind, pod name, conditions) for every pod event
struct ConditionCollector {
    tx: mpsc::UnboundedSender<Observation>,
}

#[async_trait]
impl WatchEventHandler<Pod> for ConditionCollector {
    async fn handle(
        &self,
        _ctx: &CancellationToken,
        _cluster_code: &str,
        event: WatchEvent<Pod>,
    ) -> Result<(), Error> {
        let kind = event_kind(&event).to_string();
        if let WatchEvent::Added(p) | WatchEvent::Modified(p) | WatchEvent::Deleted(p) = event {
            let _ = self.tx.send((kind, p.name_any(), pod_condition_status(&p)));
        }
        Ok(())
    }
}

/// Opens a pod watch on leadership, like the steward binary does
struct PodWatchLauncher {
    tx: mpsc::UnboundedSender<Observation>,
    handle: Mutex<Option<WatchHandle>>,
}

#[async_trait]
impl LeaderCallback for PodWatchLauncher {
    async fn on_started_leading(
        &self,
        ctx: CancellationToken,
        cluster_code: &str,
        namespace: &str,
        label_selector: &str,
        client: Arc<dyn ClusterClient>,
    ) -> Result<(), Error> {
        let pods = PodClient::new(
            client.pods(namespace),
            cluster_code,
            namespace,
            label_selector,
            Arc::new(ConditionCollector {
                tx: self.tx.clone(),
            }),
        );
        *self.handle.lock() = Some(pods.do_watch(ctx).await?);
        Ok(())
    }

    async fn on_stopped_leading(&self) {}
}

// =============================================================================
// Story Tests
// =============================================================================

/// Story: the sole leader opens a pod watch and sees condition changes in order
#[tokio::test(start_paused = true)]
async fn story_leader_watches_pod_conditions() {
    let cluster = Arc::new(MemoryClusterClient::new());
    let pods = cluster.pod_api("apps");
    let (tx, mut rx) = mpsc::unbounded_channel();
    let launcher = Arc::new(PodWatchLauncher {
        tx,
        handle: Mutex::new(None),
    });

    let (shutdown_tx, mut shutdown_rx) = fatal_channel();
    let client: Arc<dyn ClusterClient> = cluster.clone();
    let elector = LeaderElector::new(client, shutdown_tx);
    let root = CancellationToken::new();
    let options = LeaderElectionOptions {
        leader_elect: false,
        cluster_code: "eu-1".to_string(),
        namespace: "apps".to_string(),
        label_selector: "app=web".to_string(),
        ..Default::default()
    };

    let task = tokio::spawn({
        let root = root.clone();
        let callback: Arc<dyn LeaderCallback> = launcher.clone();
        async move {
            let stop = root.clone().cancelled_owned();
            elector.run(root, options, callback, stop).await
        }
    });

    while pods.watches_opened() == 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(pods.selectors(), vec!["app=web".to_string()]);

    pods.emit(WatchEvent::Added(pod("web-0", &[("PodScheduled", "True")])));
    pods.emit(WatchEvent::Modified(pod(
        "web-0",
        &[("PodScheduled", "True"), ("Ready", "True")],
    )));
    pods.emit(WatchEvent::Deleted(pod("web-0", &[("Ready", "False")])));

    let (kind, name, added) = rx.recv().await.unwrap();
    assert_eq!((kind.as_str(), name.as_str()), ("Added", "web-0"));
    assert_eq!(added.scheduled, Some(ConditionStatus::True));
    assert_eq!(added.ready, None);

    let (kind, _, modified) = rx.recv().await.unwrap();
    assert_eq!(kind, "Modified");
    assert_eq!(modified.ready, Some(ConditionStatus::True));

    let (kind, _, deleted) = rx.recv().await.unwrap();
    assert_eq!(kind, "Deleted");
    assert_eq!(deleted.ready, Some(ConditionStatus::False));
    assert_eq!(deleted.scheduled, None);

    // Shutting down cancels the leader context, which closes the stream once
    root.cancel();
    task.await.unwrap().unwrap();
    let handle = launcher.handle.lock().take().unwrap();
    handle.closed().await;

    assert_eq!(pods.streams_released(), 1);
    assert_eq!(pods.emit(WatchEvent::Added(pod("web-1", &[]))), 0);
    assert!(shutdown_rx.try_recv().is_none());
}

/// Story: the server ends the stream; the subscription finishes without a restart
#[tokio::test]
async fn story_server_side_close_is_not_reopened() {
    let cluster = MemoryClusterClient::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let client = PodClient::new(
        cluster.pods("apps"),
        "eu-1",
        "apps",
        "",
        Arc::new(ConditionCollector { tx }),
    );
    let ctx = CancellationToken::new();

    let handle = client.do_watch(ctx.clone()).await.unwrap();
    let pods = cluster.pod_api("apps");
    pods.emit(WatchEvent::Added(pod("web-0", &[])));
    assert_eq!(rx.recv().await.unwrap().1, "web-0");

    pods.disconnect();
    handle.closed().await;

    assert_eq!(pods.watches_opened(), 1);
    assert_eq!(pods.streams_released(), 1);
    assert!(!ctx.is_cancelled());
}

#[tokio::test]
async fn replica_set_replace_goes_through_cluster_client() {
    let cluster = MemoryClusterClient::new();
    cluster.replica_set_api("apps").insert(replica_set("web", 1));

    let client = ReplicaSetClient::new(
        cluster.replica_sets("apps"),
        "eu-1",
        "apps",
        "app=web",
        Arc::new(IgnoreReplicaSets),
    );

    let updated = client
        .create_or_replace(&replica_set("web", 4))
        .await
        .unwrap();
    assert_eq!(updated.spec.and_then(|s| s.replicas), Some(4));

    let missing = client.create_or_replace(&replica_set("api", 2)).await;
    assert!(matches!(missing, Err(Error::NotFound { .. })));
    assert!(cluster.replica_set_api("apps").get("api").is_none());
}

#[tokio::test]
async fn watch_open_failure_is_returned_to_the_caller() {
    let cluster = MemoryClusterClient::new();
    cluster
        .replica_set_api("apps")
        .fail_next_watch(Error::unavailable("apiserver down"));

    let client = ReplicaSetClient::new(
        cluster.replica_sets("apps"),
        "eu-1",
        "apps",
        "",
        Arc::new(IgnoreReplicaSets),
    );

    let result = client.do_watch(CancellationToken::new()).await;
    assert!(matches!(result, Err(Error::Unavailable { .. })));
    assert_eq!(cluster.replica_set_api("apps").watches_opened(), 0);
}

struct IgnoreReplicaSets;

#[async_trait]
impl WatchEventHandler<ReplicaSet> for IgnoreReplicaSets {
    async fn handle(
        &self,
        _ctx: &CancellationToken,
        _cluster_code: &str,
        _event: WatchEvent<ReplicaSet>,
    ) -> Result<(), Error> {
        Ok(())
    }
}
