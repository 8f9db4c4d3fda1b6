//! ReplicaSet watch client with a replace helper

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::ReplicaSet;
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{ResourceApi, WatchEventHandler, WatchHandle, WatchSubscription, Watcher};
use crate::Error;

/// Watches replica sets matching a label selector and replaces them on request
pub struct ReplicaSetClient {
    subscription: WatchSubscription<ReplicaSet>,
}

impl ReplicaSetClient {
    /// Create a replica set client
    pub fn new(
        api: Arc<dyn ResourceApi<ReplicaSet>>,
        cluster_code: impl Into<String>,
        namespace: impl Into<String>,
        label_selector: impl Into<String>,
        handler: Arc<dyn WatchEventHandler<ReplicaSet>>,
    ) -> Self {
        Self {
            subscription: WatchSubscription::new(
                "ReplicaSets",
                api,
                handler,
                cluster_code,
                namespace,
                label_selector,
            ),
        }
    }

    /// The underlying subscription
    pub fn subscription(&self) -> &WatchSubscription<ReplicaSet> {
        &self.subscription
    }

    /// Replace the replica set with `desired`
    ///
    /// Despite the name this only updates: the object must already exist, and
    /// a missing one comes back as [`Error::NotFound`] for the caller to handle.
    pub async fn create_or_replace(&self, desired: &ReplicaSet) -> Result<ReplicaSet, Error> {
        let replaced = self.subscription.api().replace(desired).await?;
        debug!(
            cluster = %self.subscription.cluster_code(),
            namespace = %self.subscription.namespace(),
            name = %replaced.name_any(),
            "ReplicaSet replaced"
        );
        Ok(replaced)
    }
}

#[async_trait]
impl Watcher for ReplicaSetClient {
    async fn do_watch(&self, ctx: CancellationToken) -> Result<WatchHandle, Error> {
        self.subscription.do_watch(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::MemoryResourceApi;
    use k8s_openapi::api::apps::v1::ReplicaSetSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kube::api::WatchEvent;

    struct IgnoreEvents;

    #[async_trait]
    impl WatchEventHandler<ReplicaSet> for IgnoreEvents {
        async fn handle(
            &self,
            _ctx: &CancellationToken,
            _cluster_code: &str,
            _event: WatchEvent<ReplicaSet>,
        ) -> Result<(), Error> {
            Ok(())
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

    fn client(api: &Arc<MemoryResourceApi<ReplicaSet>>) -> ReplicaSetClient {
        let api: Arc<dyn ResourceApi<ReplicaSet>> = api.clone();
        ReplicaSetClient::new(api, "c1", "apps", "", Arc::new(IgnoreEvents))
    }

    #[tokio::test]
    async fn create_or_replace_updates_existing() {
        let api = Arc::new(MemoryResourceApi::<ReplicaSet>::new());
        api.insert(replica_set("web", 1));

        let result = client(&api)
            .create_or_replace(&replica_set("web", 3))
            .await
            .unwrap();

        assert_eq!(result.spec.and_then(|s| s.replicas), Some(3));
        let stored = api.get("web").and_then(|rs| rs.spec).and_then(|s| s.replicas);
        assert_eq!(stored, Some(3));
    }

    /// The helper never creates: a missing replica set is reported, not created
    #[tokio::test]
    async fn create_or_replace_does_not_create_missing() {
        let api = Arc::new(MemoryResourceApi::<ReplicaSet>::new());

        let result = client(&api)
            .create_or_replace(&replica_set("web", 3))
            .await;

        assert!(matches!(result, Err(Error::NotFound { .. })));
        assert!(api.get("web").is_none());
    }

    #[tokio::test]
    async fn empty_selector_watches_everything() {
        let api = Arc::new(MemoryResourceApi::<ReplicaSet>::new());
        let ctx = CancellationToken::new();

        let handle = client(&api).do_watch(ctx.clone()).await.unwrap();
        assert_eq!(api.selectors(), vec![String::new()]);

        ctx.cancel();
        handle.closed().await;
        assert_eq!(api.streams_released(), 1);
    }
}
