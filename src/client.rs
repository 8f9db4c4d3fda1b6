//! Cluster client capability
//!
//! Everything the elector and the watch subscriptions need from a cluster
//! goes through [`ClusterClient`]. Production code wraps a kube-rs
//! [`Client`]; tests use [`crate::fake::MemoryClusterClient`].

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::ReplicaSet;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, PostParams, WatchParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::lease::{KubeLeaseStore, LeaseKey, LeaseStore};
use crate::watch::{ResourceApi, WatchStream};
use crate::Error;

/// Empty resource version starts the watch from the most recent state
const WATCH_FROM_MOST_RECENT: &str = "";

/// Capabilities the coordination core needs from a cluster
pub trait ClusterClient: Send + Sync {
    /// Compare-and-swap access to the lease named by `key`
    fn lease_store(&self, key: &LeaseKey) -> Arc<dyn LeaseStore>;

    /// Pod operations in `namespace`
    fn pods(&self, namespace: &str) -> Arc<dyn ResourceApi<Pod>>;

    /// ReplicaSet operations in `namespace`
    fn replica_sets(&self, namespace: &str) -> Arc<dyn ResourceApi<ReplicaSet>>;
}

/// [`ClusterClient`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    /// Wrap a configured kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// The wrapped kube client
    pub fn client(&self) -> &Client {
        &self.client
    }
}

impl ClusterClient for KubeClusterClient {
    fn lease_store(&self, key: &LeaseKey) -> Arc<dyn LeaseStore> {
        Arc::new(KubeLeaseStore::new(self.client.clone(), key.clone()))
    }

    fn pods(&self, namespace: &str) -> Arc<dyn ResourceApi<Pod>> {
        Arc::new(KubeResourceApi::<Pod>::namespaced(
            self.client.clone(),
            namespace,
        ))
    }

    fn replica_sets(&self, namespace: &str) -> Arc<dyn ResourceApi<ReplicaSet>> {
        Arc::new(KubeResourceApi::<ReplicaSet>::namespaced(
            self.client.clone(),
            namespace,
        ))
    }
}

/// [`ResourceApi`] for a namespaced Kubernetes resource type
pub struct KubeResourceApi<K> {
    api: Api<K>,
}

impl<K> KubeResourceApi<K>
where
    K: Resource<DynamicType = (), Scope = k8s_openapi::NamespaceResourceScope>,
{
    /// Create an API scoped to `namespace`
    pub fn namespaced(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }
}

#[async_trait]
impl<K> ResourceApi<K> for KubeResourceApi<K>
where
    K: Resource<DynamicType = ()>
        + Clone
        + DeserializeOwned
        + Serialize
        + Debug
        + Send
        + Sync
        + 'static,
{
    async fn watch(&self, label_selector: &str) -> Result<WatchStream<K>, Error> {
        let stream = self
            .api
            .watch(&watch_params(label_selector), WATCH_FROM_MOST_RECENT)
            .await
            .map_err(|e| Error::from_kube(&K::kind(&()), label_selector, e))?;

        Ok(WatchStream::new(stream.map(|item| item.map_err(Error::from))))
    }

    async fn replace(&self, resource: &K) -> Result<K, Error> {
        let name = resource.meta().name.clone().ok_or_else(|| {
            Error::validation_for_field("metadata.name", "cannot replace an unnamed object")
        })?;

        self.api
            .replace(&name, &post_params(), resource)
            .await
            .map_err(|e| Error::from_kube(&K::kind(&()), &resource.name_any(), e))
    }
}

fn post_params() -> PostParams {
    PostParams {
        field_manager: Some(crate::FIELD_MANAGER.to_string()),
        ..Default::default()
    }
}

fn watch_params(label_selector: &str) -> WatchParams {
    let params = WatchParams::default();
    if label_selector.is_empty() {
        params
    } else {
        params.labels(label_selector)
    }
}
