//! In-memory cluster client
//!
//! Stands in for the API server in tests and local runs. The lease store
//! enforces the same compare-and-swap contract as the real one, and resource
//! APIs let a test inject watch events, end streams from the "server" side,
//! and count how many streams were released.

use std::collections::{BTreeMap, HashMap};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::Stream;
use k8s_openapi::api::apps::v1::ReplicaSet;
use k8s_openapi::api::core::v1::Pod;
use kube::api::WatchEvent;
use kube::{Resource, ResourceExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::client::ClusterClient;
use crate::lease::{LeaseKey, LeaseRecord, LeaseStore};
use crate::watch::{ResourceApi, WatchStream};
use crate::Error;

// =============================================================================
// Lease store
// =============================================================================

/// Lease store held in memory, shared by every candidate that clones the `Arc`
#[derive(Default)]
pub struct MemoryLeaseStore {
    state: Mutex<LeaseState>,
    unavailable: AtomicBool,
}

#[derive(Default)]
struct LeaseState {
    record: Option<LeaseRecord>,
    version: u64,
    writes: usize,
}

impl MemoryLeaseStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the store becoming unreachable (or reachable again)
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Current record, bypassing availability
    pub fn record(&self) -> Option<LeaseRecord> {
        self.state.lock().record.clone()
    }

    /// Number of successful creates and updates
    pub fn writes(&self) -> usize {
        self.state.lock().writes
    }

    fn check_available(&self) -> Result<(), Error> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::unavailable("in-memory lease store is offline"));
        }
        Ok(())
    }
}

impl LeaseState {
    fn store(&mut self, mut record: LeaseRecord) -> LeaseRecord {
        self.version += 1;
        self.writes += 1;
        record.resource_version = Some(self.version.to_string());
        self.record = Some(record.clone());
        record
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn get(&self) -> Result<Option<LeaseRecord>, Error> {
        self.check_available()?;
        Ok(self.state.lock().record.clone())
    }

    async fn create(&self, record: LeaseRecord) -> Result<LeaseRecord, Error> {
        self.check_available()?;
        let mut state = self.state.lock();
        if state.record.is_some() {
            return Err(Error::conflict("Lease", "memory", "lease already exists"));
        }
        Ok(state.store(record))
    }

    async fn update(&self, record: LeaseRecord) -> Result<LeaseRecord, Error> {
        self.check_available()?;
        let mut state = self.state.lock();
        let current = state
            .record
            .as_ref()
            .ok_or_else(|| Error::not_found("Lease", "memory"))?;
        if current.resource_version != record.resource_version {
            return Err(Error::conflict(
                "Lease",
                "memory",
                "resourceVersion does not match",
            ));
        }
        Ok(state.store(record))
    }
}

// =============================================================================
// Resource API
// =============================================================================

type EventSender<K> = mpsc::UnboundedSender<Result<WatchEvent<K>, Error>>;

/// Resource collection held in memory with injectable watch events
pub struct MemoryResourceApi<K> {
    state: Mutex<ResourceState<K>>,
    released: Arc<AtomicUsize>,
}

struct ResourceState<K> {
    objects: BTreeMap<String, K>,
    watchers: Vec<EventSender<K>>,
    selectors: Vec<String>,
    fail_next_watch: Option<Error>,
}

impl<K> Default for MemoryResourceApi<K> {
    fn default() -> Self {
        Self {
            state: Mutex::new(ResourceState {
                objects: BTreeMap::new(),
                watchers: Vec::new(),
                selectors: Vec::new(),
                fail_next_watch: None,
            }),
            released: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl<K> MemoryResourceApi<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    /// Create an empty collection
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an object so it can be replaced later
    pub fn insert(&self, object: K) {
        self.state.lock().objects.insert(object.name_any(), object);
    }

    /// Look up an object by name
    pub fn get(&self, name: &str) -> Option<K> {
        self.state.lock().objects.get(name).cloned()
    }

    /// Send an event to every open stream; returns how many streams received it
    pub fn emit(&self, event: WatchEvent<K>) -> usize {
        let mut state = self.state.lock();
        state
            .watchers
            .retain(|tx| tx.send(Ok(event.clone())).is_ok());
        state.watchers.len()
    }

    /// Send a stream-level error to every open stream
    pub fn emit_stream_error(&self, message: &str) -> usize {
        let mut state = self.state.lock();
        state
            .watchers
            .retain(|tx| tx.send(Err(Error::internal_with_context("watch", message))).is_ok());
        state.watchers.len()
    }

    /// End every open stream from the server side
    pub fn disconnect(&self) {
        self.state.lock().watchers.clear();
    }

    /// Make the next `watch` call fail with `err`
    pub fn fail_next_watch(&self, err: Error) {
        self.state.lock().fail_next_watch = Some(err);
    }

    /// Label selectors of every watch opened so far
    pub fn selectors(&self) -> Vec<String> {
        self.state.lock().selectors.clone()
    }

    /// Number of watches successfully opened
    pub fn watches_opened(&self) -> usize {
        self.state.lock().selectors.len()
    }

    /// Number of opened streams that have since been dropped by their consumer
    pub fn streams_released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<K> ResourceApi<K> for MemoryResourceApi<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    async fn watch(&self, label_selector: &str) -> Result<WatchStream<K>, Error> {
        let mut state = self.state.lock();
        if let Some(err) = state.fail_next_watch.take() {
            return Err(err);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        state.watchers.push(tx);
        state.selectors.push(label_selector.to_string());

        Ok(WatchStream::new(TrackedEvents {
            rx,
            released: Arc::clone(&self.released),
        }))
    }

    async fn replace(&self, resource: &K) -> Result<K, Error> {
        let name = resource.name_any();
        let mut state = self.state.lock();
        match state.objects.get_mut(&name) {
            Some(existing) => {
                *existing = resource.clone();
                Ok(resource.clone())
            }
            None => Err(Error::not_found(K::kind(&()), name)),
        }
    }
}

/// Receiver side of an injected stream; counts itself as released when dropped
struct TrackedEvents<K> {
    rx: mpsc::UnboundedReceiver<Result<WatchEvent<K>, Error>>,
    released: Arc<AtomicUsize>,
}

impl<K> Stream for TrackedEvents<K> {
    type Item = Result<WatchEvent<K>, Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl<K> Drop for TrackedEvents<K> {
    fn drop(&mut self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

// =============================================================================
// Cluster client
// =============================================================================

/// In-memory [`ClusterClient`]; stores are created on first use and shared afterwards
#[derive(Default)]
pub struct MemoryClusterClient {
    leases: Mutex<HashMap<LeaseKey, Arc<MemoryLeaseStore>>>,
    pods: Mutex<HashMap<String, Arc<MemoryResourceApi<Pod>>>>,
    replica_sets: Mutex<HashMap<String, Arc<MemoryResourceApi<ReplicaSet>>>>,
}

impl MemoryClusterClient {
    /// Create an empty cluster
    pub fn new() -> Self {
        Self::default()
    }

    /// The lease store for `key`
    pub fn lease(&self, key: &LeaseKey) -> Arc<MemoryLeaseStore> {
        Arc::clone(self.leases.lock().entry(key.clone()).or_default())
    }

    /// Number of leases that have been touched
    pub fn lease_count(&self) -> usize {
        self.leases.lock().len()
    }

    /// The pod collection of `namespace`
    pub fn pod_api(&self, namespace: &str) -> Arc<MemoryResourceApi<Pod>> {
        Arc::clone(self.pods.lock().entry(namespace.to_string()).or_default())
    }

    /// The replica set collection of `namespace`
    pub fn replica_set_api(&self, namespace: &str) -> Arc<MemoryResourceApi<ReplicaSet>> {
        Arc::clone(
            self.replica_sets
                .lock()
                .entry(namespace.to_string())
                .or_default(),
        )
    }
}

impl ClusterClient for MemoryClusterClient {
    fn lease_store(&self, key: &LeaseKey) -> Arc<dyn LeaseStore> {
        self.lease(key)
    }

    fn pods(&self, namespace: &str) -> Arc<dyn ResourceApi<Pod>> {
        self.pod_api(namespace)
    }

    fn replica_sets(&self, namespace: &str) -> Arc<dyn ResourceApi<ReplicaSet>> {
        self.replica_set_api(namespace)
    }
}
