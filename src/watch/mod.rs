//! Watch subscriptions over remote resource collections
//!
//! A subscription opens one server-streamed watch, then runs two tasks:
//! a cancellation watcher that closes the stream when the parent token
//! fires, and an event pump that feeds events to a [`WatchEventHandler`]
//! one at a time in stream order. Closed subscriptions are not restarted.
//!
//! The pieces are composed explicitly: a [`WatchSubscription`] holds a
//! [`ResourceApi`] (how to open the stream) and a handler (what to do with
//! each event) as two named fields.

mod pod;
mod replica_set;
mod subscription;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use kube::api::WatchEvent;
use tokio_util::sync::CancellationToken;

use crate::Error;

pub use pod::{pod_condition_status, ConditionStatus, PodClient, PodConditionStatuses};
pub use replica_set::ReplicaSetClient;
pub use subscription::{WatchHandle, WatchSubscription};

/// Boxed stream of watch events as produced by a [`ResourceApi`]
pub type EventStream<K> = BoxStream<'static, Result<WatchEvent<K>, Error>>;

/// Something that can start a watch subscription
#[async_trait]
pub trait Watcher: Send + Sync {
    /// Open the watch and spawn its background tasks
    ///
    /// Fails synchronously if the stream cannot be opened. Once this returns
    /// `Ok`, all further failures are handled inside the background tasks.
    async fn do_watch(&self, ctx: CancellationToken) -> Result<WatchHandle, Error>;
}

/// Application-side receiver of watch events
#[async_trait]
pub trait WatchEventHandler<K>: Send + Sync
where
    K: Send + 'static,
{
    /// Handle one event
    ///
    /// An error is logged by the pump and does not stop delivery of later events.
    async fn handle(
        &self,
        ctx: &CancellationToken,
        cluster_code: &str,
        event: WatchEvent<K>,
    ) -> Result<(), Error>;
}

/// Resource operations a subscription needs from the cluster
#[async_trait]
pub trait ResourceApi<K>: Send + Sync
where
    K: Send + 'static,
{
    /// Open a watch stream filtered by `label_selector` (empty matches everything)
    async fn watch(&self, label_selector: &str) -> Result<WatchStream<K>, Error>;

    /// Replace an existing object unconditionally
    async fn replace(&self, resource: &K) -> Result<K, Error>;
}

/// An open watch stream together with its close guard
pub struct WatchStream<K> {
    events: EventStream<K>,
    closer: StreamCloser,
}

impl<K> WatchStream<K> {
    /// Wrap a stream of events
    pub fn new<S>(events: S) -> Self
    where
        S: Stream<Item = Result<WatchEvent<K>, Error>> + Send + 'static,
    {
        Self {
            events: events.boxed(),
            closer: StreamCloser::default(),
        }
    }

    pub(crate) fn into_parts(self) -> (EventStream<K>, StreamCloser) {
        (self.events, self.closer)
    }
}

/// Idempotent close switch shared between a stream's owner and its cancellation watcher
///
/// The first [`close`](StreamCloser::close) wins and wakes everyone waiting
/// on [`closed`](StreamCloser::closed); later calls are no-ops.
#[derive(Clone, Debug, Default)]
pub struct StreamCloser {
    flag: Arc<AtomicBool>,
    token: CancellationToken,
}

impl StreamCloser {
    /// Close the stream; returns `true` only for the call that actually closed it
    pub fn close(&self) -> bool {
        if self.flag.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.token.cancel();
        true
    }

    /// Whether the stream has been closed
    pub fn is_closed(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Wait until the stream is closed
    pub async fn closed(&self) {
        self.token.cancelled().await
    }
}

/// Short name of a watch event kind for log fields
pub fn event_kind<K>(event: &WatchEvent<K>) -> &'static str {
    match event {
        WatchEvent::Added(_) => "Added",
        WatchEvent::Modified(_) => "Modified",
        WatchEvent::Deleted(_) => "Deleted",
        WatchEvent::Bookmark(_) => "Bookmark",
        WatchEvent::Error(_) => "Error",
    }
}
