//! Generic watch subscription shared by every watched resource kind

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{event_kind, EventStream, ResourceApi, StreamCloser, WatchEventHandler, Watcher};
use crate::Error;

/// A watch over one resource collection, scoped by namespace and label selector
///
/// Selector, namespace and cluster code are fixed for the subscription's
/// lifetime. Each call to [`Watcher::do_watch`] opens a fresh stream.
pub struct WatchSubscription<K> {
    api: Arc<dyn ResourceApi<K>>,
    handler: Arc<dyn WatchEventHandler<K>>,
    target: WatchTarget,
}

/// Labels identifying a subscription in log lines
#[derive(Clone, Debug)]
struct WatchTarget {
    resource: &'static str,
    cluster_code: String,
    namespace: String,
    label_selector: String,
}

impl<K> WatchSubscription<K>
where
    K: Send + 'static,
{
    /// Create a subscription
    ///
    /// `resource` is a plural display name (e.g., "Pods") used in log fields.
    pub fn new(
        resource: &'static str,
        api: Arc<dyn ResourceApi<K>>,
        handler: Arc<dyn WatchEventHandler<K>>,
        cluster_code: impl Into<String>,
        namespace: impl Into<String>,
        label_selector: impl Into<String>,
    ) -> Self {
        Self {
            api,
            handler,
            target: WatchTarget {
                resource,
                cluster_code: cluster_code.into(),
                namespace: namespace.into(),
                label_selector: label_selector.into(),
            },
        }
    }

    /// Resource operations backing this subscription
    pub fn api(&self) -> &Arc<dyn ResourceApi<K>> {
        &self.api
    }

    /// Cluster code passed to the handler with every event
    pub fn cluster_code(&self) -> &str {
        &self.target.cluster_code
    }

    /// Namespace this subscription watches
    pub fn namespace(&self) -> &str {
        &self.target.namespace
    }
}

#[async_trait]
impl<K> Watcher for WatchSubscription<K>
where
    K: Send + 'static,
{
    async fn do_watch(&self, ctx: CancellationToken) -> Result<WatchHandle, Error> {
        let stream = self.api.watch(&self.target.label_selector).await?;
        let (events, closer) = stream.into_parts();

        debug!(
            resource = self.target.resource,
            cluster = %self.target.cluster_code,
            namespace = %self.target.namespace,
            label_selector = %self.target.label_selector,
            "Watch opened"
        );

        let canceller = tokio::spawn(close_on_cancel(
            ctx.clone(),
            closer.clone(),
            self.target.clone(),
        ));
        let pump = tokio::spawn(pump_events(
            ctx,
            events,
            closer.clone(),
            Arc::clone(&self.handler),
            self.target.clone(),
        ));

        Ok(WatchHandle {
            canceller,
            pump,
            closer,
        })
    }
}

/// Background tasks of a running subscription
///
/// Dropping the handle detaches the tasks; they keep running until the
/// parent token is cancelled or the stream ends.
pub struct WatchHandle {
    canceller: JoinHandle<()>,
    pump: JoinHandle<()>,
    closer: StreamCloser,
}

impl WatchHandle {
    /// Close this subscription's stream without cancelling the parent token
    pub fn close(&self) -> bool {
        self.closer.close()
    }

    /// Whether the stream has been closed, by cancellation or by the remote side
    pub fn is_closed(&self) -> bool {
        self.closer.is_closed()
    }

    /// Wait for both background tasks to finish
    pub async fn closed(self) {
        if let Err(e) = self.pump.await {
            error!(error = %e, "Watch event pump failed");
        }
        if let Err(e) = self.canceller.await {
            error!(error = %e, "Watch cancellation task failed");
        }
    }
}

/// Close the stream once the parent token fires
///
/// Returns early if the stream ended on its own; the close is then a no-op.
async fn close_on_cancel(ctx: CancellationToken, closer: StreamCloser, target: WatchTarget) {
    tokio::select! {
        _ = ctx.cancelled() => {
            if closer.close() {
                debug!(
                    resource = target.resource,
                    cluster = %target.cluster_code,
                    namespace = %target.namespace,
                    "Watch cancelled, stream closed"
                );
            }
        }
        _ = closer.closed() => {}
    }
}

/// Deliver events to the handler in stream order until the stream closes
async fn pump_events<K>(
    ctx: CancellationToken,
    mut events: EventStream<K>,
    closer: StreamCloser,
    handler: Arc<dyn WatchEventHandler<K>>,
    target: WatchTarget,
) where
    K: Send + 'static,
{
    loop {
        let next = tokio::select! {
            biased;
            _ = ctx.cancelled() => None,
            _ = closer.closed() => None,
            item = events.next() => item,
        };
        let Some(item) = next else {
            break;
        };

        match item {
            Ok(event) => {
                let kind = event_kind(&event);
                if let Err(e) = handler.handle(&ctx, &target.cluster_code, event).await {
                    error!(
                        resource = target.resource,
                        cluster = %target.cluster_code,
                        event = kind,
                        error = %e,
                        "Handle event error"
                    );
                }
            }
            Err(e) => {
                warn!(
                    resource = target.resource,
                    cluster = %target.cluster_code,
                    error = %e,
                    "Watch stream error, skipping item"
                );
            }
        }
    }

    // A no-op if the cancellation watcher got there first
    let remote_closed = closer.close() && !ctx.is_cancelled();
    drop(events);

    info!(
        resource = target.resource,
        cluster = %target.cluster_code,
        namespace = %target.namespace,
        remote_closed,
        "Watch chan was closed"
    );
}
