//! Subscription engine: identity notification monitors and resource push
//! subscriptions.
//!
//! The engine exclusively owns every live-query handle. Each subscription is
//! serviced by a dedicated consumer task reading the query's channel; relay
//! I/O never calls into pipeline code directly. Stops are acknowledged: by
//! the time a remove returns, the consumer task has been joined and no
//! further event can be processed for that subscription.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::classify::classify;
use crate::error::BridgeError;
use crate::event::{Event, Filter};
use crate::notify::{self, NotificationStore};
use crate::profile::{display_name, fetch_profile};
use crate::source::{EventSource, LiveQueryOptions};

/// A raw event pushed to a resource subscriber.
#[derive(Debug, Clone)]
pub struct ResourceUpdate {
    pub uri: String,
    pub event: Event,
}

/// Read-only snapshot of one active monitor.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionSnapshot {
    pub identity: String,
    pub started_at: u64,
    pub processed: u64,
}

/// Bookkeeping common to both subscription machines.
struct SubState {
    filter: Filter,
    started_at: u64,
    processed: Arc<AtomicU64>,
    /// Cleared by the consumer task when its live query dies.
    live: Arc<AtomicBool>,
    cancel: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl SubState {
    /// Signal the consumer task and wait for it to acknowledge.
    async fn stop(mut self) {
        let _ = self.cancel.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

/// Identity-keyed notification monitor.
struct Monitor {
    state: SubState,
    store: Arc<Mutex<NotificationStore>>,
}

/// URI-keyed resource push subscription.
struct ResourceSub {
    state: SubState,
    sink: mpsc::Sender<ResourceUpdate>,
}

/// Owns all live subscriptions for the server process.
///
/// Explicitly constructed and passed to every operation that needs it; its
/// lifetime is the server's lifetime and `stop_all` runs at shutdown.
pub struct SubscriptionEngine {
    source: Arc<dyn EventSource>,
    notify_capacity: usize,
    lookup_timeout: Duration,
    monitors: Mutex<HashMap<String, Monitor>>,
    resources: Mutex<HashMap<String, ResourceSub>>,
}

impl SubscriptionEngine {
    /// Create an engine over the given event source.
    pub fn new(
        source: Arc<dyn EventSource>,
        notify_capacity: usize,
        lookup_timeout: Duration,
    ) -> Self {
        Self {
            source,
            notify_capacity,
            lookup_timeout,
            monitors: Mutex::new(HashMap::new()),
            resources: Mutex::new(HashMap::new()),
        }
    }

    /// Start monitoring an identity for inbound references.
    ///
    /// Errors with `DuplicateSubscription` when already active; there is no
    /// silent upsert. A transport failure leaves no bookkeeping behind and
    /// the caller retries.
    pub async fn add_subscription(&self, identity: &str) -> Result<(), BridgeError> {
        let mut monitors = self.monitors.lock().await;
        if monitors.contains_key(identity) {
            return Err(BridgeError::DuplicateSubscription(identity.to_string()));
        }
        let filter = Filter::referencing_identity(identity);
        // Live monitoring must outlast the historical backlog, so the query
        // stays open past EOSE.
        let lq = self
            .source
            .open_live_query(&filter, LiveQueryOptions { close_on_catchup: false })
            .await?;
        let store = Arc::new(Mutex::new(NotificationStore::new(self.notify_capacity)));
        let processed = Arc::new(AtomicU64::new(0));
        let live = Arc::new(AtomicBool::new(true));
        let (cancel, cancel_rx) = watch::channel(false);
        let task = tokio::spawn(monitor_task(
            self.source.clone(),
            identity.to_string(),
            lq,
            store.clone(),
            processed.clone(),
            live.clone(),
            cancel_rx,
            self.lookup_timeout,
        ));
        monitors.insert(
            identity.to_string(),
            Monitor {
                state: SubState {
                    filter,
                    started_at: notify::now_unix(),
                    processed,
                    live,
                    cancel,
                    task: Some(task),
                },
                store,
            },
        );
        info!(identity, "monitoring started");
        Ok(())
    }

    /// Stop monitoring an identity. Idempotent; returns whether anything was
    /// actually stopped. By the time this returns, no further events are
    /// processed for the identity.
    pub async fn remove_subscription(&self, identity: &str) -> bool {
        let removed = self.monitors.lock().await.remove(identity);
        match removed {
            Some(monitor) => {
                monitor.state.stop().await;
                info!(identity, "monitoring stopped");
                true
            }
            None => false,
        }
    }

    /// Notifications gathered for a monitored identity, newest first.
    pub async fn notifications(
        &self,
        identity: &str,
        since: Option<u64>,
        limit: Option<usize>,
    ) -> Result<Vec<Event>, BridgeError> {
        let monitors = self.monitors.lock().await;
        let monitor = monitors
            .get(identity)
            .ok_or_else(|| BridgeError::NotFound(format!("no subscription for {identity}")))?;
        let store = monitor.store.clone();
        drop(monitors);
        let out = store.lock().await.retrieve(since, None, limit);
        Ok(out)
    }

    /// Snapshot of all active monitors; never mutates state.
    pub async fn active_subscriptions(&self) -> Vec<SubscriptionSnapshot> {
        let monitors = self.monitors.lock().await;
        let mut out: Vec<SubscriptionSnapshot> = monitors
            .iter()
            .map(|(identity, m)| SubscriptionSnapshot {
                identity: identity.clone(),
                started_at: m.state.started_at,
                processed: m.state.processed.load(Ordering::Relaxed),
            })
            .collect();
        out.sort_by(|a, b| a.identity.cmp(&b.identity));
        out
    }

    /// Open a resource push subscription; inbound events are forwarded to
    /// `sink` verbatim, at least once each, with no de-duplication.
    pub async fn subscribe_resource(
        &self,
        uri: &str,
        filter: Filter,
        sink: mpsc::Sender<ResourceUpdate>,
    ) -> Result<(), BridgeError> {
        let mut resources = self.resources.lock().await;
        if resources.contains_key(uri) {
            return Err(BridgeError::DuplicateSubscription(uri.to_string()));
        }
        let lq = self
            .source
            .open_live_query(&filter, LiveQueryOptions { close_on_catchup: false })
            .await?;
        let processed = Arc::new(AtomicU64::new(0));
        let live = Arc::new(AtomicBool::new(true));
        let (cancel, cancel_rx) = watch::channel(false);
        let task = tokio::spawn(resource_task(
            uri.to_string(),
            lq,
            sink.clone(),
            processed.clone(),
            live.clone(),
            cancel_rx,
        ));
        resources.insert(
            uri.to_string(),
            ResourceSub {
                state: SubState {
                    filter,
                    started_at: notify::now_unix(),
                    processed,
                    live,
                    cancel,
                    task: Some(task),
                },
                sink,
            },
        );
        info!(uri, "resource subscription opened");
        Ok(())
    }

    /// Close a resource subscription; same idempotent contract as
    /// [`SubscriptionEngine::remove_subscription`].
    pub async fn unsubscribe_resource(&self, uri: &str) -> bool {
        let removed = self.resources.lock().await.remove(uri);
        match removed {
            Some(sub) => {
                sub.state.stop().await;
                info!(uri, "resource subscription closed");
                true
            }
            None => false,
        }
    }

    /// Whether any subscription's live query has died and needs reopening.
    pub async fn any_dead(&self) -> bool {
        let monitors = self.monitors.lock().await;
        if monitors.values().any(|m| !m.state.live.load(Ordering::Relaxed)) {
            return true;
        }
        drop(monitors);
        let resources = self.resources.lock().await;
        resources
            .values()
            .any(|r| !r.state.live.load(Ordering::Relaxed))
    }

    /// Replace every subscription's live-query handle with a freshly opened
    /// one, preserving keys, stores, and processed counts. Reopen failures
    /// leave the entry in place (dead) for a later retry.
    pub async fn handle_reconnection(&self) -> usize {
        let mut replaced = 0;

        let identities: Vec<String> = self.monitors.lock().await.keys().cloned().collect();
        for identity in identities {
            let Some(mut monitor) = self.monitors.lock().await.remove(&identity) else {
                continue;
            };
            let _ = monitor.state.cancel.send(true);
            if let Some(task) = monitor.state.task.take() {
                let _ = task.await;
            }
            match self
                .source
                .open_live_query(
                    &monitor.state.filter,
                    LiveQueryOptions { close_on_catchup: false },
                )
                .await
            {
                Ok(lq) => {
                    let (cancel, cancel_rx) = watch::channel(false);
                    monitor.state.live.store(true, Ordering::Relaxed);
                    let task = tokio::spawn(monitor_task(
                        self.source.clone(),
                        identity.clone(),
                        lq,
                        monitor.store.clone(),
                        monitor.state.processed.clone(),
                        monitor.state.live.clone(),
                        cancel_rx,
                        self.lookup_timeout,
                    ));
                    monitor.state.cancel = cancel;
                    monitor.state.task = Some(task);
                    replaced += 1;
                }
                Err(e) => {
                    warn!(identity = %identity, error = %e, "monitor reopen failed; will retry");
                    monitor.state.live.store(false, Ordering::Relaxed);
                }
            }
            self.monitors.lock().await.insert(identity, monitor);
        }

        let uris: Vec<String> = self.resources.lock().await.keys().cloned().collect();
        for uri in uris {
            let Some(mut sub) = self.resources.lock().await.remove(&uri) else {
                continue;
            };
            let _ = sub.state.cancel.send(true);
            if let Some(task) = sub.state.task.take() {
                let _ = task.await;
            }
            match self
                .source
                .open_live_query(
                    &sub.state.filter,
                    LiveQueryOptions { close_on_catchup: false },
                )
                .await
            {
                Ok(lq) => {
                    let (cancel, cancel_rx) = watch::channel(false);
                    sub.state.live.store(true, Ordering::Relaxed);
                    let task = tokio::spawn(resource_task(
                        uri.clone(),
                        lq,
                        sub.sink.clone(),
                        sub.state.processed.clone(),
                        sub.state.live.clone(),
                        cancel_rx,
                    ));
                    sub.state.cancel = cancel;
                    sub.state.task = Some(task);
                    replaced += 1;
                }
                Err(e) => {
                    warn!(uri = %uri, error = %e, "resource reopen failed; will retry");
                    sub.state.live.store(false, Ordering::Relaxed);
                }
            }
            self.resources.lock().await.insert(uri, sub);
        }

        replaced
    }

    /// Close every open live query unconditionally; used at shutdown.
    pub async fn stop_all(&self) {
        let monitors: Vec<Monitor> = self.monitors.lock().await.drain().map(|(_, m)| m).collect();
        for monitor in monitors {
            monitor.state.stop().await;
        }
        let resources: Vec<ResourceSub> =
            self.resources.lock().await.drain().map(|(_, r)| r).collect();
        for sub in resources {
            sub.state.stop().await;
        }
    }
}

/// Consumer task for one identity monitor: classify, build, store.
#[allow(clippy::too_many_arguments)]
async fn monitor_task(
    source: Arc<dyn EventSource>,
    identity: String,
    mut lq: crate::source::LiveQuery,
    store: Arc<Mutex<NotificationStore>>,
    processed: Arc<AtomicU64>,
    live: Arc<AtomicBool>,
    mut cancel: watch::Receiver<bool>,
    lookup_timeout: Duration,
) {
    let mut names: HashMap<String, String> = HashMap::new();
    loop {
        tokio::select! {
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow() {
                    lq.close().await;
                    return;
                }
            }
            ev = lq.recv() => {
                let Some(ev) = ev else {
                    // Transport went away; leave bookkeeping for reconnection.
                    live.store(false, Ordering::Relaxed);
                    return;
                };
                let class = classify(&ev);
                debug!(
                    identity = %identity,
                    event = %ev.id,
                    category = ?class.category,
                    priority = ?class.priority,
                    "processing inbound event"
                );
                let name = match names.get(&ev.pubkey) {
                    Some(name) => name.clone(),
                    None => {
                        let meta = fetch_profile(source.as_ref(), &ev.pubkey, lookup_timeout).await;
                        let name = display_name(&ev.pubkey, meta.as_ref());
                        names.insert(ev.pubkey.clone(), name.clone());
                        name
                    }
                };
                let notification = notify::build(&ev, &identity, &name);
                store.lock().await.store(notification);
                processed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Consumer task for one resource subscription: forward raw events.
async fn resource_task(
    uri: String,
    mut lq: crate::source::LiveQuery,
    sink: mpsc::Sender<ResourceUpdate>,
    processed: Arc<AtomicU64>,
    live: Arc<AtomicBool>,
    mut cancel: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow() {
                    lq.close().await;
                    return;
                }
            }
            ev = lq.recv() => {
                let Some(event) = ev else {
                    live.store(false, Ordering::Relaxed);
                    return;
                };
                processed.fetch_add(1, Ordering::Relaxed);
                let update = ResourceUpdate { uri: uri.clone(), event };
                if sink.send(update).await.is_err() {
                    // Subscriber dropped its receiver; nothing left to feed.
                    return;
                }
            }
        }
    }
}
