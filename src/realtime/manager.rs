//! Subscription manager.
//!
//! Keeps at most one realtime channel per `(project, purpose)` and routes
//! every event on it to the most recently registered callback. The callback
//! lives in a shared cell that the listener task reads on each event, so
//! replacing it never tears the channel down.
//!
//! Transport failures never reach the callback. They are logged, reflected
//! in [`ConnectionStatus`], and retried under the manager's [`RetryPolicy`].
//! Each successful reconnect bumps [`SubscriptionHandle::reconnect_count`] so
//! the view can re-fetch a snapshot.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::feed::{ChangeFeed, FeedSignal, SubscribeRequest};
use super::retry::RetryPolicy;
use crate::board::changes::{ChangeEvent, Table};
use crate::errors::TransportError;

/// Callback invoked for every change event on a channel.
pub type OnChange = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connecting,
    Live,
    Offline,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Live => "live",
            ConnectionStatus::Offline => "offline",
        };
        write!(f, "{}", s)
    }
}

type ChannelKey = (i64, String);

fn normalize_tables(tables: &[Table]) -> Vec<Table> {
    let mut tables = tables.to_vec();
    tables.sort();
    tables.dedup();
    tables
}

// ── Handle ───────────────────────────────────────────────────────────

struct HandleInner {
    project_id: i64,
    purpose: String,
    tables: Vec<Table>,
    callback: RwLock<OnChange>,
    status: watch::Sender<ConnectionStatus>,
    channel: Mutex<Option<String>>,
    reconnects: AtomicU64,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HandleInner {
    fn dispatch(&self, event: &ChangeEvent) {
        let callback = self
            .callback
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        callback(event);
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }

    fn set_channel(&self, name: Option<String>) {
        *self.channel.lock().unwrap_or_else(PoisonError::into_inner) = name;
    }
}

/// Handle to one managed channel. Cheap to clone; all clones refer to the
/// same channel.
#[derive(Clone)]
pub struct SubscriptionHandle {
    inner: Arc<HandleInner>,
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("project_id", &self.inner.project_id)
            .field("purpose", &self.inner.purpose)
            .field("status", &self.status())
            .finish()
    }
}

impl SubscriptionHandle {
    pub fn project_id(&self) -> i64 {
        self.inner.project_id
    }

    pub fn purpose(&self) -> &str {
        &self.inner.purpose
    }

    pub fn tables(&self) -> &[Table] {
        &self.inner.tables
    }

    /// Replace the callback. The channel stays as it is.
    pub fn set_on_change(&self, on_change: OnChange) {
        *self
            .inner
            .callback
            .write()
            .unwrap_or_else(PoisonError::into_inner) = on_change;
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.inner.status.borrow()
    }

    pub fn status_receiver(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    /// Name of the channel currently in use, if a subscribe is in flight or
    /// live. Changes on every reconnect.
    pub fn channel_name(&self) -> Option<String> {
        self.inner
            .channel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Times the channel came back live after having been live before.
    pub fn reconnect_count(&self) -> u64 {
        self.inner.reconnects.load(Ordering::SeqCst)
    }

    pub fn is_open(&self) -> bool {
        !self.inner.cancel.is_cancelled()
    }

    /// True while the listener keeps trying. False after `close` or once
    /// the retry budget is spent.
    pub fn is_running(&self) -> bool {
        self.inner
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    /// Unsubscribe and release the channel. Idempotent, and safe to call
    /// before the channel ever went live. Returns once the transport has
    /// been released.
    pub async fn close(&self) {
        self.inner.cancel.cancel();
        let task = self
            .inner
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Subscription listener ended abnormally");
            }
        }
        self.inner.set_channel(None);
        self.inner.set_status(ConnectionStatus::Offline);
    }

    fn same_as(&self, other: &SubscriptionHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

// ── Manager ──────────────────────────────────────────────────────────

/// Live transport count, decremented when the guard drops.
struct LiveGuard(Arc<AtomicUsize>);

impl LiveGuard {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Clone)]
struct ChannelNamer {
    instance: String,
    seq: Arc<AtomicU64>,
}

impl ChannelNamer {
    fn next(&self, project_id: i64, purpose: &str) -> String {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        format!("board:{}:{}:{}:{}", project_id, purpose, self.instance, seq)
    }
}

pub struct SubscriptionManager {
    feed: Arc<dyn ChangeFeed>,
    retry: RetryPolicy,
    namer: ChannelNamer,
    live: Arc<AtomicUsize>,
    entries: tokio::sync::Mutex<HashMap<ChannelKey, SubscriptionHandle>>,
}

impl SubscriptionManager {
    pub fn new(feed: Arc<dyn ChangeFeed>, retry: RetryPolicy) -> Self {
        Self {
            feed,
            retry,
            namer: ChannelNamer {
                instance: uuid::Uuid::new_v4().simple().to_string(),
                seq: Arc::new(AtomicU64::new(0)),
            },
            live: Arc::new(AtomicUsize::new(0)),
            entries: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Random id distinguishing this manager's channel names from those of
    /// any other manager on the same feed.
    pub fn instance_id(&self) -> &str {
        &self.namer.instance
    }

    /// Open (or reuse) the channel for `(project_id, purpose)`.
    ///
    /// With the same table set as an open channel, only the callback is
    /// swapped and the existing handle comes back. With a different set the
    /// old channel is closed before the new one starts.
    pub async fn open(
        &self,
        project_id: i64,
        purpose: &str,
        tables: &[Table],
        on_change: OnChange,
    ) -> SubscriptionHandle {
        let key = (project_id, purpose.to_string());
        let tables = normalize_tables(tables);
        let mut entries = self.entries.lock().await;

        if let Some(existing) = entries.get(&key) {
            if existing.is_open() && existing.tables() == tables.as_slice() {
                debug!(project_id, purpose, "Reusing channel, swapping callback");
                existing.set_on_change(on_change);
                return existing.clone();
            }
        }
        if let Some(old) = entries.remove(&key) {
            debug!(project_id, purpose, "Table set changed, closing old channel");
            old.close().await;
        }

        let handle = self.spawn_channel(project_id, purpose, tables, on_change);
        entries.insert(key, handle.clone());
        handle
    }

    /// Close a handle and forget it.
    pub async fn close(&self, handle: &SubscriptionHandle) {
        let key = (handle.project_id(), handle.purpose().to_string());
        {
            let mut entries = self.entries.lock().await;
            if entries.get(&key).is_some_and(|h| h.same_as(handle)) {
                entries.remove(&key);
            }
        }
        handle.close().await;
    }

    pub async fn close_all(&self) {
        let handles: Vec<SubscriptionHandle> = {
            let mut entries = self.entries.lock().await;
            entries.drain().map(|(_, h)| h).collect()
        };
        for handle in handles {
            handle.close().await;
        }
    }

    pub async fn is_open(&self, project_id: i64, purpose: &str) -> bool {
        let entries = self.entries.lock().await;
        entries
            .get(&(project_id, purpose.to_string()))
            .is_some_and(|h| h.is_open())
    }

    /// Transport channels currently acknowledged and held.
    pub fn live_channel_count(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    fn spawn_channel(
        &self,
        project_id: i64,
        purpose: &str,
        tables: Vec<Table>,
        on_change: OnChange,
    ) -> SubscriptionHandle {
        let (status, _) = watch::channel(ConnectionStatus::Connecting);
        let inner = Arc::new(HandleInner {
            project_id,
            purpose: purpose.to_string(),
            tables,
            callback: RwLock::new(on_change),
            status,
            channel: Mutex::new(None),
            reconnects: AtomicU64::new(0),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        });

        let listener = ChannelListener {
            inner: inner.clone(),
            feed: self.feed.clone(),
            retry: self.retry.clone(),
            namer: self.namer.clone(),
            live: self.live.clone(),
        };
        let task = tokio::spawn(listener.run());
        *inner.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);

        SubscriptionHandle { inner }
    }
}

// ── Listener task ────────────────────────────────────────────────────

struct ChannelListener {
    inner: Arc<HandleInner>,
    feed: Arc<dyn ChangeFeed>,
    retry: RetryPolicy,
    namer: ChannelNamer,
    live: Arc<AtomicUsize>,
}

enum SessionEnd {
    Cancelled,
    Failed(TransportError),
}

impl ChannelListener {
    async fn run(self) {
        let inner = &self.inner;
        let cancel = inner.cancel.clone();
        let mut attempt: u32 = 0;
        let mut was_live = false;

        loop {
            inner.set_status(ConnectionStatus::Connecting);
            let channel = self.namer.next(inner.project_id, &inner.purpose);
            inner.set_channel(Some(channel.clone()));
            let request = SubscribeRequest {
                channel: channel.clone(),
                tables: inner.tables.clone(),
                project_hint: Some(inner.project_id),
            };

            let subscribed = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.feed.subscribe(&request) => result,
            };

            let failure = match subscribed {
                Ok(mut stream) => {
                    let _live = LiveGuard::new(&self.live);
                    if was_live {
                        inner.reconnects.fetch_add(1, Ordering::SeqCst);
                    }
                    was_live = true;
                    attempt = 0;
                    inner.set_status(ConnectionStatus::Live);
                    info!(%channel, project_id = inner.project_id, "Channel live");

                    let end = loop {
                        tokio::select! {
                            _ = cancel.cancelled() => break SessionEnd::Cancelled,
                            signal = stream.next() => match signal {
                                Some(FeedSignal::Event(event)) => inner.dispatch(&event),
                                Some(FeedSignal::Error(e)) => break SessionEnd::Failed(e),
                                None => break SessionEnd::Failed(TransportError::Closed),
                            },
                        }
                    };
                    match end {
                        SessionEnd::Cancelled => break,
                        SessionEnd::Failed(e) => e,
                    }
                }
                Err(e) => e,
            };

            warn!(%channel, error = %failure, attempt, "Channel unavailable");
            inner.set_status(ConnectionStatus::Offline);

            attempt += 1;
            let Some(delay) = self.retry.delay_for_attempt(attempt) else {
                warn!(
                    project_id = inner.project_id,
                    purpose = %inner.purpose,
                    attempts = attempt - 1,
                    "Giving up on channel, staying offline"
                );
                break;
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        inner.set_channel(None);
        inner.set_status(ConnectionStatus::Offline);
    }
}
