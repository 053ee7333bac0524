use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashSet;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, warn};

use crate::board::changes::{ChangeBus, ChangeEvent, Table};
use crate::errors::TransportError;

/// Buffered signals per subscription before the producer waits.
const FEED_BUFFER: usize = 256;

/// Parameters for opening one channel.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscribeRequest {
    pub channel: String,
    /// Tables to receive; empty means all.
    pub tables: Vec<Table>,
    /// Project the subscriber cares about. Advisory only; the feed does not
    /// filter on it.
    pub project_hint: Option<i64>,
}

impl SubscribeRequest {
    pub fn wants(&self, table: Table) -> bool {
        self.tables.is_empty() || self.tables.contains(&table)
    }
}

/// What a live subscription yields.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedSignal {
    Event(ChangeEvent),
    /// The transport reported a problem. Delivery may be incomplete from
    /// here on.
    Error(TransportError),
}

/// Receiving end of an acknowledged subscription. Dropping it releases the
/// underlying transport.
pub struct FeedStream {
    rx: mpsc::Receiver<FeedSignal>,
    _guard: DropGuard,
}

impl FeedStream {
    pub fn new(rx: mpsc::Receiver<FeedSignal>, cancel: CancellationToken) -> Self {
        Self {
            rx,
            _guard: cancel.drop_guard(),
        }
    }

    /// Next signal, or `None` once the transport has closed.
    pub async fn next(&mut self) -> Option<FeedSignal> {
        self.rx.recv().await
    }
}

/// A source of row-level change events.
///
/// `subscribe` resolves only after the feed has acknowledged the channel.
/// Implementations: [`LocalChangeFeed`] (in-process) and
/// [`WsChangeFeed`](super::ws_feed::WsChangeFeed) (WebSocket).
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn subscribe(&self, request: &SubscribeRequest) -> Result<FeedStream, TransportError>;
}

/// Change feed backed directly by a [`ChangeBus`]. Used when the client
/// runs in the same process as the board server, and in tests.
#[derive(Clone)]
pub struct LocalChangeFeed {
    bus: ChangeBus,
    channels: Arc<DashSet<String>>,
}

impl LocalChangeFeed {
    pub fn new(bus: ChangeBus) -> Self {
        Self {
            bus,
            channels: Arc::new(DashSet::new()),
        }
    }

    /// Number of channels currently subscribed through this feed.
    pub fn live_channels(&self) -> usize {
        self.channels.len()
    }
}

#[async_trait]
impl ChangeFeed for LocalChangeFeed {
    async fn subscribe(&self, request: &SubscribeRequest) -> Result<FeedStream, TransportError> {
        if !self.channels.insert(request.channel.clone()) {
            return Err(TransportError::Rejected {
                channel: request.channel.clone(),
                reason: "Channel already subscribed".into(),
            });
        }

        let mut bus_rx = self.bus.subscribe();
        let (tx, rx) = mpsc::channel(FEED_BUFFER);
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let channels = self.channels.clone();
        let request = request.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    result = bus_rx.recv() => match result {
                        Ok(event) => {
                            if request.wants(event.table)
                                && tx.send(FeedSignal::Event(event)).await.is_err()
                            {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(channel = %request.channel, missed, "Local change feed lagged");
                            let err = TransportError::Protocol(format!("Missed {} events", missed));
                            if tx.send(FeedSignal::Error(err)).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            channels.remove(&request.channel);
            debug!(channel = %request.channel, "Local channel released");
        });

        Ok(FeedStream::new(rx, cancel))
    }
}
