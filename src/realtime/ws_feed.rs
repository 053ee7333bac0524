use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::feed::{ChangeFeed, FeedSignal, FeedStream, SubscribeRequest};
use crate::board::api::ACTOR_HEADER;
use crate::board::ws::{ClientMessage, ServerMessage};
use crate::errors::TransportError;

const FEED_BUFFER: usize = 256;

/// [`ChangeFeed`] that talks to the board server's `/ws` endpoint.
///
/// Each subscription uses its own socket, so closing one channel never
/// disturbs another. The server only accepts sockets that name a registered
/// profile, set with [`WsChangeFeed::with_actor`].
#[derive(Debug, Clone)]
pub struct WsChangeFeed {
    url: String,
    ack_timeout: Duration,
    actor_id: Option<String>,
}

impl WsChangeFeed {
    /// `url` is the full socket address, e.g. `ws://127.0.0.1:3141/ws`.
    pub fn new(url: impl Into<String>, ack_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            ack_timeout,
            actor_id: None,
        }
    }

    /// Connect as this profile.
    pub fn with_actor(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }

    /// Derive the socket URL from an HTTP base URL.
    pub fn from_base_url(base: &str, ack_timeout: Duration) -> Self {
        let base = base.trim_end_matches('/');
        let url = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}/ws", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}/ws", rest)
        } else {
            format!("{}/ws", base)
        };
        Self::new(url, ack_timeout)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn actor_id(&self) -> Option<&str> {
        self.actor_id.as_deref()
    }
}

fn timeout_error(limit: Duration) -> TransportError {
    TransportError::Timeout {
        millis: limit.as_millis() as u64,
    }
}

#[async_trait]
impl ChangeFeed for WsChangeFeed {
    async fn subscribe(&self, request: &SubscribeRequest) -> Result<FeedStream, TransportError> {
        let mut upgrade = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        if let Some(actor_id) = &self.actor_id {
            let value = HeaderValue::from_str(actor_id).map_err(|e| TransportError::Handshake(e.to_string()))?;
            upgrade.headers_mut().insert(ACTOR_HEADER, value);
        }
        let (socket, _response) = tokio::time::timeout(self.ack_timeout, tokio_tungstenite::connect_async(upgrade))
            .await
            .map_err(|_| timeout_error(self.ack_timeout))?
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let (mut sink, mut source) = socket.split();

        let subscribe = ClientMessage::Subscribe {
            channel: request.channel.clone(),
            tables: request.tables.clone(),
            project_hint: request.project_hint,
        };
        let json = serde_json::to_string(&subscribe).map_err(|e| TransportError::Protocol(e.to_string()))?;
        sink.send(Message::text(json))
            .await
            .map_err(|e| TransportError::Handshake(e.to_string()))?;

        // Wait for the ack for this channel.
        let channel = request.channel.clone();
        let ack = async {
            while let Some(msg) = source.next().await {
                let msg = msg.map_err(|e| TransportError::Handshake(e.to_string()))?;
                let text = match msg {
                    Message::Text(text) => text,
                    Message::Ping(payload) => {
                        let _ = sink.send(Message::Pong(payload)).await;
                        continue;
                    }
                    Message::Close(_) => break,
                    _ => continue,
                };
                match serde_json::from_str::<ServerMessage>(text.as_str()) {
                    Ok(ServerMessage::Subscribed { channel: acked }) if acked == channel => return Ok(()),
                    Ok(ServerMessage::Error { reason, .. }) => {
                        return Err(TransportError::Rejected {
                            channel: channel.clone(),
                            reason,
                        });
                    }
                    Ok(_) => continue,
                    Err(e) => return Err(TransportError::Protocol(e.to_string())),
                }
            }
            Err::<(), TransportError>(TransportError::Handshake("Socket closed before ack".into()))
        };
        tokio::time::timeout(self.ack_timeout, ack)
            .await
            .map_err(|_| timeout_error(self.ack_timeout))??;
        debug!(channel = %request.channel, url = %self.url, "Channel acknowledged");

        let (tx, rx) = mpsc::channel(FEED_BUFFER);
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        let unsubscribe = ClientMessage::Unsubscribe { channel: channel.clone() };
                        if let Ok(json) = serde_json::to_string(&unsubscribe) {
                            let _ = sink.send(Message::text(json)).await;
                        }
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                    msg = source.next() => {
                        let signal = match msg {
                            Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerMessage>(text.as_str()) {
                                Ok(ServerMessage::Change { channel: target, event }) if target == channel => {
                                    Some(FeedSignal::Event(event))
                                }
                                Ok(ServerMessage::Error { reason, .. }) => {
                                    Some(FeedSignal::Error(TransportError::Protocol(reason)))
                                }
                                Ok(_) => None,
                                Err(e) => {
                                    warn!(%channel, error = %e, "Unparseable change feed message");
                                    None
                                }
                            },
                            Some(Ok(Message::Ping(payload))) => {
                                let _ = sink.send(Message::Pong(payload)).await;
                                None
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                let _ = tx.send(FeedSignal::Error(TransportError::Closed)).await;
                                break;
                            }
                            Some(Ok(_)) => None,
                            Some(Err(e)) => {
                                let _ = tx.send(FeedSignal::Error(TransportError::Connect(e.to_string()))).await;
                                break;
                            }
                        };
                        if let Some(signal) = signal {
                            if tx.send(signal).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
            debug!(%channel, "WebSocket channel closed");
        });

        Ok(FeedStream::new(rx, cancel))
    }
}
