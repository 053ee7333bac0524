use std::collections::HashMap;
use std::time::Duration;

use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::api::{Actor, SharedState};
use super::changes::{ChangeEvent, Table};
use super::models::{Profile, Project};
use super::policy;

/// How often to send WebSocket Ping frames.
pub const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
pub const PONG_TIMEOUT: Duration = Duration::from_secs(60);

/// Keepalive timing for change-feed connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAlive {
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
}

impl Default for KeepAlive {
    fn default() -> Self {
        Self {
            ping_interval: PING_INTERVAL,
            pong_timeout: PONG_TIMEOUT,
        }
    }
}

// ── Wire protocol ────────────────────────────────────────────────────

/// Messages a client sends on the change-feed socket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Open a named channel. An empty `tables` list means every table.
    Subscribe {
        channel: String,
        #[serde(default)]
        tables: Vec<Table>,
        #[serde(default)]
        project_hint: Option<i64>,
    },
    Unsubscribe {
        channel: String,
    },
}

/// Messages the server sends on the change-feed socket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    Subscribed {
        channel: String,
    },
    Unsubscribed {
        channel: String,
    },
    Change {
        channel: String,
        event: ChangeEvent,
    },
    Error {
        #[serde(default)]
        channel: Option<String>,
        reason: String,
    },
}

impl ServerMessage {
    fn error(channel: Option<&str>, reason: impl Into<String>) -> Self {
        ServerMessage::Error {
            channel: channel.map(str::to_string),
            reason: reason.into(),
        }
    }
}

/// Channels subscribed on one connection, with their table filters.
#[derive(Default)]
struct ConnectionChannels {
    tables: HashMap<String, Vec<Table>>,
}

impl ConnectionChannels {
    fn matching<'a>(&'a self, table: Table) -> impl Iterator<Item = &'a String> + 'a {
        self.tables
            .iter()
            .filter(move |(_, tables)| tables.is_empty() || tables.contains(&table))
            .map(|(channel, _)| channel)
    }
}

/// Project visibility for the actor behind one connection.
///
/// Decisions are cached per project. `projects` events refresh the entry
/// for that project and a change to the actor's own admin flag drops the
/// whole cache.
struct FeedViewer {
    profile: Profile,
    projects: HashMap<i64, bool>,
}

impl FeedViewer {
    fn new(profile: Profile) -> Self {
        Self {
            profile,
            projects: HashMap::new(),
        }
    }

    fn observe(&mut self, event: &ChangeEvent) {
        match event.table {
            Table::Profiles => {
                if let Ok(profile) = serde_json::from_value::<Profile>(event.row.clone())
                    && profile.id == self.profile.id
                {
                    if profile.is_admin != self.profile.is_admin {
                        self.projects.clear();
                    }
                    self.profile = profile;
                }
            }
            Table::Projects => {
                if let Ok(project) = serde_json::from_value::<Project>(event.row.clone()) {
                    let visible = policy::can_view_project(&self.profile, &project);
                    self.projects.insert(project.id, visible);
                }
            }
            _ => {}
        }
    }

    /// `None` when the event's project has not been looked up yet.
    fn cached(&self, event: &ChangeEvent) -> Option<bool> {
        match event.project_id {
            None => Some(true),
            Some(id) => self.projects.get(&id).copied(),
        }
    }

    async fn allows(&mut self, event: &ChangeEvent, state: &SharedState) -> bool {
        self.observe(event);
        if let Some(visible) = self.cached(event) {
            return visible;
        }
        let Some(project_id) = event.project_id else {
            return true;
        };
        let visible = match state.db.call(move |db| db.get_project(project_id)).await {
            Ok(Some(project)) => policy::can_view_project(&self.profile, &project),
            // Gone or unreadable: admins only.
            Ok(None) => self.profile.is_admin,
            Err(e) => {
                warn!(project_id, error = %e, "Project lookup for change feed failed");
                self.profile.is_admin
            }
        };
        self.projects.insert(project_id, visible);
        visible
    }

    fn forget(&mut self) {
        self.projects.clear();
    }
}

// ── Handler ──────────────────────────────────────────────────────────

/// Upgrade to the change feed. The caller must name a registered profile in
/// the actor header; events are then filtered by what that profile may see.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
    Actor(actor): Actor,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, actor))
}

async fn handle_socket(socket: WebSocket, state: SharedState, actor: Profile) {
    debug!(actor = %actor.id, "Change feed connection opened");
    let (sender, receiver) = socket.split();
    let rx = state.changes.subscribe();
    let mut channels = ConnectionChannels::default();
    let mut viewer = FeedViewer::new(actor);
    run_socket_loop(sender, receiver, rx, &state, &mut channels, &mut viewer).await;

    // Release this connection's channel names so they can be reused.
    for channel in channels.tables.keys() {
        state.channels.remove(channel);
    }
    debug!(released = channels.tables.len(), "Change feed connection closed");
}

async fn send_json(sender: &mut SplitSink<WebSocket, Message>, msg: &ServerMessage) -> bool {
    match serde_json::to_string(msg) {
        Ok(json) => sender.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "Failed to serialize change feed message");
            true
        }
    }
}

/// Apply one client message to the connection's channel set and build the
/// reply.
fn handle_client_message(
    text: &str,
    state: &SharedState,
    channels: &mut ConnectionChannels,
) -> ServerMessage {
    let msg: ClientMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => return ServerMessage::error(None, format!("Malformed message: {}", e)),
    };
    match msg {
        ClientMessage::Subscribe {
            channel,
            tables,
            project_hint,
        } => {
            if channel.trim().is_empty() {
                return ServerMessage::error(None, "Channel name must not be empty");
            }
            // A name already live anywhere is rejected rather than shadowed.
            if !state.channels.insert(channel.clone()) {
                warn!(%channel, "Rejected duplicate channel subscription");
                return ServerMessage::error(Some(&channel), "Channel already subscribed");
            }
            debug!(%channel, ?tables, ?project_hint, "Channel subscribed");
            channels.tables.insert(channel.clone(), tables);
            ServerMessage::Subscribed { channel }
        }
        ClientMessage::Unsubscribe { channel } => {
            if channels.tables.remove(&channel).is_some() {
                state.channels.remove(&channel);
            }
            ServerMessage::Unsubscribed { channel }
        }
    }
}

/// Core WebSocket loop with ping/pong keepalive.
///
/// Combines change forwarding, client message handling, and periodic
/// ping/pong health checking into a single select loop. If no Pong is
/// received within the pong timeout after a Ping is sent, the connection
/// is considered dead and the loop exits.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut rx: broadcast::Receiver<ChangeEvent>,
    state: &SharedState,
    channels: &mut ConnectionChannels,
    viewer: &mut FeedViewer,
) {
    let keepalive = state.keepalive;
    let mut ping_interval = tokio::time::interval(keepalive.ping_interval);
    // The first tick completes immediately; consume it so the first real
    // ping fires after one interval has elapsed.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            // ── Periodic ping ───────────────────────────────────────
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > keepalive.pong_timeout {
                    warn!("Change feed client missed pong, closing");
                    break;
                }
                if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            // ── Change forwarding ───────────────────────────────────
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        let targets: Vec<String> = if viewer.allows(&event, state).await {
                            channels.matching(event.table).cloned().collect()
                        } else {
                            Vec::new()
                        };
                        for channel in targets {
                            let msg = ServerMessage::Change { channel, event: event.clone() };
                            if !send_json(&mut sender, &msg).await {
                                return;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        // Delivery is no longer complete; tell every channel so
                        // clients re-fetch.
                        warn!(missed, "Change feed receiver lagged");
                        viewer.forget();
                        let names: Vec<String> = channels.tables.keys().cloned().collect();
                        for channel in names {
                            let msg = ServerMessage::error(Some(&channel), format!("Missed {} events", missed));
                            if !send_json(&mut sender, &msg).await {
                                return;
                            }
                        }
                    }
                }
            }

            // ── Client messages ─────────────────────────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let reply = handle_client_message(text.as_str(), state, channels);
                        if !send_json(&mut sender, &reply).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    // Best-effort close frame
    let _ = sender.send(Message::Close(None)).await;
}

// ── Tests ────────────────────────────────────────────────────────────
