//! Board server: persistence, access rules and the change feed.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────────┐
//! │  Client  │ ───────> │  server.rs  (axum Router, ServerConfig)          │
//! │          │ <─────── │    └─ api.rs  (route handlers, AppState, Actor)  │
//! └──────────┘          │         │                                        │
//!       ^               │         │ policy::check_*()  inside DbHandle::call│
//!       │               │         v                                        │
//!       │               │  db.rs  (BoardDb, SQLite, FK cascades)           │
//!       │               │         │                                        │
//!       │               │         │ ChangeBus::publish() after commit      │
//!       │  WebSocket    │         v                                        │
//!       └────────────── │  changes.rs ──> ws.rs  (subscribe / ack / change)│
//!                       └──────────────────────────────────────────────────┘
//! ```
//!
//! | Module    | Responsibility                                          |
//! |-----------|---------------------------------------------------------|
//! | `models`  | `Item`, `Column`, `CustomField`, `ItemPatch`, snapshots |
//! | `db`      | SQLite access via `DbHandle` (`Arc<Mutex<_>>`)          |
//! | `policy`  | Row-level access rules and field value validation       |
//! | `changes` | `ChangeEvent` and the in-process `ChangeBus`            |
//! | `ws`      | Change-feed socket: channel registry, keepalive         |
//!
//! Every write handler commits first and then publishes exactly one event
//! per changed row. Column deletes publish only the column event; items
//! removed by the cascade are dropped by subscribers.

pub mod api;
pub mod changes;
pub mod db;
pub mod models;
pub mod policy;
pub mod server;
pub mod ws;
