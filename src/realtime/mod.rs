//! Client side of the change feed.
//!
//! [`feed::ChangeFeed`] abstracts the transport (in-process bus or
//! WebSocket). [`manager::SubscriptionManager`] sits on top of it and owns
//! channel lifetime, callbacks, status and retries.

pub mod feed;
pub mod manager;
pub mod retry;
pub mod ws_feed;

pub use feed::{ChangeFeed, FeedSignal, FeedStream, LocalChangeFeed, SubscribeRequest};
pub use manager::{ConnectionStatus, OnChange, SubscriptionHandle, SubscriptionManager};
pub use retry::RetryPolicy;
pub use ws_feed::WsChangeFeed;
