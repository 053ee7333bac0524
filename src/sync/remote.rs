use async_trait::async_trait;

use crate::board::api::CreateItemRequest;
use crate::board::models::{BoardSnapshot, Item, ItemPatch};
use crate::errors::WriteError;

/// Writes against the board store. Every call is one independent,
/// row-level operation; nothing here spans several items atomically.
#[async_trait]
pub trait BoardWriter: Send + Sync {
    async fn create_item(&self, project_id: i64, request: &CreateItemRequest) -> Result<Item, WriteError>;

    async fn update_item(&self, item_id: i64, patch: &ItemPatch) -> Result<Item, WriteError>;

    async fn move_item(&self, item_id: i64, column_id: i64, position: i32) -> Result<Item, WriteError>;

    async fn delete_item(&self, item_id: i64) -> Result<(), WriteError>;

    async fn set_field_value(
        &self,
        item_id: i64,
        field_id: i64,
        value: &serde_json::Value,
    ) -> Result<Item, WriteError>;
}

/// Reads a full board snapshot, used for the initial load and for
/// reconciliation-by-refresh.
#[async_trait]
pub trait BoardReader: Send + Sync {
    async fn fetch_board(&self, project_id: i64) -> Result<BoardSnapshot, WriteError>;
}
