use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::bulk::{self, with_retries};
use super::pending::PendingToken;
use super::remote::{BoardReader, BoardWriter};
use super::state::{ApplyOutcome, BoardState};
use crate::board::api::CreateItemRequest;
use crate::board::changes::ChangeEvent;
use crate::board::models::{Item, ItemOutcome, ItemPatch};
use crate::errors::WriteError;
use crate::realtime::{ConnectionStatus, OnChange, RetryPolicy};

/// Callback that forwards change events into a channel, paired with its
/// receiver. Hand the callback to the subscription manager and feed the
/// receiver into [`BoardSession::handle_event`].
pub fn event_sink() -> (OnChange, mpsc::UnboundedReceiver<ChangeEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let callback: OnChange = Arc::new(move |event: &ChangeEvent| {
        let _ = tx.send(event.clone());
    });
    (callback, rx)
}

/// One client's working copy of a board.
///
/// Every user action is applied to [`BoardState`] first, then written to
/// the store. A rejected write rolls the optimistic change back and is
/// returned to the caller; nothing else is affected. Change events and
/// connection status changes are fed in by the owner.
pub struct BoardSession {
    state: BoardState,
    writer: Arc<dyn BoardWriter>,
    reader: Arc<dyn BoardReader>,
    retry: RetryPolicy,
    seen_reconnects: u64,
    needs_refresh: bool,
    refreshes: u64,
}

impl BoardSession {
    pub fn new(
        project_id: i64,
        writer: Arc<dyn BoardWriter>,
        reader: Arc<dyn BoardReader>,
        retry: RetryPolicy,
        pending_timeout: Duration,
    ) -> Self {
        Self {
            state: BoardState::new(project_id, pending_timeout),
            writer,
            reader,
            retry,
            seen_reconnects: 0,
            needs_refresh: true,
            refreshes: 0,
        }
    }

    pub fn state(&self) -> &BoardState {
        &self.state
    }

    pub fn project_id(&self) -> i64 {
        self.state.project_id()
    }

    /// True until a snapshot has loaded, and again after an event the view
    /// could not reconcile.
    pub fn needs_refresh(&self) -> bool {
        self.needs_refresh
    }

    /// Number of snapshots loaded so far.
    pub fn refresh_count(&self) -> u64 {
        self.refreshes
    }

    /// Reload the board snapshot.
    pub async fn refresh(&mut self) -> Result<(), WriteError> {
        let project_id = self.state.project_id();
        let reader = self.reader.clone();
        let snapshot = with_retries(&self.retry, project_id, || reader.fetch_board(project_id)).await?;
        self.state.load_snapshot(snapshot);
        self.needs_refresh = false;
        self.refreshes += 1;
        debug!(project_id, refreshes = self.refreshes, "Board refreshed");
        Ok(())
    }

    // ── Inbound ───────────────────────────────────────────────────────

    /// Reconcile one change event. An event that does not fit the view
    /// triggers a snapshot reload.
    pub async fn handle_event(&mut self, event: &ChangeEvent) -> ApplyOutcome {
        let outcome = self.state.apply_event(event);
        if outcome == ApplyOutcome::NeedsRefetch {
            self.needs_refresh = true;
            if let Err(e) = self.refresh().await {
                warn!(project_id = self.project_id(), error = %e, "Refresh after inconsistent event failed");
            }
        }
        outcome
    }

    /// React to a subscription status change. Events may have been missed
    /// while the channel was down, so a reconnect reloads the snapshot.
    pub async fn on_status(&mut self, status: ConnectionStatus, reconnects: u64) {
        if status != ConnectionStatus::Live || reconnects <= self.seen_reconnects {
            return;
        }
        self.seen_reconnects = reconnects;
        info!(project_id = self.project_id(), reconnects, "Channel reconnected, refreshing board");
        if let Err(e) = self.refresh().await {
            self.needs_refresh = true;
            warn!(project_id = self.project_id(), error = %e, "Refresh after reconnect failed");
        }
    }

    /// Drop optimistic writes that were never confirmed and reload the
    /// board if any expired. Returns whether a reload happened.
    pub async fn expire_pending(&mut self) -> bool {
        if self.state.expire_pending(Instant::now()).is_empty() {
            return false;
        }
        self.needs_refresh = true;
        match self.refresh().await {
            Ok(()) => true,
            Err(e) => {
                warn!(project_id = self.project_id(), error = %e, "Refresh after expired writes failed");
                false
            }
        }
    }

    // ── Actions ───────────────────────────────────────────────────────

    pub async fn move_item(&mut self, item_id: i64, column_id: i64, position: i32) -> Result<(), WriteError> {
        let token = self
            .state
            .apply_local_patch(item_id, &ItemPatch::moving(column_id, position))?;
        let writer = self.writer.clone();
        let result = with_retries(&self.retry, item_id, || writer.move_item(item_id, column_id, position)).await;
        self.settle(token, item_id, result)
    }

    pub async fn update_item(&mut self, item_id: i64, patch: ItemPatch) -> Result<(), WriteError> {
        let token = self.state.apply_local_patch(item_id, &patch)?;
        let writer = self.writer.clone();
        let result = with_retries(&self.retry, item_id, || writer.update_item(item_id, &patch)).await;
        self.settle(token, item_id, result)
    }

    pub async fn set_field_value(
        &mut self,
        item_id: i64,
        field_id: i64,
        value: serde_json::Value,
    ) -> Result<(), WriteError> {
        let token = self.state.apply_local_field_value(item_id, field_id, &value)?;
        let writer = self.writer.clone();
        let result = with_retries(&self.retry, item_id, || writer.set_field_value(item_id, field_id, &value)).await;
        self.settle(token, item_id, result)
    }

    pub async fn delete_item(&mut self, item_id: i64) -> Result<(), WriteError> {
        let removed = self
            .state
            .remove_local(item_id)
            .ok_or_else(|| WriteError::NotFound(format!("Item {}", item_id)))?;
        let writer = self.writer.clone();
        match with_retries(&self.retry, item_id, || writer.delete_item(item_id)).await {
            Ok(()) => Ok(()),
            // Already gone on the store side; keep it gone locally.
            Err(e @ WriteError::NotFound(_)) => Err(e),
            Err(e) => {
                warn!(item_id, error = %e, "Delete rejected, restoring item");
                self.state.restore_local(removed);
                Err(e)
            }
        }
    }

    /// Create an item. Ids and numbers are assigned by the store, so the
    /// item appears once the write returns. Not retried: a lost response
    /// may still have created the item.
    pub async fn create_item(&mut self, request: CreateItemRequest) -> Result<Item, WriteError> {
        let item = self.writer.create_item(self.project_id(), &request).await?;
        if self.state.apply_authoritative(item.clone()) == ApplyOutcome::NeedsRefetch {
            self.needs_refresh = true;
        }
        Ok(item)
    }

    /// Move several items, one write each. Items that fail or are skipped
    /// snap back; earlier successes settle on the stored row.
    pub async fn bulk_move(&mut self, item_ids: &[i64], column_id: i64) -> Vec<ItemOutcome> {
        let mut tokens = Vec::with_capacity(item_ids.len());
        for (index, &item_id) in item_ids.iter().enumerate() {
            let patch = ItemPatch::moving(column_id, index as i32);
            tokens.push(self.state.apply_local_patch(item_id, &patch).ok());
        }
        let outcomes = bulk::bulk_move(self.writer.as_ref(), item_ids, column_id, &self.retry).await;
        for (outcome, token) in outcomes.iter().zip(tokens) {
            match (&outcome.item, token) {
                (Some(item), _) => {
                    if self.state.apply_authoritative(item.clone()) == ApplyOutcome::NeedsRefetch {
                        self.needs_refresh = true;
                    }
                }
                (None, Some(token)) if !outcome.ok => {
                    self.state.rollback(token);
                }
                _ => {}
            }
        }
        outcomes
    }

    pub async fn bulk_delete(&mut self, item_ids: &[i64]) -> Vec<ItemOutcome> {
        let removed: Vec<Option<Item>> = item_ids.iter().map(|id| self.state.remove_local(*id)).collect();
        let outcomes = bulk::bulk_delete(self.writer.as_ref(), item_ids, &self.retry).await;
        for (outcome, item) in outcomes.iter().zip(removed) {
            if let (false, Some(item)) = (outcome.ok, item) {
                self.state.restore_local(item);
            }
        }
        outcomes
    }

    fn settle(
        &mut self,
        token: PendingToken,
        item_id: i64,
        result: Result<Item, WriteError>,
    ) -> Result<(), WriteError> {
        match result {
            Ok(item) => {
                if self.state.apply_authoritative(item) == ApplyOutcome::NeedsRefetch {
                    self.needs_refresh = true;
                }
                Ok(())
            }
            Err(e) => {
                warn!(item_id, error = %e, "Write rejected, rolling back");
                self.state.rollback(token);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::changes::{Operation, Table};
    use crate::board::models::{BoardSnapshot, Column, ItemField, Project};
    use crate::sync::bulk::tests::{ScriptedWriter, item};

    fn column(id: i64, name: &str) -> Column {
        Column {
            id,
            project_id: 1,
            name: name.into(),
            position: id as i32,
            version: 1,
        }
    }

    fn snapshot(writer: &ScriptedWriter) -> BoardSnapshot {
        BoardSnapshot {
            project: Project {
                id: 1,
                name: "Board".into(),
                admin_only: false,
                created_at: "now".into(),
            },
            columns: vec![column(10, "Backlog"), column(20, "Done")],
            items: writer.items.lock().unwrap().values().cloned().collect(),
            fields: vec![],
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 2,
            base_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(10),
        }
    }

    async fn session_with(ids: &[i64]) -> (BoardSession, Arc<ScriptedWriter>) {
        let writer = Arc::new(ScriptedWriter::with_items(ids, 10));
        *writer.snapshot.lock().unwrap() = Some(snapshot(&writer));
        let mut session = BoardSession::new(1, writer.clone(), writer.clone(), fast_retry(), Duration::from_secs(5));
        session.refresh().await.unwrap();
        (session, writer)
    }

    fn rejected() -> WriteError {
        WriteError::Rejected {
            status: 403,
            message: "Not allowed to move: item is closed".into(),
        }
    }

    #[tokio::test]
    async fn test_move_success_is_confirmed() {
        let (mut session, _writer) = session_with(&[1]).await;
        assert!(!session.needs_refresh());

        session.move_item(1, 20, 0).await.unwrap();

        let item = session.state().item(1).unwrap();
        assert_eq!(item.column_id, 20);
        assert_eq!(item.version, 2);
        assert!(!session.state().is_pending(1, ItemField::Column));
    }

    #[tokio::test]
    async fn test_rejected_move_rolls_back() {
        let (mut session, writer) = session_with(&[1]).await;
        writer.fail(1, vec![rejected()]);

        let err = session.move_item(1, 20, 0).await.unwrap_err();

        assert_eq!(err, rejected());
        assert_eq!(session.state().item(1).unwrap().column_id, 10);
        assert_eq!(session.state().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_rejected_update_only_affects_that_action() {
        let (mut session, writer) = session_with(&[1, 2]).await;
        writer.fail(1, vec![rejected()]);

        let patch = ItemPatch {
            name: Some("renamed".into()),
            ..Default::default()
        };
        assert!(session.update_item(1, patch.clone()).await.is_err());
        session.update_item(2, patch).await.unwrap();

        assert_eq!(session.state().item(1).unwrap().name, "item 1");
        assert_eq!(session.state().item(2).unwrap().name, "renamed");
    }

    #[tokio::test]
    async fn test_rejected_delete_restores_item() {
        let (mut session, writer) = session_with(&[1]).await;
        writer.fail(1, vec![rejected()]);

        assert!(session.delete_item(1).await.is_err());
        assert!(session.state().item(1).is_some());

        session.delete_item(1).await.unwrap();
        assert!(session.state().item(1).is_none());
    }

    #[tokio::test]
    async fn test_create_item_appears_in_view() {
        let (mut session, _writer) = session_with(&[]).await;
        let created = session
            .create_item(CreateItemRequest {
                column_id: 10,
                name: "Task 1".into(),
                description: String::new(),
                estimated_time: None,
                actual_time: None,
            })
            .await
            .unwrap();
        let backlog = session.state().items_in(10);
        assert_eq!(backlog.len(), 1);
        assert_eq!(backlog[0].id, created.id);
        assert_eq!(backlog[0].name, "Task 1");
    }

    #[tokio::test]
    async fn test_inconsistent_event_triggers_refresh() {
        let (mut session, writer) = session_with(&[1]).await;
        let before = session.refresh_count();

        // The store gained an item in a column the view has never seen.
        let mut orphan = item(2, 30);
        orphan.name = "orphan".into();
        {
            let mut snap = snapshot(&writer);
            snap.columns.push(column(30, "Review"));
            snap.items.push(orphan.clone());
            *writer.snapshot.lock().unwrap() = Some(snap);
        }
        let ev = ChangeEvent::new(Table::Items, Operation::Insert, Some(1), &orphan, None);

        assert_eq!(session.handle_event(&ev).await, ApplyOutcome::NeedsRefetch);
        assert_eq!(session.refresh_count(), before + 1);
        assert_eq!(session.state().item(2).unwrap().column_id, 30);
        assert!(!session.needs_refresh());
    }

    #[tokio::test]
    async fn test_reconnect_refreshes_once() {
        let (mut session, _writer) = session_with(&[1]).await;
        let before = session.refresh_count();

        session.on_status(ConnectionStatus::Connecting, 0).await;
        session.on_status(ConnectionStatus::Live, 0).await;
        assert_eq!(session.refresh_count(), before);

        session.on_status(ConnectionStatus::Live, 1).await;
        session.on_status(ConnectionStatus::Live, 1).await;
        assert_eq!(session.refresh_count(), before + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_pending_write_refreshes() {
        let (mut session, writer) = session_with(&[1]).await;
        // A local edit whose write never came back.
        let patch = ItemPatch {
            name: Some("local".into()),
            ..Default::default()
        };
        session.state.apply_local_patch(1, &patch).unwrap();
        assert!(!session.expire_pending().await);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(session.expire_pending().await);
        assert_eq!(session.state().item(1).unwrap().name, "item 1");
        assert_eq!(writer.calls_for(1), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bulk_move_partial_failure_in_view() {
        let (mut session, writer) = session_with(&[1, 2, 3, 4]).await;
        writer.fail(3, vec![rejected()]);

        let outcomes = session.bulk_move(&[1, 2, 3, 4], 20).await;

        let ok: Vec<bool> = outcomes.iter().map(|o| o.ok).collect();
        assert_eq!(ok, vec![true, true, false, false]);
        let columns: Vec<i64> = (1..=4).map(|id| session.state().item(id).unwrap().column_id).collect();
        assert_eq!(columns, vec![20, 20, 10, 10]);
        assert_eq!(session.state().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_bulk_move_settles_every_success() {
        let (mut session, writer) = session_with(&[1, 2, 3]).await;

        let outcomes = session.bulk_move(&[3, 1, 2], 20).await;

        assert!(outcomes.iter().all(|o| o.ok));
        assert_eq!(session.state().pending_count(), 0);
        assert!(session.state().next_pending_deadline().is_none());
        let stored = writer.items.lock().unwrap().clone();
        for id in 1..=3 {
            let local = session.state().item(id).unwrap();
            assert_eq!(local.column_id, 20);
            assert_eq!(local.version, stored[&id].version);
        }
        assert_eq!(session.state().item(3).unwrap().position, 0);
    }

    #[tokio::test]
    async fn test_bulk_delete_restores_unattempted_items() {
        let (mut session, writer) = session_with(&[1, 2, 3]).await;
        writer.fail(2, vec![rejected()]);

        let outcomes = session.bulk_delete(&[1, 2, 3]).await;

        assert!(outcomes[0].ok);
        assert!(!outcomes[1].ok);
        assert!(outcomes[2].is_skipped());
        assert!(session.state().item(1).is_none());
        assert!(session.state().item(2).is_some());
        assert!(session.state().item(3).is_some());
    }

    #[tokio::test]
    async fn test_event_sink_forwards_events() {
        let (callback, mut rx) = event_sink();
        let ev = ChangeEvent::new(Table::Items, Operation::Insert, Some(1), &item(1, 10), None);
        callback(&ev);
        assert_eq!(rx.recv().await.unwrap(), ev);
    }
}
