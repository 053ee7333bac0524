//! Multi-item operations as a sequence of independent writes.
//!
//! Items are processed in the order given. Each write is retried on
//! transport errors. The first item that still fails stops the sequence:
//! earlier items keep their result, later items are not attempted and
//! report as skipped. Nothing is rolled back.

use std::future::Future;

use tracing::{info, warn};

use super::remote::BoardWriter;
use crate::board::models::ItemOutcome;
use crate::errors::WriteError;
use crate::realtime::RetryPolicy;

/// Move `item_ids` into `column_id`. Items land at positions `0..n` in the
/// order given.
pub async fn bulk_move(
    writer: &dyn BoardWriter,
    item_ids: &[i64],
    column_id: i64,
    retry: &RetryPolicy,
) -> Vec<ItemOutcome> {
    let outcomes = run_sequence(item_ids, retry, |index, item_id| async move {
        writer
            .move_item(item_id, column_id, index as i32)
            .await
            .map(ItemOutcome::written)
    })
    .await;
    log_summary("move", &outcomes);
    outcomes
}

pub async fn bulk_delete(writer: &dyn BoardWriter, item_ids: &[i64], retry: &RetryPolicy) -> Vec<ItemOutcome> {
    let outcomes = run_sequence(item_ids, retry, |_, item_id| async move {
        writer.delete_item(item_id).await.map(|()| ItemOutcome::success(item_id))
    })
    .await;
    log_summary("delete", &outcomes);
    outcomes
}

async fn run_sequence<F, Fut>(item_ids: &[i64], retry: &RetryPolicy, mut op: F) -> Vec<ItemOutcome>
where
    F: FnMut(usize, i64) -> Fut,
    Fut: Future<Output = Result<ItemOutcome, WriteError>>,
{
    let mut outcomes = Vec::with_capacity(item_ids.len());
    let mut stopped = false;
    for (index, &item_id) in item_ids.iter().enumerate() {
        if stopped {
            outcomes.push(ItemOutcome::skipped(item_id));
            continue;
        }
        match with_retries(retry, item_id, || op(index, item_id)).await {
            Ok(outcome) => outcomes.push(outcome),
            Err(e) => {
                warn!(item_id, error = %e, "Bulk operation stopped");
                outcomes.push(ItemOutcome::failure(item_id, e.to_string()));
                stopped = true;
            }
        }
    }
    outcomes
}

/// Run `op`, retrying retryable errors on the policy's schedule.
pub async fn with_retries<T, F, Fut>(retry: &RetryPolicy, item_id: i64, mut op: F) -> Result<T, WriteError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, WriteError>>,
{
    let mut failures = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() => {
                failures += 1;
                let Some(delay) = retry.delay_for_attempt(failures) else {
                    return Err(e);
                };
                warn!(item_id, attempt = failures, error = %e, ?delay, "Retrying write");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

fn log_summary(action: &str, outcomes: &[ItemOutcome]) {
    let ok = outcomes.iter().filter(|o| o.ok).count();
    let skipped = outcomes.iter().filter(|o| o.is_skipped()).count();
    info!(
        action,
        total = outcomes.len(),
        ok,
        failed = outcomes.len() - ok - skipped,
        skipped,
        "Bulk operation finished"
    );
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::board::api::CreateItemRequest;
    use crate::board::models::{BoardSnapshot, Item, ItemPatch};
    use crate::sync::remote::BoardReader;
    use async_trait::async_trait;
    use std::collections::{BTreeMap, BTreeSet, HashMap};
    use std::sync::Mutex;
    use std::time::Duration;

    /// In-memory writer with scripted failures.
    #[derive(Default)]
    pub(crate) struct ScriptedWriter {
        pub items: Mutex<BTreeMap<i64, Item>>,
        /// Errors to return, per item id, before the write succeeds.
        pub failures: Mutex<HashMap<i64, Vec<WriteError>>>,
        pub calls: Mutex<Vec<(String, i64)>>,
        pub snapshot: Mutex<Option<BoardSnapshot>>,
    }

    pub(crate) fn item(id: i64, column_id: i64) -> Item {
        Item {
            id,
            project_id: 1,
            column_id,
            number: id,
            name: format!("item {id}"),
            description: String::new(),
            estimated_time: None,
            actual_time: None,
            is_open: true,
            position: 0,
            fields: BTreeMap::new(),
            assignees: BTreeSet::new(),
            version: 1,
            created_at: "now".into(),
            updated_at: "now".into(),
        }
    }

    impl ScriptedWriter {
        pub(crate) fn with_items(ids: &[i64], column_id: i64) -> Self {
            let writer = Self::default();
            {
                let mut items = writer.items.lock().unwrap();
                for id in ids {
                    items.insert(*id, item(*id, column_id));
                }
            }
            writer
        }

        pub(crate) fn fail(&self, item_id: i64, errors: Vec<WriteError>) {
            self.failures.lock().unwrap().insert(item_id, errors);
        }

        pub(crate) fn calls_for(&self, item_id: i64) -> usize {
            self.calls.lock().unwrap().iter().filter(|(_, id)| *id == item_id).count()
        }

        fn record(&self, op: &str, item_id: i64) -> Result<(), WriteError> {
            self.calls.lock().unwrap().push((op.to_string(), item_id));
            let mut failures = self.failures.lock().unwrap();
            if let Some(queue) = failures.get_mut(&item_id) {
                if !queue.is_empty() {
                    return Err(queue.remove(0));
                }
            }
            Ok(())
        }

        fn write(&self, item_id: i64, change: impl FnOnce(&mut Item)) -> Result<Item, WriteError> {
            let mut items = self.items.lock().unwrap();
            let item = items
                .get_mut(&item_id)
                .ok_or_else(|| WriteError::NotFound(format!("Item {}", item_id)))?;
            change(item);
            item.version += 1;
            Ok(item.clone())
        }
    }

    #[async_trait]
    impl BoardWriter for ScriptedWriter {
        async fn create_item(&self, project_id: i64, request: &CreateItemRequest) -> Result<Item, WriteError> {
            let mut items = self.items.lock().unwrap();
            let id = items.keys().max().copied().unwrap_or(0) + 1;
            let mut created = item(id, request.column_id);
            created.project_id = project_id;
            created.name = request.name.clone();
            created.description = request.description.clone();
            items.insert(id, created.clone());
            Ok(created)
        }

        async fn update_item(&self, item_id: i64, patch: &ItemPatch) -> Result<Item, WriteError> {
            self.record("update", item_id)?;
            self.write(item_id, |item| patch.apply_to(item))
        }

        async fn move_item(&self, item_id: i64, column_id: i64, position: i32) -> Result<Item, WriteError> {
            self.record("move", item_id)?;
            self.write(item_id, |item| {
                item.column_id = column_id;
                item.position = position;
            })
        }

        async fn delete_item(&self, item_id: i64) -> Result<(), WriteError> {
            self.record("delete", item_id)?;
            self.items
                .lock()
                .unwrap()
                .remove(&item_id)
                .map(|_| ())
                .ok_or_else(|| WriteError::NotFound(format!("Item {}", item_id)))
        }

        async fn set_field_value(
            &self,
            item_id: i64,
            field_id: i64,
            value: &serde_json::Value,
        ) -> Result<Item, WriteError> {
            self.record("field", item_id)?;
            self.write(item_id, |item| {
                item.fields.insert(field_id, value.clone());
            })
        }
    }

    #[async_trait]
    impl BoardReader for ScriptedWriter {
        async fn fetch_board(&self, _project_id: i64) -> Result<BoardSnapshot, WriteError> {
            self.snapshot
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| WriteError::Transport("no snapshot".into()))
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(40),
        }
    }

    fn rejected() -> WriteError {
        WriteError::Rejected {
            status: 403,
            message: "item is closed".into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_bulk_move_stops_at_failing_item() {
        let writer = ScriptedWriter::with_items(&[1, 2, 3, 4, 5], 10);
        writer.fail(3, vec![rejected()]);

        let outcomes = bulk_move(&writer, &[1, 2, 3, 4, 5], 20, &fast_retry()).await;

        assert_eq!(outcomes.len(), 5);
        assert!(outcomes[0].ok && outcomes[1].ok);
        assert_eq!(outcomes[1].item.as_ref().map(|i| i.column_id), Some(20));
        assert!(outcomes[2].item.is_none());
        assert!(!outcomes[2].ok && !outcomes[2].is_skipped());
        assert!(outcomes[2].error.as_deref().unwrap().contains("closed"));
        assert!(outcomes[3].is_skipped() && outcomes[4].is_skipped());

        let items = writer.items.lock().unwrap();
        let columns: Vec<i64> = (1..=5).map(|id| items[&id].column_id).collect();
        assert_eq!(columns, vec![20, 20, 10, 10, 10]);
        assert_eq!(items[&2].position, 1);
        drop(items);
        // Rejections are not retried; skipped items are never attempted.
        assert_eq!(writer.calls_for(3), 1);
        assert_eq!(writer.calls_for(4), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_errors_are_retried() {
        let writer = ScriptedWriter::with_items(&[1, 2], 10);
        writer.fail(1, vec![WriteError::Transport("reset".into()), WriteError::Transport("reset".into())]);

        let outcomes = bulk_move(&writer, &[1, 2], 20, &fast_retry()).await;

        assert!(outcomes.iter().all(|o| o.ok));
        assert_eq!(writer.calls_for(1), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget_is_bounded() {
        let writer = ScriptedWriter::with_items(&[1, 2], 10);
        writer.fail(1, (0..10).map(|_| WriteError::Transport("down".into())).collect());

        let outcomes = bulk_delete(&writer, &[1, 2], &fast_retry()).await;

        assert!(!outcomes[0].ok);
        assert!(outcomes[1].is_skipped());
        // One try plus max_attempts retries.
        assert_eq!(writer.calls_for(1), 4);
        assert_eq!(writer.items.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_bulk_delete_success() {
        let writer = ScriptedWriter::with_items(&[1, 2, 3], 10);
        let outcomes = bulk_delete(&writer, &[3, 1], &RetryPolicy::default()).await;
        assert_eq!(outcomes, vec![ItemOutcome::success(3), ItemOutcome::success(1)]);
        let remaining: Vec<i64> = writer.items.lock().unwrap().keys().copied().collect();
        assert_eq!(remaining, vec![2]);
    }
}
