use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::pending::{PendingToken, PendingWrites};
use crate::board::changes::{ChangeEvent, Operation, Table};
use crate::board::models::{BoardSnapshot, Column, CustomField, Item, ItemField, ItemPatch, Project};
use crate::errors::WriteError;

/// Tombstone version for rows without a version column. Their ids are never
/// reused, so any later event for them is stale.
const UNVERSIONED: i64 = i64::MAX;

/// Result of reconciling one change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// State changed.
    Applied,
    /// Not for this board (other project, or a table the view does not hold).
    Ignored,
    /// Older than what the view already has.
    Stale,
    /// The event does not fit the local state. Reload a snapshot.
    NeedsRefetch,
}

/// Client-side view of one project's board.
///
/// Remote events are merged last-write-wins by row version. Deletes leave a
/// tombstone so late updates cannot resurrect a row. Optimistic local edits
/// are tracked per field in [`PendingWrites`] and survive remote events
/// until the store confirms or rejects them.
#[derive(Debug)]
pub struct BoardState {
    project_id: i64,
    project: Option<Project>,
    columns: BTreeMap<i64, Column>,
    items: BTreeMap<i64, Item>,
    fields: BTreeMap<i64, CustomField>,
    tombstones: HashMap<(Table, i64), i64>,
    pending: PendingWrites,
}

impl BoardState {
    pub fn new(project_id: i64, pending_timeout: Duration) -> Self {
        Self {
            project_id,
            project: None,
            columns: BTreeMap::new(),
            items: BTreeMap::new(),
            fields: BTreeMap::new(),
            tombstones: HashMap::new(),
            pending: PendingWrites::new(pending_timeout),
        }
    }

    pub fn from_snapshot(snapshot: BoardSnapshot, pending_timeout: Duration) -> Self {
        let mut state = Self::new(snapshot.project.id, pending_timeout);
        state.load_snapshot(snapshot);
        state
    }

    // ── Accessors ─────────────────────────────────────────────────────

    pub fn project_id(&self) -> i64 {
        self.project_id
    }

    pub fn project(&self) -> Option<&Project> {
        self.project.as_ref()
    }

    pub fn column(&self, id: i64) -> Option<&Column> {
        self.columns.get(&id)
    }

    pub fn column_named(&self, name: &str) -> Option<&Column> {
        self.columns.values().find(|c| c.name == name)
    }

    /// Columns ordered by position.
    pub fn columns(&self) -> Vec<&Column> {
        let mut columns: Vec<&Column> = self.columns.values().collect();
        columns.sort_by_key(|c| (c.position, c.id));
        columns
    }

    pub fn item(&self, id: i64) -> Option<&Item> {
        self.items.get(&id)
    }

    pub fn items(&self) -> impl Iterator<Item = &Item> {
        self.items.values()
    }

    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    /// Items of one column ordered by position.
    pub fn items_in(&self, column_id: i64) -> Vec<&Item> {
        let mut items: Vec<&Item> = self.items.values().filter(|i| i.column_id == column_id).collect();
        items.sort_by_key(|i| (i.position, i.id));
        items
    }

    pub fn field(&self, id: i64) -> Option<&CustomField> {
        self.fields.get(&id)
    }

    pub fn fields(&self) -> impl Iterator<Item = &CustomField> {
        self.fields.values()
    }

    pub fn is_pending(&self, item_id: i64, field: ItemField) -> bool {
        self.pending.is_pending(item_id, field)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn next_pending_deadline(&self) -> Option<Instant> {
        self.pending.next_deadline()
    }

    /// Current view as a snapshot, if a project has been loaded.
    pub fn snapshot(&self) -> Option<BoardSnapshot> {
        let project = self.project.clone()?;
        Some(BoardSnapshot {
            project,
            columns: self.columns.values().cloned().collect(),
            items: self.items.values().cloned().collect(),
            fields: self.fields.values().cloned().collect(),
        })
    }

    // ── Snapshot ──────────────────────────────────────────────────────

    /// Replace the view with `snapshot`.
    ///
    /// Fields with a pending write keep their optimistic value unless the
    /// snapshot already carries it. Tombstones are dropped when the snapshot
    /// holds the row at the same or a newer version.
    pub fn load_snapshot(&mut self, snapshot: BoardSnapshot) {
        if snapshot.project.id != self.project_id {
            debug!(from = self.project_id, to = snapshot.project.id, "Switching board project");
            self.project_id = snapshot.project.id;
        }
        let previous = std::mem::take(&mut self.items);

        self.project = Some(snapshot.project);
        self.columns = snapshot.columns.into_iter().map(|c| (c.id, c)).collect();
        self.fields = snapshot.fields.into_iter().map(|f| (f.id, f)).collect();
        for mut item in snapshot.items {
            self.pending.confirm(&item);
            if let Some(local) = previous.get(&item.id) {
                for field in self.pending.pending_fields(item.id) {
                    item.copy_field_from(local, field);
                }
            }
            self.items.insert(item.id, item);
        }
        for id in previous.keys() {
            if !self.items.contains_key(id) {
                self.pending.forget_item(*id);
            }
        }

        let columns = &self.columns;
        let items = &self.items;
        let fields = &self.fields;
        self.tombstones.retain(|(table, id), deleted| {
            let live = match table {
                Table::Columns => columns.get(id).map(|c| c.version),
                Table::Items => items.get(id).map(|i| i.version),
                Table::CustomFields => fields.get(id).map(|_| UNVERSIONED),
                _ => None,
            };
            !matches!(live, Some(version) if version >= *deleted)
        });
        debug!(
            project_id = self.project_id,
            columns = self.columns.len(),
            items = self.items.len(),
            "Board snapshot loaded"
        );
    }

    // ── Remote events ─────────────────────────────────────────────────

    /// Reconcile one change event into the view.
    pub fn apply_event(&mut self, event: &ChangeEvent) -> ApplyOutcome {
        if event.project_id != Some(self.project_id) {
            return ApplyOutcome::Ignored;
        }
        let outcome = match event.table {
            Table::Projects => self.apply_project(event),
            Table::Columns => self.apply_column(event),
            Table::Items => self.apply_item(event),
            Table::CustomFields => self.apply_field(event),
            Table::Comments | Table::Profiles => ApplyOutcome::Ignored,
        };
        debug!(
            table = %event.table,
            operation = ?event.operation,
            row_id = ?event.row_id(),
            ?outcome,
            "Change event reconciled"
        );
        outcome
    }

    /// Merge a row returned directly by a write. Same rules as an update
    /// event, except that an unknown item is inserted.
    pub fn apply_authoritative(&mut self, item: Item) -> ApplyOutcome {
        if item.project_id != self.project_id {
            return ApplyOutcome::Ignored;
        }
        self.merge_item(item, false)
    }

    fn apply_project(&mut self, event: &ChangeEvent) -> ApplyOutcome {
        if event.operation == Operation::Delete {
            self.project = None;
            self.columns.clear();
            for id in std::mem::take(&mut self.items).into_keys() {
                self.pending.forget_item(id);
            }
            self.fields.clear();
            return ApplyOutcome::Applied;
        }
        match decode::<Project>(event) {
            Some(project) => {
                self.project = Some(project);
                ApplyOutcome::Applied
            }
            None => ApplyOutcome::NeedsRefetch,
        }
    }

    fn apply_column(&mut self, event: &ChangeEvent) -> ApplyOutcome {
        let Some(column) = decode::<Column>(event) else {
            return ApplyOutcome::NeedsRefetch;
        };
        if column.project_id != self.project_id {
            return ApplyOutcome::Ignored;
        }
        if event.operation == Operation::Delete {
            return self.remove_column(column.id, column.version);
        }
        if self.tombstoned(Table::Columns, column.id, column.version) {
            return ApplyOutcome::Stale;
        }
        match self.columns.get(&column.id).map(|c| c.version) {
            Some(current) if current >= column.version => ApplyOutcome::Stale,
            None if event.operation == Operation::Update => ApplyOutcome::NeedsRefetch,
            _ => {
                self.columns.insert(column.id, column);
                ApplyOutcome::Applied
            }
        }
    }

    /// Remove a column and, in the same step, every item in it.
    fn remove_column(&mut self, id: i64, version: i64) -> ApplyOutcome {
        self.tombstone(Table::Columns, id, version);
        if self.columns.remove(&id).is_none() {
            return ApplyOutcome::Stale;
        }
        let doomed: Vec<(i64, i64)> = self
            .items
            .values()
            .filter(|i| i.column_id == id)
            .map(|i| (i.id, i.version))
            .collect();
        for (item_id, item_version) in &doomed {
            self.items.remove(item_id);
            self.pending.forget_item(*item_id);
            self.tombstone(Table::Items, *item_id, item_version + 1);
        }
        debug!(column_id = id, items = doomed.len(), "Column removed with its items");
        ApplyOutcome::Applied
    }

    fn apply_item(&mut self, event: &ChangeEvent) -> ApplyOutcome {
        let Some(item) = decode::<Item>(event) else {
            return ApplyOutcome::NeedsRefetch;
        };
        if item.project_id != self.project_id {
            return ApplyOutcome::Ignored;
        }
        match event.operation {
            Operation::Delete => self.remove_item(item.id, item.version),
            Operation::Insert => self.merge_item(item, false),
            Operation::Update => self.merge_item(item, true),
        }
    }

    fn merge_item(&mut self, remote: Item, require_known: bool) -> ApplyOutcome {
        if self.tombstoned(Table::Items, remote.id, remote.version) {
            return ApplyOutcome::Stale;
        }
        let current = self.items.get(&remote.id).map(|i| i.version);
        if current.is_none_or(|v| remote.version >= v) {
            self.pending.confirm(&remote);
        }
        match current {
            Some(v) if v >= remote.version => return ApplyOutcome::Stale,
            None if require_known => {
                warn!(item_id = remote.id, "Update for an item not in the view");
                return ApplyOutcome::NeedsRefetch;
            }
            _ => {}
        }
        if !self.columns.contains_key(&remote.column_id) {
            warn!(item_id = remote.id, column_id = remote.column_id, "Item references an unknown column");
            return ApplyOutcome::NeedsRefetch;
        }

        let mut merged = remote;
        if let Some(local) = self.items.get(&merged.id) {
            for field in self.pending.pending_fields(merged.id) {
                merged.copy_field_from(local, field);
            }
        }
        self.items.insert(merged.id, merged);
        ApplyOutcome::Applied
    }

    fn remove_item(&mut self, id: i64, version: i64) -> ApplyOutcome {
        self.tombstone(Table::Items, id, version);
        self.pending.forget_item(id);
        if self.items.remove(&id).is_some() {
            ApplyOutcome::Applied
        } else {
            ApplyOutcome::Stale
        }
    }

    fn apply_field(&mut self, event: &ChangeEvent) -> ApplyOutcome {
        let Some(field) = decode::<CustomField>(event) else {
            return ApplyOutcome::NeedsRefetch;
        };
        if field.project_id != self.project_id {
            return ApplyOutcome::Ignored;
        }
        if event.operation == Operation::Delete {
            self.tombstone(Table::CustomFields, field.id, UNVERSIONED);
            if self.fields.remove(&field.id).is_none() {
                return ApplyOutcome::Stale;
            }
            for item in self.items.values_mut() {
                item.fields.remove(&field.id);
            }
            return ApplyOutcome::Applied;
        }
        if self.tombstones.contains_key(&(Table::CustomFields, field.id)) {
            return ApplyOutcome::Stale;
        }
        if event.operation == Operation::Update && !self.fields.contains_key(&field.id) {
            return ApplyOutcome::NeedsRefetch;
        }
        self.fields.insert(field.id, field);
        ApplyOutcome::Applied
    }

    fn tombstoned(&self, table: Table, id: i64, version: i64) -> bool {
        self.tombstones.get(&(table, id)).is_some_and(|deleted| *deleted >= version)
    }

    fn tombstone(&mut self, table: Table, id: i64, version: i64) {
        let entry = self.tombstones.entry((table, id)).or_insert(version);
        *entry = (*entry).max(version);
    }

    // ── Optimistic writes ─────────────────────────────────────────────

    /// Apply `patch` locally and mark every touched field pending.
    pub fn apply_local_patch(&mut self, item_id: i64, patch: &ItemPatch) -> Result<PendingToken, WriteError> {
        if patch.is_empty() {
            return Err(WriteError::Rejected {
                status: 400,
                message: "Empty item patch".into(),
            });
        }
        if let Some(column_id) = patch.column_id {
            if !self.columns.contains_key(&column_id) {
                return Err(WriteError::Rejected {
                    status: 400,
                    message: format!("Column {} is not on this board", column_id),
                });
            }
        }
        let prior = self.require_item(item_id)?.clone();
        let mut optimistic = prior.clone();
        patch.apply_to(&mut optimistic);
        let token = self.pending.mark(&patch.touched(), &prior, &optimistic, Instant::now());
        self.items.insert(item_id, optimistic);
        Ok(token)
    }

    /// Set (or with `null`, clear) one custom field value locally.
    pub fn apply_local_field_value(
        &mut self,
        item_id: i64,
        field_id: i64,
        value: &serde_json::Value,
    ) -> Result<PendingToken, WriteError> {
        if !self.fields.contains_key(&field_id) {
            return Err(WriteError::NotFound(format!("Custom field {}", field_id)));
        }
        let prior = self.require_item(item_id)?.clone();
        let mut optimistic = prior.clone();
        if value.is_null() {
            optimistic.fields.remove(&field_id);
        } else {
            optimistic.fields.insert(field_id, value.clone());
        }
        let token = self.pending.mark(&[ItemField::Fields], &prior, &optimistic, Instant::now());
        self.items.insert(item_id, optimistic);
        Ok(token)
    }

    /// Remove an item locally ahead of its delete. The tombstone matches the
    /// version the store's delete event will carry.
    pub fn remove_local(&mut self, item_id: i64) -> Option<Item> {
        let item = self.items.remove(&item_id)?;
        self.pending.forget_item(item_id);
        self.tombstone(Table::Items, item_id, item.version + 1);
        Some(item)
    }

    /// Undo [`remove_local`](Self::remove_local) after the delete was
    /// rejected.
    pub fn restore_local(&mut self, item: Item) {
        if self.tombstones.get(&(Table::Items, item.id)) == Some(&(item.version + 1)) {
            self.tombstones.remove(&(Table::Items, item.id));
        }
        if !self.items.contains_key(&item.id) {
            self.items.insert(item.id, item);
        }
    }

    /// Restore the prior values of fields still pending from `token`.
    /// Returns false if the token is unknown or already settled.
    pub fn rollback(&mut self, token: PendingToken) -> bool {
        let Some((prior, fields)) = self.pending.take_for_rollback(token) else {
            return false;
        };
        let Some(item) = self.items.get_mut(&prior.id) else {
            return false;
        };
        for field in &fields {
            item.copy_field_from(&prior, *field);
        }
        debug!(item_id = prior.id, ?fields, "Optimistic write rolled back");
        true
    }

    /// Drop pending markers past their deadline. The returned items may
    /// show values the store never accepted and should be re-fetched.
    pub fn expire_pending(&mut self, now: Instant) -> Vec<i64> {
        let expired = self.pending.expire(now);
        if !expired.is_empty() {
            warn!(items = ?expired, "Pending writes timed out without confirmation");
        }
        expired
    }

    fn require_item(&self, item_id: i64) -> Result<&Item, WriteError> {
        self.items
            .get(&item_id)
            .ok_or_else(|| WriteError::NotFound(format!("Item {}", item_id)))
    }
}

fn decode<T: DeserializeOwned>(event: &ChangeEvent) -> Option<T> {
    match event.decode() {
        Ok(row) => Some(row),
        Err(e) => {
            warn!(table = %event.table, error = %e, "Undecodable change event row");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::models::FieldType;
    use std::collections::BTreeSet;

    const TIMEOUT: Duration = Duration::from_secs(10);

    fn column(id: i64, name: &str, position: i32) -> Column {
        Column {
            id,
            project_id: 1,
            name: name.into(),
            position,
            version: 1,
        }
    }

    fn item(id: i64, column_id: i64, name: &str) -> Item {
        Item {
            id,
            project_id: 1,
            column_id,
            number: id,
            name: name.into(),
            description: String::new(),
            estimated_time: None,
            actual_time: None,
            is_open: true,
            position: id as i32,
            fields: BTreeMap::new(),
            assignees: BTreeSet::new(),
            version: 1,
            created_at: "now".into(),
            updated_at: "now".into(),
        }
    }

    fn board() -> BoardState {
        let snapshot = BoardSnapshot {
            project: Project {
                id: 1,
                name: "Board".into(),
                admin_only: false,
                created_at: "now".into(),
            },
            columns: vec![column(10, "Backlog", 0), column(11, "In Progress", 1), column(12, "Done", 2)],
            items: vec![item(1, 10, "one"), item(2, 10, "two"), item(3, 11, "three")],
            fields: vec![CustomField {
                id: 5,
                project_id: 1,
                name: "Priority".into(),
                field_type: FieldType::Select,
                position: 0,
                default_value: None,
                options: vec!["low".into(), "high".into()],
            }],
        };
        BoardState::from_snapshot(snapshot, TIMEOUT)
    }

    fn event<T: serde::Serialize>(table: Table, operation: Operation, row: &T) -> ChangeEvent {
        ChangeEvent::new(table, operation, Some(1), row, Some("alice"))
    }

    fn bumped(mut item: Item, version: i64) -> Item {
        item.version = version;
        item
    }

    #[test]
    fn test_other_projects_are_ignored() {
        let mut state = board();
        let mut foreign = item(99, 10, "elsewhere");
        foreign.project_id = 2;
        let ev = ChangeEvent::new(Table::Items, Operation::Insert, Some(2), &foreign, None);
        assert_eq!(state.apply_event(&ev), ApplyOutcome::Ignored);
        assert!(state.item(99).is_none());

        let ev = ChangeEvent::new(Table::Profiles, Operation::Insert, None, &serde_json::json!({"id": "x"}), None);
        assert_eq!(state.apply_event(&ev), ApplyOutcome::Ignored);
    }

    #[test]
    fn test_insert_places_item_in_column() {
        let mut state = board();
        let created = item(4, 10, "Task 1");
        assert_eq!(state.apply_event(&event(Table::Items, Operation::Insert, &created)), ApplyOutcome::Applied);
        let backlog: Vec<&str> = state.items_in(10).iter().map(|i| i.name.as_str()).collect();
        assert_eq!(backlog, vec!["one", "two", "Task 1"]);
    }

    #[test]
    fn test_update_then_delete_removes_item() {
        let mut state = board();
        let mut updated = bumped(item(1, 10, "one"), 2);
        updated.name = "renamed".into();
        assert_eq!(state.apply_event(&event(Table::Items, Operation::Update, &updated)), ApplyOutcome::Applied);
        let deleted = bumped(item(1, 10, "renamed"), 3);
        assert_eq!(state.apply_event(&event(Table::Items, Operation::Delete, &deleted)), ApplyOutcome::Applied);
        assert!(state.item(1).is_none());
        assert_eq!(state.item_count(), 2);
    }

    #[test]
    fn test_delete_before_late_update_stays_deleted() {
        let mut state = board();
        let deleted = bumped(item(1, 10, "one"), 3);
        assert_eq!(state.apply_event(&event(Table::Items, Operation::Delete, &deleted)), ApplyOutcome::Applied);

        let late = bumped(item(1, 10, "late"), 2);
        assert_eq!(state.apply_event(&event(Table::Items, Operation::Update, &late)), ApplyOutcome::Stale);
        assert!(state.item(1).is_none());
        // Only that item is gone.
        assert!(state.item(2).is_some());
        assert!(state.item(3).is_some());
    }

    #[test]
    fn test_stale_update_is_dropped() {
        let mut state = board();
        let newer = bumped(item(2, 11, "two"), 3);
        state.apply_event(&event(Table::Items, Operation::Update, &newer));
        let older = bumped(item(2, 10, "two"), 2);
        assert_eq!(state.apply_event(&event(Table::Items, Operation::Update, &older)), ApplyOutcome::Stale);
        assert_eq!(state.item(2).unwrap().column_id, 11);
    }

    #[test]
    fn test_column_delete_cascades_in_one_step() {
        let mut state = board();
        let mut backlog = column(10, "Backlog", 0);
        backlog.version = 2;
        let outcome = state.apply_event(&event(Table::Columns, Operation::Delete, &backlog));
        assert_eq!(outcome, ApplyOutcome::Applied);
        assert!(state.column(10).is_none());
        assert!(state.items_in(10).is_empty());
        assert!(state.item(1).is_none());
        assert!(state.item(2).is_none());
        assert!(state.item(3).is_some());

        // A late update for a cascaded item does not bring it back.
        let late = bumped(item(1, 10, "one"), 2);
        assert_eq!(state.apply_event(&event(Table::Items, Operation::Update, &late)), ApplyOutcome::Stale);
    }

    #[test]
    fn test_inconsistent_events_need_refetch() {
        let mut state = board();
        let orphan = item(7, 404, "orphan");
        assert_eq!(state.apply_event(&event(Table::Items, Operation::Insert, &orphan)), ApplyOutcome::NeedsRefetch);

        let unknown = bumped(item(8, 10, "ghost"), 2);
        assert_eq!(state.apply_event(&event(Table::Items, Operation::Update, &unknown)), ApplyOutcome::NeedsRefetch);

        let garbage = ChangeEvent::new(Table::Items, Operation::Update, Some(1), &serde_json::json!({"id": 1}), None);
        assert_eq!(state.apply_event(&garbage), ApplyOutcome::NeedsRefetch);
    }

    #[test]
    fn test_pending_field_survives_unrelated_remote_update() {
        let mut state = board();
        state
            .apply_local_patch(1, &ItemPatch { name: Some("mine".into()), ..Default::default() })
            .unwrap();
        assert!(state.is_pending(1, ItemField::Name));

        // Someone else edits the description.
        let mut remote = bumped(item(1, 10, "one"), 2);
        remote.description = "theirs".into();
        assert_eq!(state.apply_event(&event(Table::Items, Operation::Update, &remote)), ApplyOutcome::Applied);
        let current = state.item(1).unwrap();
        assert_eq!(current.name, "mine");
        assert_eq!(current.description, "theirs");
        assert!(state.is_pending(1, ItemField::Name));
    }

    #[test]
    fn test_echo_clears_pending_without_regressing_fields() {
        let mut state = board();
        state
            .apply_local_patch(2, &ItemPatch::moving(12, 0))
            .unwrap();
        assert_eq!(state.item(2).unwrap().column_id, 12);

        let mut echo = bumped(item(2, 12, "two"), 2);
        echo.position = 0;
        assert_eq!(state.apply_event(&event(Table::Items, Operation::Update, &echo)), ApplyOutcome::Applied);
        assert_eq!(state.pending_count(), 0);
        let current = state.item(2).unwrap();
        assert_eq!(current.column_id, 12);
        assert_eq!(current.version, 2);

        // The same echo again changes nothing.
        assert_eq!(state.apply_event(&event(Table::Items, Operation::Update, &echo)), ApplyOutcome::Stale);
    }

    #[test]
    fn test_write_response_then_echo() {
        let mut state = board();
        state
            .apply_local_patch(1, &ItemPatch { is_open: Some(false), ..Default::default() })
            .unwrap();
        let mut response = bumped(item(1, 10, "one"), 2);
        response.is_open = false;
        assert_eq!(state.apply_authoritative(response.clone()), ApplyOutcome::Applied);
        assert_eq!(state.pending_count(), 0);
        assert_eq!(state.apply_event(&event(Table::Items, Operation::Update, &response)), ApplyOutcome::Stale);
        assert!(!state.item(1).unwrap().is_open);
    }

    #[test]
    fn test_rollback_restores_prior_values() {
        let mut state = board();
        let token = state
            .apply_local_patch(3, &ItemPatch { name: Some("draft".into()), column_id: Some(12), ..Default::default() })
            .unwrap();
        assert_eq!(state.item(3).unwrap().column_id, 12);
        assert!(state.rollback(token));
        let current = state.item(3).unwrap();
        assert_eq!(current.name, "three");
        assert_eq!(current.column_id, 11);
        assert_eq!(state.pending_count(), 0);
        assert!(!state.rollback(token));
    }

    #[test]
    fn test_local_patch_validation() {
        let mut state = board();
        let err = state.apply_local_patch(42, &ItemPatch::moving(10, 0)).unwrap_err();
        assert!(matches!(err, WriteError::NotFound(_)));
        let err = state.apply_local_patch(1, &ItemPatch::moving(404, 0)).unwrap_err();
        assert!(matches!(err, WriteError::Rejected { status: 400, .. }));
        let err = state.apply_local_patch(1, &ItemPatch::default()).unwrap_err();
        assert!(matches!(err, WriteError::Rejected { .. }));
    }

    #[test]
    fn test_expired_pending_reports_refetch() {
        let mut state = board();
        state
            .apply_local_patch(1, &ItemPatch { name: Some("x".into()), ..Default::default() })
            .unwrap();
        assert!(state.expire_pending(Instant::now()).is_empty());
        let expired = state.expire_pending(Instant::now() + TIMEOUT + Duration::from_millis(1));
        assert_eq!(expired, vec![1]);
        assert_eq!(state.pending_count(), 0);
    }

    #[test]
    fn test_local_remove_and_restore() {
        let mut state = board();
        let removed = state.remove_local(2).unwrap();
        assert!(state.item(2).is_none());

        // The delete echo is already accounted for.
        let echo = bumped(item(2, 10, "two"), 2);
        assert_eq!(state.apply_event(&event(Table::Items, Operation::Delete, &echo)), ApplyOutcome::Stale);

        let mut state = board();
        let removed_again = state.remove_local(2).unwrap();
        assert_eq!(removed, removed_again);
        state.restore_local(removed_again);
        assert_eq!(state.item(2).unwrap().name, "two");
        let update = bumped(item(2, 11, "two"), 2);
        assert_eq!(state.apply_event(&event(Table::Items, Operation::Update, &update)), ApplyOutcome::Applied);
    }

    #[test]
    fn test_field_delete_strips_item_values() {
        let mut state = board();
        state.apply_local_field_value(1, 5, &serde_json::json!("high")).unwrap();
        assert_eq!(state.item(1).unwrap().fields.get(&5), Some(&serde_json::json!("high")));

        let field = state.field(5).unwrap().clone();
        assert_eq!(state.apply_event(&event(Table::CustomFields, Operation::Delete, &field)), ApplyOutcome::Applied);
        assert!(state.field(5).is_none());
        assert!(state.item(1).unwrap().fields.is_empty());
        assert_eq!(state.apply_event(&event(Table::CustomFields, Operation::Update, &field)), ApplyOutcome::Stale);
    }

    #[test]
    fn test_snapshot_reload_keeps_optimistic_values() {
        let mut state = board();
        state
            .apply_local_patch(1, &ItemPatch { name: Some("pending".into()), ..Default::default() })
            .unwrap();
        let mut snapshot = state.snapshot().unwrap();
        for item in snapshot.items.iter_mut() {
            if item.id == 1 {
                item.name = "server".into();
                item.version = 2;
            }
        }
        snapshot.items.retain(|i| i.id != 3);
        state.load_snapshot(snapshot);

        assert_eq!(state.item(1).unwrap().name, "pending");
        assert_eq!(state.item(1).unwrap().version, 2);
        assert!(state.item(3).is_none());
        assert!(state.is_pending(1, ItemField::Name));
    }

    #[test]
    fn test_column_update_and_insert() {
        let mut state = board();
        let mut renamed = column(11, "Doing", 1);
        renamed.version = 2;
        assert_eq!(state.apply_event(&event(Table::Columns, Operation::Update, &renamed)), ApplyOutcome::Applied);
        assert_eq!(state.column_named("Doing").unwrap().id, 11);

        let added = column(13, "Review", 3);
        assert_eq!(state.apply_event(&event(Table::Columns, Operation::Insert, &added)), ApplyOutcome::Applied);
        let names: Vec<&str> = state.columns().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["Backlog", "Doing", "Done", "Review"]);
    }
}
