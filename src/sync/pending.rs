use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;

use crate::board::models::{Item, ItemField};

/// Identifies one optimistic write so it can be rolled back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PendingToken(u64);

#[derive(Debug, Clone)]
struct PendingField {
    token: PendingToken,
    expected: Value,
    deadline: Instant,
}

#[derive(Debug, Clone)]
struct WriteRecord {
    item_id: i64,
    prior: Item,
}

/// Per-field markers for writes the store has not confirmed yet.
///
/// A marker is cleared when an authoritative row carries the expected value
/// (the echo), when its write is rolled back, or when its deadline passes.
#[derive(Debug)]
pub struct PendingWrites {
    timeout: Duration,
    next_token: u64,
    fields: HashMap<i64, BTreeMap<ItemField, PendingField>>,
    writes: HashMap<PendingToken, WriteRecord>,
}

impl PendingWrites {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            next_token: 0,
            fields: HashMap::new(),
            writes: HashMap::new(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Record a write touching `fields` of an item. `prior` is the item as
    /// it was before the optimistic change, `optimistic` as it is after.
    pub fn mark(&mut self, fields: &[ItemField], prior: &Item, optimistic: &Item, now: Instant) -> PendingToken {
        self.next_token += 1;
        let token = PendingToken(self.next_token);
        let deadline = now + self.timeout;
        let entry = self.fields.entry(optimistic.id).or_default();
        for field in fields {
            entry.insert(
                *field,
                PendingField {
                    token,
                    expected: optimistic.field_value(*field),
                    deadline,
                },
            );
        }
        self.writes.insert(
            token,
            WriteRecord {
                item_id: optimistic.id,
                prior: prior.clone(),
            },
        );
        token
    }

    pub fn is_pending(&self, item_id: i64, field: ItemField) -> bool {
        self.fields
            .get(&item_id)
            .is_some_and(|f| f.contains_key(&field))
    }

    pub fn pending_fields(&self, item_id: i64) -> Vec<ItemField> {
        self.fields
            .get(&item_id)
            .map(|f| f.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn has_pending(&self, item_id: i64) -> bool {
        self.fields.get(&item_id).is_some_and(|f| !f.is_empty())
    }

    /// Number of fields still waiting for confirmation, across all items.
    pub fn len(&self) -> usize {
        self.fields.values().map(|f| f.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clear markers whose expected value `authoritative` now carries.
    /// Returns the fields that were confirmed.
    pub fn confirm(&mut self, authoritative: &Item) -> Vec<ItemField> {
        let Some(pending) = self.fields.get_mut(&authoritative.id) else {
            return Vec::new();
        };
        let confirmed: Vec<ItemField> = pending
            .iter()
            .filter(|(field, p)| authoritative.field_value(**field) == p.expected)
            .map(|(field, _)| *field)
            .collect();
        for field in &confirmed {
            pending.remove(field);
        }
        self.prune(authoritative.id);
        confirmed
    }

    /// Remove the markers still owned by `token` and hand back the prior
    /// item with the fields to restore. Fields overwritten by a later write
    /// are left alone.
    pub fn take_for_rollback(&mut self, token: PendingToken) -> Option<(Item, Vec<ItemField>)> {
        let record = self.writes.remove(&token)?;
        let mut restore = Vec::new();
        if let Some(pending) = self.fields.get_mut(&record.item_id) {
            pending.retain(|field, p| {
                if p.token == token {
                    restore.push(*field);
                    false
                } else {
                    true
                }
            });
        }
        self.prune(record.item_id);
        Some((record.prior, restore))
    }

    /// Drop every marker whose deadline has passed. Returns the affected
    /// item ids; their local state can no longer be trusted.
    pub fn expire(&mut self, now: Instant) -> Vec<i64> {
        let mut expired = Vec::new();
        for (item_id, pending) in self.fields.iter_mut() {
            let before = pending.len();
            pending.retain(|_, p| p.deadline > now);
            if pending.len() != before {
                expired.push(*item_id);
            }
        }
        for item_id in &expired {
            self.prune(*item_id);
        }
        expired.sort_unstable();
        expired
    }

    /// Earliest deadline among outstanding markers.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.fields
            .values()
            .flat_map(|f| f.values().map(|p| p.deadline))
            .min()
    }

    pub fn forget_item(&mut self, item_id: i64) {
        self.fields.remove(&item_id);
        self.writes.retain(|_, w| w.item_id != item_id);
    }

    fn prune(&mut self, item_id: i64) {
        if self.fields.get(&item_id).is_some_and(|f| f.is_empty()) {
            self.fields.remove(&item_id);
        }
        let fields = &self.fields;
        self.writes.retain(|token, w| {
            fields
                .get(&w.item_id)
                .is_some_and(|f| f.values().any(|p| p.token == *token))
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap as Map, BTreeSet};

    fn item(name: &str) -> Item {
        Item {
            id: 1,
            project_id: 1,
            column_id: 1,
            number: 1,
            name: name.into(),
            description: String::new(),
            estimated_time: None,
            actual_time: None,
            is_open: true,
            position: 0,
            fields: Map::new(),
            assignees: BTreeSet::new(),
            version: 1,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    #[test]
    fn test_echo_confirms_only_matching_fields() {
        let mut pending = PendingWrites::new(Duration::from_secs(5));
        let now = Instant::now();
        let prior = item("old");
        let mut optimistic = prior.clone();
        optimistic.name = "new".into();
        optimistic.position = 4;
        pending.mark(&[ItemField::Name, ItemField::Position], &prior, &optimistic, now);

        let mut echo = prior.clone();
        echo.name = "new".into();
        let confirmed = pending.confirm(&echo);
        assert_eq!(confirmed, vec![ItemField::Name]);
        assert!(pending.is_pending(1, ItemField::Position));
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn test_rollback_respects_later_writes() {
        let mut pending = PendingWrites::new(Duration::from_secs(5));
        let now = Instant::now();
        let prior = item("a");
        let mut first = prior.clone();
        first.name = "b".into();
        first.description = "d1".into();
        let t1 = pending.mark(&[ItemField::Name, ItemField::Description], &prior, &first, now);

        let mut second = first.clone();
        second.name = "c".into();
        pending.mark(&[ItemField::Name], &first, &second, now);

        let (restored_from, fields) = pending.take_for_rollback(t1).unwrap();
        assert_eq!(restored_from.name, "a");
        assert_eq!(fields, vec![ItemField::Description]);
        assert!(pending.is_pending(1, ItemField::Name));
        assert!(pending.take_for_rollback(t1).is_none());
    }

    #[test]
    fn test_expire_reports_items() {
        let mut pending = PendingWrites::new(Duration::from_millis(100));
        let now = Instant::now();
        let prior = item("a");
        let mut optimistic = prior.clone();
        optimistic.name = "b".into();
        pending.mark(&[ItemField::Name], &prior, &optimistic, now);
        assert_eq!(pending.next_deadline(), Some(now + Duration::from_millis(100)));

        assert!(pending.expire(now + Duration::from_millis(50)).is_empty());
        assert_eq!(pending.expire(now + Duration::from_millis(100)), vec![1]);
        assert!(pending.is_empty());
        assert_eq!(pending.next_deadline(), None);
    }

    #[test]
    fn test_forget_item_drops_everything() {
        let mut pending = PendingWrites::new(Duration::from_secs(1));
        let prior = item("a");
        let token = pending.mark(&[ItemField::IsOpen], &prior, &prior, Instant::now());
        pending.forget_item(1);
        assert!(!pending.has_pending(1));
        assert!(pending.take_for_rollback(token).is_none());
    }
}
