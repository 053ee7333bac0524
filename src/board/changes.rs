use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::sync::broadcast;
use tracing::warn;

/// Tables that emit change events.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Projects,
    Columns,
    Items,
    CustomFields,
    Comments,
    Profiles,
}

impl Table {
    pub const ALL: [Table; 6] = [
        Table::Projects,
        Table::Columns,
        Table::Items,
        Table::CustomFields,
        Table::Comments,
        Table::Profiles,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Projects => "projects",
            Table::Columns => "columns",
            Table::Items => "items",
            Table::CustomFields => "custom_fields",
            Table::Comments => "comments",
            Table::Profiles => "profiles",
        }
    }
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Table {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Table::ALL
            .into_iter()
            .find(|t| t.as_str() == s.trim())
            .ok_or_else(|| anyhow::anyhow!("Unknown table '{}'. Valid values: projects, columns, items, custom_fields, comments, profiles", s))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

/// One row-level change. `row` is the full row after the write (for deletes,
/// the row as it was, with `version` bumped past the last write).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeEvent {
    pub table: Table,
    pub operation: Operation,
    #[serde(default)]
    pub project_id: Option<i64>,
    pub row: serde_json::Value,
    #[serde(default)]
    pub actor_id: Option<String>,
    pub emitted_at: String,
}

impl ChangeEvent {
    pub fn new<T: Serialize>(
        table: Table,
        operation: Operation,
        project_id: Option<i64>,
        row: &T,
        actor_id: Option<&str>,
    ) -> Self {
        let row = serde_json::to_value(row).unwrap_or_else(|e| {
            warn!(table = %table, error = %e, "Failed to serialize change row");
            serde_json::Value::Null
        });
        Self {
            table,
            operation,
            project_id,
            row,
            actor_id: actor_id.map(str::to_string),
            emitted_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Numeric `id` of the row, when it has one (profiles use text ids).
    pub fn row_id(&self) -> Option<i64> {
        self.row.get("id").and_then(|v| v.as_i64())
    }

    pub fn row_version(&self) -> Option<i64> {
        self.row.get("version").and_then(|v| v.as_i64())
    }

    /// Decode the row into a typed model.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.row.clone())
    }
}

/// In-process change feed. Every write handler publishes here after it
/// commits; each WebSocket connection holds one receiver.
#[derive(Clone)]
pub struct ChangeBus {
    tx: broadcast::Sender<ChangeEvent>,
}

impl ChangeBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. Returns the number of receivers it reached; having
    /// none is not an error.
    pub fn publish(&self, event: ChangeEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for ChangeBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::models::Column;

    fn column() -> Column {
        Column {
            id: 4,
            project_id: 1,
            name: "Backlog".into(),
            position: 0,
            version: 3,
        }
    }

    #[test]
    fn test_change_event_serialization() {
        let ev = ChangeEvent::new(Table::Columns, Operation::Insert, Some(1), &column(), Some("alice"));
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["table"], "columns");
        assert_eq!(json["operation"], "insert");
        assert_eq!(json["project_id"], 1);
        assert_eq!(json["row"]["name"], "Backlog");
        assert_eq!(json["actor_id"], "alice");
    }

    #[test]
    fn test_change_event_row_accessors() {
        let ev = ChangeEvent::new(Table::Columns, Operation::Update, Some(1), &column(), None);
        assert_eq!(ev.row_id(), Some(4));
        assert_eq!(ev.row_version(), Some(3));
        let decoded: Column = ev.decode().unwrap();
        assert_eq!(decoded, column());
    }

    #[test]
    fn test_table_from_str() {
        assert_eq!("items".parse::<Table>().unwrap(), Table::Items);
        assert_eq!(" custom_fields".parse::<Table>().unwrap(), Table::CustomFields);
        assert!("cards".parse::<Table>().is_err());
    }

    #[test]
    fn test_table_names_match_serde() {
        for table in Table::ALL {
            let json = serde_json::to_value(table).unwrap();
            assert_eq!(json, table.as_str());
        }
    }

    #[tokio::test]
    async fn test_bus_delivers_to_subscribers() {
        let bus = ChangeBus::new(8);
        let mut rx = bus.subscribe();
        let reached = bus.publish(ChangeEvent::new(Table::Columns, Operation::Delete, Some(1), &column(), None));
        assert_eq!(reached, 1);
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.operation, Operation::Delete);
    }

    #[test]
    fn test_bus_publish_without_receivers_does_not_fail() {
        let bus = ChangeBus::default();
        assert_eq!(bus.receiver_count(), 0);
        let reached = bus.publish(ChangeEvent::new(Table::Columns, Operation::Insert, None, &column(), None));
        assert_eq!(reached, 0);
    }
}
