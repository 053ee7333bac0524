use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Profile {
    pub id: String,
    pub display_name: String,
    pub is_admin: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Project {
    pub id: i64,
    pub name: String,
    pub admin_only: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Column {
    pub id: i64,
    pub project_id: i64,
    pub name: String,
    pub position: i32,
    pub version: i64,
}

/// A card on the board. `number` is the per-project display number
/// (`#1`, `#2`, ...) and is never reused inside a project.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Item {
    pub id: i64,
    pub project_id: i64,
    pub column_id: i64,
    pub number: i64,
    pub name: String,
    pub description: String,
    pub estimated_time: Option<f64>,
    pub actual_time: Option<f64>,
    pub is_open: bool,
    pub position: i32,
    #[serde(default)]
    pub fields: BTreeMap<i64, serde_json::Value>,
    #[serde(default)]
    pub assignees: BTreeSet<String>,
    pub version: i64,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Text,
    Number,
    Date,
    Select,
    Multiselect,
    UserSelect,
    UserMultiselect,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Number => "number",
            Self::Date => "date",
            Self::Select => "select",
            Self::Multiselect => "multiselect",
            Self::UserSelect => "user_select",
            Self::UserMultiselect => "user_multiselect",
        }
    }

    /// Whether values of this type reference profiles.
    pub fn is_user_kind(&self) -> bool {
        matches!(self, Self::UserSelect | Self::UserMultiselect)
    }

    pub fn is_multi(&self) -> bool {
        matches!(self, Self::Multiselect | Self::UserMultiselect)
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FieldType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "number" => Ok(Self::Number),
            "date" => Ok(Self::Date),
            "select" => Ok(Self::Select),
            "multiselect" => Ok(Self::Multiselect),
            "user_select" => Ok(Self::UserSelect),
            "user_multiselect" => Ok(Self::UserMultiselect),
            _ => Err(format!("Invalid field type: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CustomField {
    pub id: i64,
    pub project_id: i64,
    pub name: String,
    pub field_type: FieldType,
    pub position: i32,
    pub default_value: Option<serde_json::Value>,
    #[serde(default)]
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Comment {
    pub id: i64,
    pub item_id: i64,
    pub author_id: String,
    pub content: String,
    pub resolved: bool,
    #[serde(default)]
    pub mentions: BTreeSet<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Fields of an [`Item`] that can be written independently. Used to track
/// which parts of an optimistic update are still waiting for confirmation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ItemField {
    Name,
    Description,
    EstimatedTime,
    ActualTime,
    IsOpen,
    Column,
    Position,
    Fields,
    Assignees,
}

/// Partial update of an item. `None` leaves the field untouched; for the
/// nullable time fields `Some(None)` clears the value.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ItemPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "double_option"
    )]
    pub estimated_time: Option<Option<f64>>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "double_option"
    )]
    pub actual_time: Option<Option<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_open: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<i32>,
}

fn double_option<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

impl ItemPatch {
    pub fn moving(column_id: i64, position: i32) -> Self {
        Self {
            column_id: Some(column_id),
            position: Some(position),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.touched().is_empty()
    }

    pub fn is_move(&self) -> bool {
        self.column_id.is_some() || self.position.is_some()
    }

    pub fn touched(&self) -> Vec<ItemField> {
        let mut out = Vec::new();
        if self.name.is_some() {
            out.push(ItemField::Name);
        }
        if self.description.is_some() {
            out.push(ItemField::Description);
        }
        if self.estimated_time.is_some() {
            out.push(ItemField::EstimatedTime);
        }
        if self.actual_time.is_some() {
            out.push(ItemField::ActualTime);
        }
        if self.is_open.is_some() {
            out.push(ItemField::IsOpen);
        }
        if self.column_id.is_some() {
            out.push(ItemField::Column);
        }
        if self.position.is_some() {
            out.push(ItemField::Position);
        }
        out
    }

    /// Apply the patch to an item in place.
    pub fn apply_to(&self, item: &mut Item) {
        if let Some(name) = &self.name {
            item.name = name.clone();
        }
        if let Some(description) = &self.description {
            item.description = description.clone();
        }
        if let Some(estimated) = self.estimated_time {
            item.estimated_time = estimated;
        }
        if let Some(actual) = self.actual_time {
            item.actual_time = actual;
        }
        if let Some(open) = self.is_open {
            item.is_open = open;
        }
        if let Some(column_id) = self.column_id {
            item.column_id = column_id;
        }
        if let Some(position) = self.position {
            item.position = position;
        }
    }
}

impl Item {
    /// JSON value of a single field, for comparing pending writes against
    /// authoritative rows.
    pub fn field_value(&self, field: ItemField) -> serde_json::Value {
        match field {
            ItemField::Name => serde_json::json!(self.name),
            ItemField::Description => serde_json::json!(self.description),
            ItemField::EstimatedTime => serde_json::json!(self.estimated_time),
            ItemField::ActualTime => serde_json::json!(self.actual_time),
            ItemField::IsOpen => serde_json::json!(self.is_open),
            ItemField::Column => serde_json::json!(self.column_id),
            ItemField::Position => serde_json::json!(self.position),
            ItemField::Fields => serde_json::json!(self.fields),
            ItemField::Assignees => serde_json::json!(self.assignees),
        }
    }

    /// Copy one field from `other` into `self`.
    pub fn copy_field_from(&mut self, other: &Item, field: ItemField) {
        match field {
            ItemField::Name => self.name = other.name.clone(),
            ItemField::Description => self.description = other.description.clone(),
            ItemField::EstimatedTime => self.estimated_time = other.estimated_time,
            ItemField::ActualTime => self.actual_time = other.actual_time,
            ItemField::IsOpen => self.is_open = other.is_open,
            ItemField::Column => self.column_id = other.column_id,
            ItemField::Position => self.position = other.position,
            ItemField::Fields => self.fields = other.fields.clone(),
            ItemField::Assignees => self.assignees = other.assignees.clone(),
        }
    }
}

// API view types

/// Full snapshot of one project's board, used for the initial load and for
/// reconciliation-by-refresh after a reconnect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardSnapshot {
    pub project: Project,
    pub columns: Vec<Column>,
    pub items: Vec<Item>,
    pub fields: Vec<CustomField>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnView {
    pub column: Column,
    pub items: Vec<Item>,
}

impl BoardSnapshot {
    /// Group items under their columns, both ordered by position.
    pub fn column_views(&self) -> Vec<ColumnView> {
        let mut columns = self.columns.clone();
        columns.sort_by_key(|c| (c.position, c.id));
        columns
            .into_iter()
            .map(|column| {
                let mut items: Vec<Item> = self
                    .items
                    .iter()
                    .filter(|i| i.column_id == column.id)
                    .cloned()
                    .collect();
                items.sort_by_key(|i| (i.position, i.id));
                ColumnView { column, items }
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemDetail {
    pub item: Item,
    pub comments: Vec<Comment>,
}

/// Per-item result of a bulk operation. Bulk operations are a sequence of
/// independent writes, so each item reports on its own. Items after the
/// first failure are not attempted and report as skipped.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ItemOutcome {
    pub item_id: i64,
    pub ok: bool,
    pub error: Option<String>,
    /// The row as stored after a successful write, when the write returns one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item: Option<Item>,
}

impl ItemOutcome {
    pub fn success(item_id: i64) -> Self {
        Self {
            item_id,
            ok: true,
            error: None,
            item: None,
        }
    }

    pub fn written(item: Item) -> Self {
        Self {
            item_id: item.id,
            ok: true,
            error: None,
            item: Some(item),
        }
    }

    pub fn failure(item_id: i64, error: impl Into<String>) -> Self {
        Self {
            item_id,
            ok: false,
            error: Some(error.into()),
            item: None,
        }
    }

    pub fn skipped(item_id: i64) -> Self {
        Self::failure(item_id, SKIPPED_REASON)
    }

    pub fn is_skipped(&self) -> bool {
        self.error.as_deref() == Some(SKIPPED_REASON)
    }
}

const SKIPPED_REASON: &str = "Skipped after an earlier failure";
