use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};

use super::models::*;
use crate::errors::BoardError;

/// Columns created with every new project unless the caller names its own.
pub const DEFAULT_COLUMNS: [&str; 3] = ["Backlog", "In Progress", "Done"];

/// Async-safe handle to the board database.
///
/// Wraps `BoardDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, preventing synchronous SQLite
/// I/O from tying up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<BoardDb>>,
}

impl DbHandle {
    pub fn new(db: BoardDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&BoardDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. Only for startup and tests.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, BoardDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

pub struct BoardDb {
    conn: Connection,
}

/// Fields accepted when creating an item.
#[derive(Debug, Clone, Default)]
pub struct NewItem {
    pub column_id: i64,
    pub name: String,
    pub description: String,
    pub estimated_time: Option<f64>,
    pub actual_time: Option<f64>,
}

/// Fields accepted when creating a custom field.
#[derive(Debug, Clone)]
pub struct NewField {
    pub name: String,
    pub field_type: FieldType,
    pub default_value: Option<serde_json::Value>,
    pub options: Vec<String>,
}

struct FieldRow {
    id: i64,
    project_id: i64,
    name: String,
    field_type: String,
    position: i32,
    default_value: Option<String>,
    options: String,
}

impl FieldRow {
    fn into_field(self) -> Result<CustomField> {
        let field_type = FieldType::from_str(&self.field_type).map_err(|e| anyhow::anyhow!(e))?;
        let default_value = match self.default_value {
            Some(raw) => Some(
                serde_json::from_str(&raw).context("Failed to parse field default value")?,
            ),
            None => None,
        };
        let options: Vec<String> =
            serde_json::from_str(&self.options).context("Failed to parse field options")?;
        Ok(CustomField {
            id: self.id,
            project_id: self.project_id,
            name: self.name,
            field_type,
            position: self.position,
            default_value,
            options,
        })
    }
}

const ITEM_COLUMNS: &str = "id, project_id, column_id, number, name, description, estimated_time, actual_time, is_open, position, version, created_at, updated_at";

fn item_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Item> {
    Ok(Item {
        id: row.get(0)?,
        project_id: row.get(1)?,
        column_id: row.get(2)?,
        number: row.get(3)?,
        name: row.get(4)?,
        description: row.get(5)?,
        estimated_time: row.get(6)?,
        actual_time: row.get(7)?,
        is_open: row.get(8)?,
        position: row.get(9)?,
        fields: BTreeMap::new(),
        assignees: BTreeSet::new(),
        version: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

fn column_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Column> {
    Ok(Column {
        id: row.get(0)?,
        project_id: row.get(1)?,
        name: row.get(2)?,
        position: row.get(3)?,
        version: row.get(4)?,
    })
}

fn comment_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Comment> {
    Ok(Comment {
        id: row.get(0)?,
        item_id: row.get(1)?,
        author_id: row.get(2)?,
        content: row.get(3)?,
        resolved: row.get(4)?,
        mentions: BTreeSet::new(),
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

impl BoardDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS profiles (
                    id TEXT PRIMARY KEY,
                    display_name TEXT NOT NULL,
                    is_admin INTEGER NOT NULL DEFAULT 0
                );

                CREATE TABLE IF NOT EXISTS projects (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    admin_only INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS columns (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    name TEXT NOT NULL,
                    position INTEGER NOT NULL DEFAULT 0,
                    version INTEGER NOT NULL DEFAULT 1
                );

                CREATE TABLE IF NOT EXISTS items (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    column_id INTEGER NOT NULL REFERENCES columns(id) ON DELETE CASCADE,
                    number INTEGER NOT NULL,
                    name TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    estimated_time REAL,
                    actual_time REAL,
                    is_open INTEGER NOT NULL DEFAULT 1,
                    position INTEGER NOT NULL DEFAULT 0,
                    version INTEGER NOT NULL DEFAULT 1,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                    UNIQUE(project_id, number)
                );

                CREATE TABLE IF NOT EXISTS custom_fields (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                    name TEXT NOT NULL,
                    field_type TEXT NOT NULL,
                    position INTEGER NOT NULL DEFAULT 0,
                    default_value TEXT,
                    options TEXT NOT NULL DEFAULT '[]'
                );

                CREATE TABLE IF NOT EXISTS field_values (
                    item_id INTEGER NOT NULL REFERENCES items(id) ON DELETE CASCADE,
                    field_id INTEGER NOT NULL REFERENCES custom_fields(id) ON DELETE CASCADE,
                    value TEXT NOT NULL,
                    PRIMARY KEY (item_id, field_id)
                );

                CREATE TABLE IF NOT EXISTS item_assignees (
                    item_id INTEGER NOT NULL REFERENCES items(id) ON DELETE CASCADE,
                    profile_id TEXT NOT NULL REFERENCES profiles(id) ON DELETE CASCADE,
                    PRIMARY KEY (item_id, profile_id)
                );

                CREATE TABLE IF NOT EXISTS comments (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    item_id INTEGER NOT NULL REFERENCES items(id) ON DELETE CASCADE,
                    author_id TEXT NOT NULL REFERENCES profiles(id),
                    content TEXT NOT NULL,
                    resolved INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS comment_mentions (
                    comment_id INTEGER NOT NULL REFERENCES comments(id) ON DELETE CASCADE,
                    profile_id TEXT NOT NULL REFERENCES profiles(id) ON DELETE CASCADE,
                    PRIMARY KEY (comment_id, profile_id)
                );

                CREATE INDEX IF NOT EXISTS idx_columns_project ON columns(project_id);
                CREATE INDEX IF NOT EXISTS idx_items_project ON items(project_id);
                CREATE INDEX IF NOT EXISTS idx_items_column ON items(column_id);
                CREATE INDEX IF NOT EXISTS idx_fields_project ON custom_fields(project_id);
                CREATE INDEX IF NOT EXISTS idx_comments_item ON comments(item_id);
                ",
            )
            .context("Failed to create tables")?;

        // Additive migrations (safe to re-run).
        // We only ignore "duplicate column" errors; any other error is propagated.
        match self.conn.execute(
            "ALTER TABLE projects ADD COLUMN item_seq INTEGER NOT NULL DEFAULT 0",
            [],
        ) {
            Ok(_) => {}
            Err(e) if e.to_string().contains("duplicate column") => {}
            Err(e) => return Err(anyhow::anyhow!("Failed to add item_seq column: {}", e)),
        }

        Ok(())
    }

    // ── Profiles ──────────────────────────────────────────────────────

    pub fn create_profile(&self, id: &str, display_name: &str, is_admin: bool) -> Result<Profile> {
        self.conn
            .execute(
                "INSERT INTO profiles (id, display_name, is_admin) VALUES (?1, ?2, ?3)",
                params![id, display_name, is_admin],
            )
            .context("Failed to insert profile")?;
        self.get_profile(id)?
            .context("Profile not found after insert")
    }

    pub fn get_profile(&self, id: &str) -> Result<Option<Profile>> {
        self.conn
            .query_row(
                "SELECT id, display_name, is_admin FROM profiles WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Profile {
                        id: row.get(0)?,
                        display_name: row.get(1)?,
                        is_admin: row.get(2)?,
                    })
                },
            )
            .optional()
            .context("Failed to query profile")
    }

    pub fn list_profiles(&self) -> Result<Vec<Profile>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, display_name, is_admin FROM profiles ORDER BY id")
            .context("Failed to prepare list_profiles")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(Profile {
                    id: row.get(0)?,
                    display_name: row.get(1)?,
                    is_admin: row.get(2)?,
                })
            })
            .context("Failed to query profiles")?;
        let mut profiles = Vec::new();
        for row in rows {
            profiles.push(row.context("Failed to read profile row")?);
        }
        Ok(profiles)
    }

    pub fn update_profile_name(&self, id: &str, display_name: &str) -> Result<Profile> {
        self.conn
            .execute(
                "UPDATE profiles SET display_name = ?1 WHERE id = ?2",
                params![display_name, id],
            )
            .context("Failed to update profile name")?;
        self.get_profile(id)?
            .ok_or_else(|| BoardError::ProfileNotFound { id: id.to_string() }.into())
    }

    pub fn set_profile_admin(&self, id: &str, is_admin: bool) -> Result<Profile> {
        self.conn
            .execute(
                "UPDATE profiles SET is_admin = ?1 WHERE id = ?2",
                params![is_admin, id],
            )
            .context("Failed to update profile admin flag")?;
        self.get_profile(id)?
            .ok_or_else(|| BoardError::ProfileNotFound { id: id.to_string() }.into())
    }

    // ── Projects ──────────────────────────────────────────────────────

    /// Create a project together with its initial columns.
    pub fn create_project(
        &self,
        name: &str,
        admin_only: bool,
        columns: &[String],
    ) -> Result<(Project, Vec<Column>)> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        tx.execute(
            "INSERT INTO projects (name, admin_only) VALUES (?1, ?2)",
            params![name, admin_only],
        )
        .context("Failed to insert project")?;
        let project_id = tx.last_insert_rowid();
        for (position, column) in columns.iter().enumerate() {
            tx.execute(
                "INSERT INTO columns (project_id, name, position) VALUES (?1, ?2, ?3)",
                params![project_id, column, position as i32],
            )
            .context("Failed to insert initial column")?;
        }
        tx.commit().context("Failed to commit project")?;

        let project = self
            .get_project(project_id)?
            .context("Project not found after insert")?;
        let columns = self.list_columns(project_id)?;
        Ok((project, columns))
    }

    pub fn list_projects(&self) -> Result<Vec<Project>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, admin_only, created_at FROM projects ORDER BY id")
            .context("Failed to prepare list_projects")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(Project {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    admin_only: row.get(2)?,
                    created_at: row.get(3)?,
                })
            })
            .context("Failed to query projects")?;
        let mut projects = Vec::new();
        for row in rows {
            projects.push(row.context("Failed to read project row")?);
        }
        Ok(projects)
    }

    pub fn get_project(&self, id: i64) -> Result<Option<Project>> {
        self.conn
            .query_row(
                "SELECT id, name, admin_only, created_at FROM projects WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Project {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        admin_only: row.get(2)?,
                        created_at: row.get(3)?,
                    })
                },
            )
            .optional()
            .context("Failed to query project")
    }

    pub fn require_project(&self, id: i64) -> Result<Project> {
        self.get_project(id)?
            .ok_or_else(|| BoardError::ProjectNotFound { id }.into())
    }

    pub fn update_project(
        &self,
        id: i64,
        name: Option<&str>,
        admin_only: Option<bool>,
    ) -> Result<Project> {
        if let Some(n) = name {
            self.conn
                .execute("UPDATE projects SET name = ?1 WHERE id = ?2", params![n, id])
                .context("Failed to update project name")?;
        }
        if let Some(flag) = admin_only {
            self.conn
                .execute(
                    "UPDATE projects SET admin_only = ?1 WHERE id = ?2",
                    params![flag, id],
                )
                .context("Failed to update project admin_only flag")?;
        }
        self.require_project(id)
    }

    pub fn delete_project(&self, id: i64) -> Result<bool> {
        let count = self
            .conn
            .execute("DELETE FROM projects WHERE id = ?1", params![id])
            .context("Failed to delete project")?;
        Ok(count > 0)
    }

    // ── Columns ───────────────────────────────────────────────────────

    pub fn create_column(&self, project_id: i64, name: &str) -> Result<Column> {
        self.require_project(project_id)?;
        let max_pos: i32 = self
            .conn
            .query_row(
                "SELECT COALESCE(MAX(position), -1) FROM columns WHERE project_id = ?1",
                params![project_id],
                |row| row.get(0),
            )
            .context("Failed to get max column position")?;
        self.conn
            .execute(
                "INSERT INTO columns (project_id, name, position) VALUES (?1, ?2, ?3)",
                params![project_id, name, max_pos + 1],
            )
            .context("Failed to insert column")?;
        let id = self.conn.last_insert_rowid();
        self.require_column(id)
    }

    pub fn get_column(&self, id: i64) -> Result<Option<Column>> {
        self.conn
            .query_row(
                "SELECT id, project_id, name, position, version FROM columns WHERE id = ?1",
                params![id],
                column_from_row,
            )
            .optional()
            .context("Failed to query column")
    }

    pub fn require_column(&self, id: i64) -> Result<Column> {
        self.get_column(id)?
            .ok_or_else(|| BoardError::ColumnNotFound { id }.into())
    }

    pub fn list_columns(&self, project_id: i64) -> Result<Vec<Column>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, project_id, name, position, version FROM columns
                 WHERE project_id = ?1 ORDER BY position, id",
            )
            .context("Failed to prepare list_columns")?;
        let rows = stmt
            .query_map(params![project_id], column_from_row)
            .context("Failed to query columns")?;
        let mut columns = Vec::new();
        for row in rows {
            columns.push(row.context("Failed to read column row")?);
        }
        Ok(columns)
    }

    pub fn update_column(
        &self,
        id: i64,
        name: Option<&str>,
        position: Option<i32>,
    ) -> Result<Column> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        if let Some(n) = name {
            tx.execute("UPDATE columns SET name = ?1 WHERE id = ?2", params![n, id])
                .context("Failed to update column name")?;
        }
        if let Some(p) = position {
            tx.execute(
                "UPDATE columns SET position = ?1 WHERE id = ?2",
                params![p, id],
            )
            .context("Failed to update column position")?;
        }
        tx.execute(
            "UPDATE columns SET version = version + 1 WHERE id = ?1",
            params![id],
        )
        .context("Failed to bump column version")?;
        tx.commit().context("Failed to commit column update")?;
        self.require_column(id)
    }

    /// Number of closed items in a column. Deleting a column cascades to
    /// its items, so this decides who may delete it.
    pub fn count_closed_items(&self, column_id: i64) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM items WHERE column_id = ?1 AND is_open = 0",
                params![column_id],
                |row| row.get(0),
            )
            .context("Failed to count closed items")
    }

    /// Delete a column and (via cascade) every item in it. Returns the
    /// deleted row with its version bumped, so the delete event orders
    /// after every earlier write to the column.
    pub fn delete_column(&self, id: i64) -> Result<Option<Column>> {
        let mut column = match self.get_column(id)? {
            Some(c) => c,
            None => return Ok(None),
        };
        self.conn
            .execute("DELETE FROM columns WHERE id = ?1", params![id])
            .context("Failed to delete column")?;
        column.version += 1;
        Ok(Some(column))
    }

    // ── Items ─────────────────────────────────────────────────────────

    pub fn create_item(&self, new: &NewItem) -> Result<Item> {
        let column = self.require_column(new.column_id)?;
        let fields = self.list_fields(column.project_id)?;

        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        // Display numbers come from a per-project counter so they are never
        // reused after a delete.
        tx.execute(
            "UPDATE projects SET item_seq = item_seq + 1 WHERE id = ?1",
            params![column.project_id],
        )
        .context("Failed to bump item sequence")?;
        let number: i64 = tx
            .query_row(
                "SELECT item_seq FROM projects WHERE id = ?1",
                params![column.project_id],
                |row| row.get(0),
            )
            .context("Failed to read item sequence")?;

        let max_pos: i32 = tx
            .query_row(
                "SELECT COALESCE(MAX(position), -1) FROM items WHERE column_id = ?1",
                params![column.id],
                |row| row.get(0),
            )
            .context("Failed to get max item position")?;

        tx.execute(
            "INSERT INTO items (project_id, column_id, number, name, description, estimated_time, actual_time, position)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                column.project_id,
                column.id,
                number,
                new.name,
                new.description,
                new.estimated_time,
                new.actual_time,
                max_pos + 1
            ],
        )
        .context("Failed to insert item")?;
        let id = tx.last_insert_rowid();

        for field in fields.iter().filter(|f| f.default_value.is_some()) {
            let value = field
                .default_value
                .as_ref()
                .map(|v| v.to_string())
                .unwrap_or_default();
            tx.execute(
                "INSERT INTO field_values (item_id, field_id, value) VALUES (?1, ?2, ?3)",
                params![id, field.id, value],
            )
            .context("Failed to insert default field value")?;
        }

        tx.commit().context("Failed to commit item")?;
        self.require_item(id)
    }

    fn load_item_extras(&self, item: &mut Item) -> Result<()> {
        let mut stmt = self
            .conn
            .prepare("SELECT field_id, value FROM field_values WHERE item_id = ?1")
            .context("Failed to prepare field_values query")?;
        let rows = stmt
            .query_map(params![item.id], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })
            .context("Failed to query field values")?;
        for row in rows {
            let (field_id, raw) = row.context("Failed to read field value row")?;
            let value = serde_json::from_str(&raw).context("Failed to parse field value")?;
            item.fields.insert(field_id, value);
        }

        let mut stmt = self
            .conn
            .prepare("SELECT profile_id FROM item_assignees WHERE item_id = ?1")
            .context("Failed to prepare assignees query")?;
        let rows = stmt
            .query_map(params![item.id], |row| row.get::<_, String>(0))
            .context("Failed to query assignees")?;
        for row in rows {
            item.assignees
                .insert(row.context("Failed to read assignee row")?);
        }
        Ok(())
    }

    pub fn get_item(&self, id: i64) -> Result<Option<Item>> {
        let item = self
            .conn
            .query_row(
                &format!("SELECT {ITEM_COLUMNS} FROM items WHERE id = ?1"),
                params![id],
                item_from_row,
            )
            .optional()
            .context("Failed to query item")?;
        match item {
            Some(mut item) => {
                self.load_item_extras(&mut item)?;
                Ok(Some(item))
            }
            None => Ok(None),
        }
    }

    pub fn require_item(&self, id: i64) -> Result<Item> {
        self.get_item(id)?
            .ok_or_else(|| BoardError::ItemNotFound { id }.into())
    }

    pub fn list_items(&self, project_id: i64) -> Result<Vec<Item>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {ITEM_COLUMNS} FROM items WHERE project_id = ?1 ORDER BY position, id"
            ))
            .context("Failed to prepare list_items")?;
        let rows = stmt
            .query_map(params![project_id], item_from_row)
            .context("Failed to query items")?;
        let mut items = Vec::new();
        for row in rows {
            let mut item = row.context("Failed to read item row")?;
            self.load_item_extras(&mut item)?;
            items.push(item);
        }
        Ok(items)
    }

    /// Apply a whole patch, move included, in one transaction and bump the
    /// item version once. The target column is checked before anything is
    /// written, so a rejected patch leaves the row untouched.
    pub fn update_item(&self, id: i64, patch: &ItemPatch) -> Result<Item> {
        let item = self.require_item(id)?;
        if let Some(column_id) = patch.column_id {
            self.require_column_in(column_id, item.project_id)?;
        }

        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        if let Some(n) = &patch.name {
            tx.execute("UPDATE items SET name = ?1 WHERE id = ?2", params![n, id])
                .context("Failed to update item name")?;
        }
        if let Some(d) = &patch.description {
            tx.execute(
                "UPDATE items SET description = ?1 WHERE id = ?2",
                params![d, id],
            )
            .context("Failed to update item description")?;
        }
        if let Some(t) = patch.estimated_time {
            tx.execute(
                "UPDATE items SET estimated_time = ?1 WHERE id = ?2",
                params![t, id],
            )
            .context("Failed to update item estimated_time")?;
        }
        if let Some(t) = patch.actual_time {
            tx.execute(
                "UPDATE items SET actual_time = ?1 WHERE id = ?2",
                params![t, id],
            )
            .context("Failed to update item actual_time")?;
        }
        if let Some(open) = patch.is_open {
            tx.execute(
                "UPDATE items SET is_open = ?1 WHERE id = ?2",
                params![open, id],
            )
            .context("Failed to update item is_open")?;
        }
        if patch.is_move() {
            tx.execute(
                "UPDATE items SET column_id = ?1, position = ?2 WHERE id = ?3",
                params![
                    patch.column_id.unwrap_or(item.column_id),
                    patch.position.unwrap_or(item.position),
                    id
                ],
            )
            .context("Failed to move item")?;
        }
        Self::bump_item_version(&tx, id)?;

        tx.commit().context("Failed to commit item update")?;
        self.require_item(id)
    }

    /// Look up a column that must belong to `project_id`.
    fn require_column_in(&self, column_id: i64, project_id: i64) -> Result<Column> {
        let column = self.require_column(column_id)?;
        if column.project_id != project_id {
            return Err(BoardError::BadRequest(format!(
                "Column {} belongs to a different project",
                column_id
            ))
            .into());
        }
        Ok(column)
    }

    fn bump_item_version(conn: &Connection, id: i64) -> Result<()> {
        let count = conn
            .execute(
                "UPDATE items SET version = version + 1, updated_at = datetime('now') WHERE id = ?1",
                params![id],
            )
            .context("Failed to bump item version")?;
        if count == 0 {
            return Err(BoardError::ItemNotFound { id }.into());
        }
        Ok(())
    }

    /// Reassign an item to a column (of the same project) at a position.
    pub fn move_item(&self, id: i64, column_id: i64, position: i32) -> Result<Item> {
        let item = self.require_item(id)?;
        self.require_column_in(column_id, item.project_id)?;
        self.conn
            .execute(
                "UPDATE items SET column_id = ?1, position = ?2, version = version + 1, updated_at = datetime('now') WHERE id = ?3",
                params![column_id, position, id],
            )
            .context("Failed to move item")?;
        self.require_item(id)
    }

    /// Delete an item, returning the deleted row with its version bumped.
    pub fn delete_item(&self, id: i64) -> Result<Option<Item>> {
        let mut item = match self.get_item(id)? {
            Some(i) => i,
            None => return Ok(None),
        };
        self.conn
            .execute("DELETE FROM items WHERE id = ?1", params![id])
            .context("Failed to delete item")?;
        item.version += 1;
        Ok(Some(item))
    }

    pub fn set_field_value(
        &self,
        item_id: i64,
        field_id: i64,
        value: Option<&serde_json::Value>,
    ) -> Result<Item> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        match value {
            Some(v) => {
                tx.execute(
                    "INSERT INTO field_values (item_id, field_id, value) VALUES (?1, ?2, ?3)
                     ON CONFLICT(item_id, field_id) DO UPDATE SET value = ?3",
                    params![item_id, field_id, v.to_string()],
                )
                .context("Failed to upsert field value")?;
            }
            None => {
                tx.execute(
                    "DELETE FROM field_values WHERE item_id = ?1 AND field_id = ?2",
                    params![item_id, field_id],
                )
                .context("Failed to clear field value")?;
            }
        }
        Self::bump_item_version(&tx, item_id)?;
        tx.commit().context("Failed to commit field value")?;
        self.require_item(item_id)
    }

    pub fn set_assignees(&self, item_id: i64, assignees: &BTreeSet<String>) -> Result<Item> {
        for profile_id in assignees {
            if self.get_profile(profile_id)?.is_none() {
                return Err(BoardError::ProfileNotFound {
                    id: profile_id.clone(),
                }
                .into());
            }
        }
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        tx.execute(
            "DELETE FROM item_assignees WHERE item_id = ?1",
            params![item_id],
        )
        .context("Failed to clear assignees")?;
        for profile_id in assignees {
            tx.execute(
                "INSERT INTO item_assignees (item_id, profile_id) VALUES (?1, ?2)",
                params![item_id, profile_id],
            )
            .context("Failed to insert assignee")?;
        }
        Self::bump_item_version(&tx, item_id)?;
        tx.commit().context("Failed to commit assignees")?;
        self.require_item(item_id)
    }

    // ── Custom fields ─────────────────────────────────────────────────

    pub fn create_field(&self, project_id: i64, new: &NewField) -> Result<CustomField> {
        self.require_project(project_id)?;
        let max_pos: i32 = self
            .conn
            .query_row(
                "SELECT COALESCE(MAX(position), -1) FROM custom_fields WHERE project_id = ?1",
                params![project_id],
                |row| row.get(0),
            )
            .context("Failed to get max field position")?;
        let options = serde_json::to_string(&new.options).context("Failed to encode options")?;
        self.conn
            .execute(
                "INSERT INTO custom_fields (project_id, name, field_type, position, default_value, options)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    project_id,
                    new.name,
                    new.field_type.as_str(),
                    max_pos + 1,
                    new.default_value.as_ref().map(|v| v.to_string()),
                    options
                ],
            )
            .context("Failed to insert custom field")?;
        let id = self.conn.last_insert_rowid();
        self.require_field(id)
    }

    pub fn get_field(&self, id: i64) -> Result<Option<CustomField>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, project_id, name, field_type, position, default_value, options
                 FROM custom_fields WHERE id = ?1",
                params![id],
                |row| {
                    Ok(FieldRow {
                        id: row.get(0)?,
                        project_id: row.get(1)?,
                        name: row.get(2)?,
                        field_type: row.get(3)?,
                        position: row.get(4)?,
                        default_value: row.get(5)?,
                        options: row.get(6)?,
                    })
                },
            )
            .optional()
            .context("Failed to query custom field")?;
        row.map(FieldRow::into_field).transpose()
    }

    pub fn require_field(&self, id: i64) -> Result<CustomField> {
        self.get_field(id)?
            .ok_or_else(|| BoardError::FieldNotFound { id }.into())
    }

    pub fn list_fields(&self, project_id: i64) -> Result<Vec<CustomField>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, project_id, name, field_type, position, default_value, options
                 FROM custom_fields WHERE project_id = ?1 ORDER BY position, id",
            )
            .context("Failed to prepare list_fields")?;
        let rows = stmt
            .query_map(params![project_id], |row| {
                Ok(FieldRow {
                    id: row.get(0)?,
                    project_id: row.get(1)?,
                    name: row.get(2)?,
                    field_type: row.get(3)?,
                    position: row.get(4)?,
                    default_value: row.get(5)?,
                    options: row.get(6)?,
                })
            })
            .context("Failed to query custom fields")?;
        let mut fields = Vec::new();
        for row in rows {
            fields.push(row.context("Failed to read custom field row")?.into_field()?);
        }
        Ok(fields)
    }

    pub fn update_field(
        &self,
        id: i64,
        name: Option<&str>,
        position: Option<i32>,
        default_value: Option<Option<&serde_json::Value>>,
        options: Option<&[String]>,
    ) -> Result<CustomField> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        if let Some(n) = name {
            tx.execute(
                "UPDATE custom_fields SET name = ?1 WHERE id = ?2",
                params![n, id],
            )
            .context("Failed to update field name")?;
        }
        if let Some(p) = position {
            tx.execute(
                "UPDATE custom_fields SET position = ?1 WHERE id = ?2",
                params![p, id],
            )
            .context("Failed to update field position")?;
        }
        if let Some(default_value) = default_value {
            tx.execute(
                "UPDATE custom_fields SET default_value = ?1 WHERE id = ?2",
                params![default_value.map(|v| v.to_string()), id],
            )
            .context("Failed to update field default value")?;
        }
        if let Some(opts) = options {
            let encoded = serde_json::to_string(opts).context("Failed to encode options")?;
            tx.execute(
                "UPDATE custom_fields SET options = ?1 WHERE id = ?2",
                params![encoded, id],
            )
            .context("Failed to update field options")?;
        }
        tx.commit().context("Failed to commit field update")?;
        self.require_field(id)
    }

    pub fn delete_field(&self, id: i64) -> Result<Option<CustomField>> {
        let field = match self.get_field(id)? {
            Some(f) => f,
            None => return Ok(None),
        };
        self.conn
            .execute("DELETE FROM custom_fields WHERE id = ?1", params![id])
            .context("Failed to delete custom field")?;
        Ok(Some(field))
    }

    // ── Comments ──────────────────────────────────────────────────────

    fn load_mentions(&self, comment: &mut Comment) -> Result<()> {
        let mut stmt = self
            .conn
            .prepare("SELECT profile_id FROM comment_mentions WHERE comment_id = ?1")
            .context("Failed to prepare mentions query")?;
        let rows = stmt
            .query_map(params![comment.id], |row| row.get::<_, String>(0))
            .context("Failed to query mentions")?;
        for row in rows {
            comment
                .mentions
                .insert(row.context("Failed to read mention row")?);
        }
        Ok(())
    }

    fn write_mentions(conn: &Connection, comment_id: i64, mentions: &BTreeSet<String>) -> Result<()> {
        conn.execute(
            "DELETE FROM comment_mentions WHERE comment_id = ?1",
            params![comment_id],
        )
        .context("Failed to clear mentions")?;
        for profile_id in mentions {
            conn.execute(
                "INSERT INTO comment_mentions (comment_id, profile_id) VALUES (?1, ?2)",
                params![comment_id, profile_id],
            )
            .with_context(|| format!("Failed to insert mention of '{}'", profile_id))?;
        }
        Ok(())
    }

    pub fn create_comment(
        &self,
        item_id: i64,
        author_id: &str,
        content: &str,
        mentions: &BTreeSet<String>,
    ) -> Result<Comment> {
        self.require_item(item_id)?;
        for profile_id in mentions {
            if self.get_profile(profile_id)?.is_none() {
                return Err(BoardError::ProfileNotFound {
                    id: profile_id.clone(),
                }
                .into());
            }
        }
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        tx.execute(
            "INSERT INTO comments (item_id, author_id, content) VALUES (?1, ?2, ?3)",
            params![item_id, author_id, content],
        )
        .context("Failed to insert comment")?;
        let id = tx.last_insert_rowid();
        Self::write_mentions(&tx, id, mentions)?;
        tx.commit().context("Failed to commit comment")?;
        self.require_comment(id)
    }

    pub fn get_comment(&self, id: i64) -> Result<Option<Comment>> {
        let comment = self
            .conn
            .query_row(
                "SELECT id, item_id, author_id, content, resolved, created_at, updated_at
                 FROM comments WHERE id = ?1",
                params![id],
                comment_from_row,
            )
            .optional()
            .context("Failed to query comment")?;
        match comment {
            Some(mut c) => {
                self.load_mentions(&mut c)?;
                Ok(Some(c))
            }
            None => Ok(None),
        }
    }

    pub fn require_comment(&self, id: i64) -> Result<Comment> {
        self.get_comment(id)?
            .ok_or_else(|| BoardError::CommentNotFound { id }.into())
    }

    pub fn list_comments(&self, item_id: i64) -> Result<Vec<Comment>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, item_id, author_id, content, resolved, created_at, updated_at
                 FROM comments WHERE item_id = ?1 ORDER BY id",
            )
            .context("Failed to prepare list_comments")?;
        let rows = stmt
            .query_map(params![item_id], comment_from_row)
            .context("Failed to query comments")?;
        let mut comments = Vec::new();
        for row in rows {
            let mut c = row.context("Failed to read comment row")?;
            self.load_mentions(&mut c)?;
            comments.push(c);
        }
        Ok(comments)
    }

    pub fn update_comment(
        &self,
        id: i64,
        content: Option<&str>,
        mentions: Option<&BTreeSet<String>>,
        resolved: Option<bool>,
    ) -> Result<Comment> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        if let Some(c) = content {
            tx.execute(
                "UPDATE comments SET content = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![c, id],
            )
            .context("Failed to update comment content")?;
        }
        if let Some(m) = mentions {
            Self::write_mentions(&tx, id, m)?;
        }
        if let Some(r) = resolved {
            tx.execute(
                "UPDATE comments SET resolved = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![r, id],
            )
            .context("Failed to update comment resolved flag")?;
        }
        tx.commit().context("Failed to commit comment update")?;
        self.require_comment(id)
    }

    pub fn delete_comment(&self, id: i64) -> Result<Option<Comment>> {
        let comment = match self.get_comment(id)? {
            Some(c) => c,
            None => return Ok(None),
        };
        self.conn
            .execute("DELETE FROM comments WHERE id = ?1", params![id])
            .context("Failed to delete comment")?;
        Ok(Some(comment))
    }

    // ── Board view ────────────────────────────────────────────────────

    pub fn get_board(&self, project_id: i64) -> Result<BoardSnapshot> {
        let project = self.require_project(project_id)?;
        let columns = self.list_columns(project_id)?;
        let items = self.list_items(project_id)?;
        let fields = self.list_fields(project_id)?;
        Ok(BoardSnapshot {
            project,
            columns,
            items,
            fields,
        })
    }

    pub fn get_item_detail(&self, id: i64) -> Result<Option<ItemDetail>> {
        let item = match self.get_item(id)? {
            Some(i) => i,
            None => return Ok(None),
        };
        let comments = self.list_comments(id)?;
        Ok(Some(ItemDetail { item, comments }))
    }
}
