use std::collections::BTreeSet;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{FromRequestParts, Path, State},
    http::{HeaderMap, StatusCode, request::Parts},
    response::{IntoResponse, Response},
    routing::{get, patch, post, put},
};
use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use super::changes::{ChangeBus, ChangeEvent, Operation, Table};
use super::db::{BoardDb, DEFAULT_COLUMNS, DbHandle, NewField, NewItem};
use super::models::*;
use super::policy;
use super::ws::KeepAlive;
use crate::errors::BoardError;

/// Header carrying the caller's profile id.
pub const ACTOR_HEADER: &str = "x-actor-id";

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub changes: ChangeBus,
    /// Channel names currently subscribed on any WebSocket connection.
    pub channels: DashSet<String>,
    pub keepalive: KeepAlive,
}

impl AppState {
    pub fn new(db: DbHandle) -> Self {
        Self {
            db,
            changes: ChangeBus::default(),
            channels: DashSet::new(),
            keepalive: KeepAlive::default(),
        }
    }

    /// Publish a change after a committed write.
    fn publish<T: Serialize>(
        &self,
        table: Table,
        operation: Operation,
        project_id: Option<i64>,
        row: &T,
        actor_id: &str,
    ) {
        let event = ChangeEvent::new(table, operation, project_id, row, Some(actor_id));
        let reached = self.changes.publish(event);
        debug!(table = %table, ?operation, ?project_id, reached, "Published change");
    }
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateProfileRequest {
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub is_admin: bool,
}

#[derive(Deserialize)]
pub struct UpdateProfileRequest {
    pub display_name: String,
}

#[derive(Deserialize)]
pub struct SetAdminRequest {
    pub is_admin: bool,
}

#[derive(Deserialize)]
pub struct CreateProjectRequest {
    pub name: String,
    #[serde(default)]
    pub admin_only: bool,
    pub columns: Option<Vec<String>>,
}

#[derive(Deserialize)]
pub struct UpdateProjectRequest {
    pub name: Option<String>,
    pub admin_only: Option<bool>,
}

#[derive(Deserialize)]
pub struct CreateColumnRequest {
    pub name: String,
}

#[derive(Deserialize)]
pub struct UpdateColumnRequest {
    pub name: Option<String>,
    pub position: Option<i32>,
}

#[derive(Serialize, Deserialize)]
pub struct CreateItemRequest {
    pub column_id: i64,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub estimated_time: Option<f64>,
    pub actual_time: Option<f64>,
}

#[derive(Serialize, Deserialize)]
pub struct MoveItemRequest {
    pub column_id: i64,
    pub position: i32,
}

#[derive(Serialize, Deserialize)]
pub struct SetFieldValueRequest {
    pub value: serde_json::Value,
}

#[derive(Serialize, Deserialize)]
pub struct SetAssigneesRequest {
    pub assignees: BTreeSet<String>,
}

#[derive(Serialize, Deserialize)]
pub struct BulkMoveRequest {
    pub item_ids: Vec<i64>,
    pub column_id: i64,
}

#[derive(Serialize, Deserialize)]
pub struct BulkDeleteRequest {
    pub item_ids: Vec<i64>,
}

#[derive(Deserialize)]
pub struct CreateFieldRequest {
    pub name: String,
    pub field_type: FieldType,
    pub default_value: Option<serde_json::Value>,
    #[serde(default)]
    pub options: Vec<String>,
}

#[derive(Deserialize)]
pub struct UpdateFieldRequest {
    pub name: Option<String>,
    pub position: Option<i32>,
    #[serde(default, deserialize_with = "nullable")]
    pub default_value: Option<Option<serde_json::Value>>,
    pub options: Option<Vec<String>>,
}

#[derive(Deserialize)]
pub struct CreateCommentRequest {
    pub content: String,
    #[serde(default)]
    pub mentions: BTreeSet<String>,
}

#[derive(Deserialize)]
pub struct UpdateCommentRequest {
    pub content: Option<String>,
    pub mentions: Option<BTreeSet<String>>,
    pub resolved: Option<bool>,
}

fn nullable<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::Internal(msg) => {
                error!(error = %msg, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast_ref::<BoardError>() {
            Some(board) if board.is_not_found() => ApiError::NotFound(board.to_string()),
            Some(BoardError::Unauthenticated) => ApiError::Unauthorized(err.to_string()),
            Some(BoardError::PolicyDenied { .. }) => ApiError::Forbidden(err.to_string()),
            Some(BoardError::InvalidFieldValue { .. }) | Some(BoardError::BadRequest(_)) => {
                ApiError::BadRequest(err.to_string())
            }
            _ => ApiError::Internal(format!("{:#}", err)),
        }
    }
}

impl From<BoardError> for ApiError {
    fn from(err: BoardError) -> Self {
        ApiError::from(anyhow::Error::from(err))
    }
}

// ── Actor extraction ──────────────────────────────────────────────────

/// The authenticated caller, resolved from the `x-actor-id` header.
pub struct Actor(pub Profile);

fn actor_id_from(headers: &HeaderMap) -> Option<String> {
    headers
        .get(ACTOR_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

impl FromRequestParts<SharedState> for Actor {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &SharedState) -> Result<Self, Self::Rejection> {
        let id = actor_id_from(&parts.headers).ok_or(BoardError::Unauthenticated)?;
        let profile = state.db.call(move |db| db.get_profile(&id)).await?;
        profile.map(Actor).ok_or_else(|| BoardError::Unauthenticated.into())
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/profiles", get(list_profiles).post(create_profile))
        .route("/api/profiles/{id}", get(get_profile).patch(update_profile))
        .route("/api/profiles/{id}/admin", put(set_profile_admin))
        .route("/api/projects", get(list_projects).post(create_project))
        .route(
            "/api/projects/{id}",
            get(get_project).patch(update_project).delete(delete_project),
        )
        .route("/api/projects/{id}/board", get(get_board))
        .route("/api/projects/{id}/columns", post(create_column))
        .route("/api/projects/{id}/items", post(create_item))
        .route("/api/projects/{id}/items/bulk-move", post(bulk_move_items))
        .route("/api/projects/{id}/items/bulk-delete", post(bulk_delete_items))
        .route("/api/projects/{id}/fields", post(create_field))
        .route("/api/columns/{id}", patch(update_column).delete(delete_column))
        .route(
            "/api/items/{id}",
            get(get_item).patch(update_item).delete(delete_item),
        )
        .route("/api/items/{id}/move", patch(move_item))
        .route("/api/items/{id}/fields/{field_id}", put(set_field_value))
        .route("/api/items/{id}/assignees", put(set_assignees))
        .route(
            "/api/items/{id}/comments",
            get(list_comments).post(create_comment),
        )
        .route("/api/fields/{id}", patch(update_field).delete(delete_field))
        .route(
            "/api/comments/{id}",
            patch(update_comment).delete(delete_comment),
        )
        .route("/health", get(health_check))
}

// ── Helpers (run on the DB thread) ────────────────────────────────────

fn visible_project(db: &BoardDb, actor: &Profile, id: i64) -> anyhow::Result<Project> {
    let project = db.require_project(id)?;
    policy::check_project_access(actor, &project)?;
    Ok(project)
}

fn item_with_project(db: &BoardDb, actor: &Profile, id: i64) -> anyhow::Result<(Project, Item)> {
    let item = db.require_item(id)?;
    let project = visible_project(db, actor, item.project_id)?;
    Ok((project, item))
}

fn profile_exists(db: &BoardDb, id: &str) -> bool {
    matches!(db.get_profile(id), Ok(Some(_)))
}

/// Move one item, enforcing policy. Shared by the single and bulk endpoints.
fn move_one(db: &BoardDb, actor: &Profile, id: i64, column_id: i64, position: i32) -> anyhow::Result<Item> {
    let (project, item) = item_with_project(db, actor, id)?;
    policy::check_item_write(actor, &project, &item, "move")?;
    db.move_item(id, column_id, position)
}

fn delete_one(db: &BoardDb, actor: &Profile, id: i64) -> anyhow::Result<Item> {
    let (project, item) = item_with_project(db, actor, id)?;
    policy::check_item_write(actor, &project, &item, "delete")?;
    db.delete_item(id)?
        .ok_or_else(|| BoardError::ItemNotFound { id }.into())
}

// ── Handlers: health & profiles ───────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn list_profiles(
    State(state): State<SharedState>,
    Actor(_actor): Actor,
) -> Result<impl IntoResponse, ApiError> {
    let profiles = state.db.call(|db| db.list_profiles()).await?;
    Ok(Json(profiles))
}

/// Profile registration. The first profile may be created without an
/// identity and is always an admin; after that, creating an admin needs an
/// admin caller.
async fn create_profile(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(req): Json<CreateProfileRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let caller = actor_id_from(&headers);
    let id = req.id.trim().to_string();
    if id.is_empty() {
        return Err(ApiError::BadRequest("Profile id must not be empty".into()));
    }
    let profile = state
        .db
        .call(move |db| {
            let bootstrap = db.list_profiles()?.is_empty();
            let is_admin = bootstrap || req.is_admin;
            if req.is_admin && !bootstrap {
                let actor = match caller {
                    Some(c) => db.get_profile(&c)?,
                    None => None,
                }
                .ok_or(BoardError::Unauthenticated)?;
                policy::check_admin_flag_change(&actor)?;
            }
            if db.get_profile(&id)?.is_some() {
                return Err(BoardError::BadRequest(format!("Profile '{}' already exists", id)).into());
            }
            db.create_profile(&id, &req.display_name, is_admin)
        })
        .await?;
    state.publish(Table::Profiles, Operation::Insert, None, &profile, &profile.id);
    Ok((StatusCode::CREATED, Json(profile)))
}

async fn get_profile(
    State(state): State<SharedState>,
    Actor(_actor): Actor,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let lookup = id.clone();
    let profile = state.db.call(move |db| db.get_profile(&lookup)).await?;
    profile
        .map(Json)
        .ok_or_else(|| BoardError::ProfileNotFound { id }.into())
}

async fn update_profile(
    State(state): State<SharedState>,
    Actor(actor): Actor,
    Path(id): Path<String>,
    Json(req): Json<UpdateProfileRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let actor_id = actor.id.clone();
    let profile = state
        .db
        .call(move |db| {
            policy::check_profile_rename(&actor, &id)?;
            db.update_profile_name(&id, &req.display_name)
        })
        .await?;
    state.publish(Table::Profiles, Operation::Update, None, &profile, &actor_id);
    Ok(Json(profile))
}

async fn set_profile_admin(
    State(state): State<SharedState>,
    Actor(actor): Actor,
    Path(id): Path<String>,
    Json(req): Json<SetAdminRequest>,
) -> Result<impl IntoResponse, ApiError> {
    policy::check_admin_flag_change(&actor)?;
    let profile = state
        .db
        .call(move |db| db.set_profile_admin(&id, req.is_admin))
        .await?;
    state.publish(Table::Profiles, Operation::Update, None, &profile, &actor.id);
    Ok(Json(profile))
}

// ── Handlers: projects ────────────────────────────────────────────────

async fn list_projects(
    State(state): State<SharedState>,
    Actor(actor): Actor,
) -> Result<impl IntoResponse, ApiError> {
    let projects = state.db.call(|db| db.list_projects()).await?;
    let visible: Vec<Project> = projects
        .into_iter()
        .filter(|p| policy::can_view_project(&actor, p))
        .collect();
    Ok(Json(visible))
}

async fn create_project(
    State(state): State<SharedState>,
    Actor(actor): Actor,
    Json(req): Json<CreateProjectRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.name.trim().is_empty() {
        return Err(ApiError::BadRequest("Project name must not be empty".into()));
    }
    if req.admin_only {
        policy::check_project_admin(&actor, "create an admin-only project")?;
    }
    let columns = req
        .columns
        .unwrap_or_else(|| DEFAULT_COLUMNS.iter().map(|c| c.to_string()).collect());
    let (project, columns) = state
        .db
        .call(move |db| db.create_project(&req.name, req.admin_only, &columns))
        .await?;

    state.publish(Table::Projects, Operation::Insert, Some(project.id), &project, &actor.id);
    for column in &columns {
        state.publish(Table::Columns, Operation::Insert, Some(project.id), column, &actor.id);
    }
    Ok((StatusCode::CREATED, Json(project)))
}

async fn get_project(
    State(state): State<SharedState>,
    Actor(actor): Actor,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let project = state
        .db
        .call(move |db| visible_project(db, &actor, id))
        .await?;
    Ok(Json(project))
}

async fn update_project(
    State(state): State<SharedState>,
    Actor(actor): Actor,
    Path(id): Path<i64>,
    Json(req): Json<UpdateProjectRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let actor_id = actor.id.clone();
    let project = state
        .db
        .call(move |db| {
            visible_project(db, &actor, id)?;
            if req.admin_only.is_some() {
                policy::check_project_admin(&actor, "change project visibility")?;
            }
            db.update_project(id, req.name.as_deref(), req.admin_only)
        })
        .await?;
    state.publish(Table::Projects, Operation::Update, Some(id), &project, &actor_id);
    Ok(Json(project))
}

async fn delete_project(
    State(state): State<SharedState>,
    Actor(actor): Actor,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    policy::check_project_admin(&actor, "delete project")?;
    let project = state
        .db
        .call(move |db| {
            let project = db.require_project(id)?;
            db.delete_project(id)?;
            Ok(project)
        })
        .await?;
    state.publish(Table::Projects, Operation::Delete, Some(id), &project, &actor.id);
    Ok(StatusCode::NO_CONTENT)
}

async fn get_board(
    State(state): State<SharedState>,
    Actor(actor): Actor,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let board = state
        .db
        .call(move |db| {
            visible_project(db, &actor, id)?;
            db.get_board(id)
        })
        .await?;
    Ok(Json(board))
}

// ── Handlers: columns ─────────────────────────────────────────────────

async fn create_column(
    State(state): State<SharedState>,
    Actor(actor): Actor,
    Path(project_id): Path<i64>,
    Json(req): Json<CreateColumnRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let actor_id = actor.id.clone();
    let column = state
        .db
        .call(move |db| {
            visible_project(db, &actor, project_id)?;
            db.create_column(project_id, &req.name)
        })
        .await?;
    state.publish(Table::Columns, Operation::Insert, Some(project_id), &column, &actor_id);
    Ok((StatusCode::CREATED, Json(column)))
}

async fn update_column(
    State(state): State<SharedState>,
    Actor(actor): Actor,
    Path(id): Path<i64>,
    Json(req): Json<UpdateColumnRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let actor_id = actor.id.clone();
    let column = state
        .db
        .call(move |db| {
            let column = db.require_column(id)?;
            visible_project(db, &actor, column.project_id)?;
            db.update_column(id, req.name.as_deref(), req.position)
        })
        .await?;
    state.publish(Table::Columns, Operation::Update, Some(column.project_id), &column, &actor_id);
    Ok(Json(column))
}

/// Deletes the column and, by cascade, its items. Only the column event is
/// published; subscribers drop the column's items themselves.
async fn delete_column(
    State(state): State<SharedState>,
    Actor(actor): Actor,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let actor_id = actor.id.clone();
    let column = state
        .db
        .call(move |db| {
            let column = db.require_column(id)?;
            let project = visible_project(db, &actor, column.project_id)?;
            let closed = db.count_closed_items(id)?;
            policy::check_column_delete(&actor, &project, closed)?;
            db.delete_column(id)?
                .ok_or_else(|| BoardError::ColumnNotFound { id }.into())
        })
        .await?;
    state.publish(Table::Columns, Operation::Delete, Some(column.project_id), &column, &actor_id);
    Ok(StatusCode::NO_CONTENT)
}

// ── Handlers: items ───────────────────────────────────────────────────

async fn create_item(
    State(state): State<SharedState>,
    Actor(actor): Actor,
    Path(project_id): Path<i64>,
    Json(req): Json<CreateItemRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.name.trim().is_empty() {
        return Err(ApiError::BadRequest("Item name must not be empty".into()));
    }
    let actor_id = actor.id.clone();
    let item = state
        .db
        .call(move |db| {
            visible_project(db, &actor, project_id)?;
            let column = db.require_column(req.column_id)?;
            if column.project_id != project_id {
                return Err(BoardError::BadRequest(format!(
                    "Column {} does not belong to project {}",
                    column.id, project_id
                ))
                .into());
            }
            db.create_item(&NewItem {
                column_id: req.column_id,
                name: req.name,
                description: req.description,
                estimated_time: req.estimated_time,
                actual_time: req.actual_time,
            })
        })
        .await?;
    state.publish(Table::Items, Operation::Insert, Some(project_id), &item, &actor_id);
    Ok((StatusCode::CREATED, Json(item)))
}

async fn get_item(
    State(state): State<SharedState>,
    Actor(actor): Actor,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let detail = state
        .db
        .call(move |db| {
            item_with_project(db, &actor, id)?;
            db.get_item_detail(id)?
                .ok_or_else(|| BoardError::ItemNotFound { id }.into())
        })
        .await?;
    Ok(Json(detail))
}

/// Partial update. A patch carrying `column_id`/`position` is also a move.
async fn update_item(
    State(state): State<SharedState>,
    Actor(actor): Actor,
    Path(id): Path<i64>,
    Json(patch): Json<ItemPatch>,
) -> Result<impl IntoResponse, ApiError> {
    if patch.is_empty() {
        return Err(ApiError::BadRequest("Empty item patch".into()));
    }
    let actor_id = actor.id.clone();
    let item = state
        .db
        .call(move |db| {
            let (project, item) = item_with_project(db, &actor, id)?;
            policy::check_item_patch(&actor, &project, &item, &patch)?;
            db.update_item(id, &patch)
        })
        .await?;
    state.publish(Table::Items, Operation::Update, Some(item.project_id), &item, &actor_id);
    Ok(Json(item))
}

async fn move_item(
    State(state): State<SharedState>,
    Actor(actor): Actor,
    Path(id): Path<i64>,
    Json(req): Json<MoveItemRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let actor_id = actor.id.clone();
    let item = state
        .db
        .call(move |db| move_one(db, &actor, id, req.column_id, req.position))
        .await?;
    state.publish(Table::Items, Operation::Update, Some(item.project_id), &item, &actor_id);
    Ok(Json(item))
}

async fn delete_item(
    State(state): State<SharedState>,
    Actor(actor): Actor,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let actor_id = actor.id.clone();
    let item = state
        .db
        .call(move |db| delete_one(db, &actor, id))
        .await?;
    state.publish(Table::Items, Operation::Delete, Some(item.project_id), &item, &actor_id);
    Ok(StatusCode::NO_CONTENT)
}

async fn set_field_value(
    State(state): State<SharedState>,
    Actor(actor): Actor,
    Path((id, field_id)): Path<(i64, i64)>,
    Json(req): Json<SetFieldValueRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let actor_id = actor.id.clone();
    let item = state
        .db
        .call(move |db| {
            let (project, item) = item_with_project(db, &actor, id)?;
            policy::check_item_write(&actor, &project, &item, "update")?;
            let field = db.require_field(field_id)?;
            if field.project_id != project.id {
                return Err(BoardError::BadRequest(format!(
                    "Field {} does not belong to project {}",
                    field_id, project.id
                ))
                .into());
            }
            policy::validate_field_value(&field, &req.value, |p| profile_exists(db, p))?;
            let value = (!req.value.is_null()).then_some(&req.value);
            db.set_field_value(id, field_id, value)
        })
        .await?;
    state.publish(Table::Items, Operation::Update, Some(item.project_id), &item, &actor_id);
    Ok(Json(item))
}

async fn set_assignees(
    State(state): State<SharedState>,
    Actor(actor): Actor,
    Path(id): Path<i64>,
    Json(req): Json<SetAssigneesRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let actor_id = actor.id.clone();
    let item = state
        .db
        .call(move |db| {
            let (project, item) = item_with_project(db, &actor, id)?;
            policy::check_item_write(&actor, &project, &item, "assign")?;
            db.set_assignees(id, &req.assignees)
        })
        .await?;
    state.publish(Table::Items, Operation::Update, Some(item.project_id), &item, &actor_id);
    Ok(Json(item))
}

/// Moves items one at a time, in request order. Earlier successes are never
/// undone; once an item fails the rest are left where they are and reported
/// as skipped. The response lists one outcome per requested id.
async fn bulk_move_items(
    State(state): State<SharedState>,
    Actor(actor): Actor,
    Path(project_id): Path<i64>,
    Json(req): Json<BulkMoveRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let mut outcomes = Vec::with_capacity(req.item_ids.len());
    for item_id in req.item_ids {
        if outcomes.iter().any(|o: &ItemOutcome| !o.ok) {
            outcomes.push(ItemOutcome::skipped(item_id));
            continue;
        }
        let mover = actor.clone();
        let column_id = req.column_id;
        let result = state
            .db
            .call(move |db| {
                let item = db.require_item(item_id)?;
                if item.project_id != project_id {
                    return Err(BoardError::BadRequest(format!(
                        "Item {} does not belong to project {}",
                        item_id, project_id
                    ))
                    .into());
                }
                move_one(db, &mover, item_id, column_id, item.position)
            })
            .await;
        match result {
            Ok(item) => {
                state.publish(Table::Items, Operation::Update, Some(project_id), &item, &actor.id);
                outcomes.push(ItemOutcome::written(item));
            }
            Err(e) => outcomes.push(ItemOutcome::failure(item_id, e.to_string())),
        }
    }
    Ok(Json(outcomes))
}

async fn bulk_delete_items(
    State(state): State<SharedState>,
    Actor(actor): Actor,
    Path(project_id): Path<i64>,
    Json(req): Json<BulkDeleteRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let mut outcomes = Vec::with_capacity(req.item_ids.len());
    for item_id in req.item_ids {
        if outcomes.iter().any(|o: &ItemOutcome| !o.ok) {
            outcomes.push(ItemOutcome::skipped(item_id));
            continue;
        }
        let deleter = actor.clone();
        let result = state
            .db
            .call(move |db| {
                let item = db.require_item(item_id)?;
                if item.project_id != project_id {
                    return Err(BoardError::BadRequest(format!(
                        "Item {} does not belong to project {}",
                        item_id, project_id
                    ))
                    .into());
                }
                delete_one(db, &deleter, item_id)
            })
            .await;
        match result {
            Ok(item) => {
                state.publish(Table::Items, Operation::Delete, Some(project_id), &item, &actor.id);
                outcomes.push(ItemOutcome::success(item_id));
            }
            Err(e) => outcomes.push(ItemOutcome::failure(item_id, e.to_string())),
        }
    }
    Ok(Json(outcomes))
}

// ── Handlers: custom fields ───────────────────────────────────────────

async fn create_field(
    State(state): State<SharedState>,
    Actor(actor): Actor,
    Path(project_id): Path<i64>,
    Json(req): Json<CreateFieldRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let actor_id = actor.id.clone();
    let field = state
        .db
        .call(move |db| {
            visible_project(db, &actor, project_id)?;
            let new = NewField {
                name: req.name,
                field_type: req.field_type,
                default_value: req.default_value.filter(|v| !v.is_null()),
                options: req.options,
            };
            if let Some(default) = &new.default_value {
                let candidate = CustomField {
                    id: 0,
                    project_id,
                    name: new.name.clone(),
                    field_type: new.field_type,
                    position: 0,
                    default_value: None,
                    options: new.options.clone(),
                };
                policy::validate_field_value(&candidate, default, |p| profile_exists(db, p))?;
            }
            db.create_field(project_id, &new)
        })
        .await?;
    state.publish(Table::CustomFields, Operation::Insert, Some(project_id), &field, &actor_id);
    Ok((StatusCode::CREATED, Json(field)))
}

async fn update_field(
    State(state): State<SharedState>,
    Actor(actor): Actor,
    Path(id): Path<i64>,
    Json(req): Json<UpdateFieldRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let actor_id = actor.id.clone();
    let field = state
        .db
        .call(move |db| {
            let mut field = db.require_field(id)?;
            visible_project(db, &actor, field.project_id)?;
            if let Some(options) = &req.options {
                field.options = options.clone();
            }
            if let Some(Some(default)) = &req.default_value {
                policy::validate_field_value(&field, default, |p| profile_exists(db, p))?;
            }
            let default_value = req
                .default_value
                .as_ref()
                .map(|v| v.as_ref().filter(|v| !v.is_null()));
            db.update_field(
                id,
                req.name.as_deref(),
                req.position,
                default_value,
                req.options.as_deref(),
            )
        })
        .await?;
    state.publish(Table::CustomFields, Operation::Update, Some(field.project_id), &field, &actor_id);
    Ok(Json(field))
}

async fn delete_field(
    State(state): State<SharedState>,
    Actor(actor): Actor,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let actor_id = actor.id.clone();
    let field = state
        .db
        .call(move |db| {
            let field = db.require_field(id)?;
            visible_project(db, &actor, field.project_id)?;
            db.delete_field(id)?
                .ok_or_else(|| BoardError::FieldNotFound { id }.into())
        })
        .await?;
    state.publish(Table::CustomFields, Operation::Delete, Some(field.project_id), &field, &actor_id);
    Ok(StatusCode::NO_CONTENT)
}

// ── Handlers: comments ────────────────────────────────────────────────

async fn list_comments(
    State(state): State<SharedState>,
    Actor(actor): Actor,
    Path(item_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let comments = state
        .db
        .call(move |db| {
            item_with_project(db, &actor, item_id)?;
            db.list_comments(item_id)
        })
        .await?;
    Ok(Json(comments))
}

async fn create_comment(
    State(state): State<SharedState>,
    Actor(actor): Actor,
    Path(item_id): Path<i64>,
    Json(req): Json<CreateCommentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.content.trim().is_empty() {
        return Err(ApiError::BadRequest("Comment must not be empty".into()));
    }
    let actor_id = actor.id.clone();
    let (project_id, comment) = state
        .db
        .call(move |db| {
            let (project, _item) = item_with_project(db, &actor, item_id)?;
            let comment = db.create_comment(item_id, &actor.id, &req.content, &req.mentions)?;
            Ok((project.id, comment))
        })
        .await?;
    state.publish(Table::Comments, Operation::Insert, Some(project_id), &comment, &actor_id);
    Ok((StatusCode::CREATED, Json(comment)))
}

async fn update_comment(
    State(state): State<SharedState>,
    Actor(actor): Actor,
    Path(id): Path<i64>,
    Json(req): Json<UpdateCommentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let actor_id = actor.id.clone();
    let (project_id, comment) = state
        .db
        .call(move |db| {
            let comment = db.require_comment(id)?;
            let (project, _item) = item_with_project(db, &actor, comment.item_id)?;
            if req.content.is_some() || req.mentions.is_some() {
                policy::check_comment_edit(&actor, &comment)?;
            }
            let updated = db.update_comment(
                id,
                req.content.as_deref(),
                req.mentions.as_ref(),
                req.resolved,
            )?;
            Ok((project.id, updated))
        })
        .await?;
    state.publish(Table::Comments, Operation::Update, Some(project_id), &comment, &actor_id);
    Ok(Json(comment))
}

async fn delete_comment(
    State(state): State<SharedState>,
    Actor(actor): Actor,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let actor_id = actor.id.clone();
    let (project_id, comment) = state
        .db
        .call(move |db| {
            let comment = db.require_comment(id)?;
            let (project, _item) = item_with_project(db, &actor, comment.item_id)?;
            policy::check_comment_delete(&actor, &comment)?;
            db.delete_comment(id)?;
            Ok((project.id, comment))
        })
        .await?;
    state.publish(Table::Comments, Operation::Delete, Some(project_id), &comment, &actor_id);
    Ok(StatusCode::NO_CONTENT)
}

// ── Tests ─────────────────────────────────────────────────────────────
