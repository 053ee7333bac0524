//! HTTP client for the board REST API.
//!
//! Implements [`BoardWriter`] and [`BoardReader`] so a
//! [`BoardSession`](crate::sync::BoardSession) can run against a remote
//! server. Every request carries the caller's identity in the
//! [`ACTOR_HEADER`] header.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::json;

use crate::board::api::{ACTOR_HEADER, CreateItemRequest, MoveItemRequest, SetFieldValueRequest};
use crate::board::models::{BoardSnapshot, Column, Item, ItemPatch, Profile, Project};
use crate::errors::WriteError;
use crate::sync::{BoardReader, BoardWriter};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct BoardClient {
    http: reqwest::Client,
    base_url: String,
    actor_id: String,
}

impl BoardClient {
    pub fn new(base_url: &str, actor_id: impl Into<String>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            actor_id: actor_id.into(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn actor_id(&self) -> &str {
        &self.actor_id
    }

    /// Same server, different identity.
    pub fn as_actor(&self, actor_id: impl Into<String>) -> Self {
        Self {
            http: self.http.clone(),
            base_url: self.base_url.clone(),
            actor_id: actor_id.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api{}", self.base_url, path)
    }

    fn authed(&self, request: RequestBuilder) -> RequestBuilder {
        request.header(ACTOR_HEADER, &self.actor_id)
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, WriteError> {
        let resp = self
            .authed(request)
            .send()
            .await
            .map_err(|e| WriteError::Transport(e.to_string()))?;
        let resp = check_status(resp).await?;
        resp.json::<T>()
            .await
            .map_err(|e| WriteError::Transport(format!("Invalid response body: {}", e)))
    }

    async fn send_empty(&self, request: RequestBuilder) -> Result<(), WriteError> {
        let resp = self
            .authed(request)
            .send()
            .await
            .map_err(|e| WriteError::Transport(e.to_string()))?;
        check_status(resp).await.map(|_| ())
    }

    // ── Setup helpers ─────────────────────────────────────────────────

    /// Register the client's own profile. The first profile on a server
    /// becomes its admin.
    pub async fn register(&self, display_name: &str) -> Result<Profile, WriteError> {
        let body = json!({"id": self.actor_id, "display_name": display_name});
        self.send_json(self.http.post(self.url("/profiles")).json(&body)).await
    }

    pub async fn create_project(&self, name: &str) -> Result<Project, WriteError> {
        self.send_json(self.http.post(self.url("/projects")).json(&json!({"name": name})))
            .await
    }

    /// Create a project only admins can see. Needs an admin actor.
    pub async fn create_admin_only_project(&self, name: &str) -> Result<Project, WriteError> {
        let body = json!({"name": name, "admin_only": true});
        self.send_json(self.http.post(self.url("/projects")).json(&body)).await
    }

    pub async fn list_projects(&self) -> Result<Vec<Project>, WriteError> {
        self.send_json(self.http.get(self.url("/projects"))).await
    }

    pub async fn create_column(&self, project_id: i64, name: &str) -> Result<Column, WriteError> {
        let url = self.url(&format!("/projects/{}/columns", project_id));
        self.send_json(self.http.post(url).json(&json!({"name": name}))).await
    }

    pub async fn delete_column(&self, column_id: i64) -> Result<(), WriteError> {
        self.send_empty(self.http.delete(self.url(&format!("/columns/{}", column_id))))
            .await
    }
}

/// Map an error response onto [`WriteError`]. 404 is `NotFound`, 5xx is
/// treated as transient, every other failure is a rejection.
async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, WriteError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let message = resp
        .json::<serde_json::Value>()
        .await
        .ok()
        .and_then(|body| body.get("error").and_then(|e| e.as_str()).map(str::to_string))
        .unwrap_or_else(|| status.to_string());
    Err(classify(status, message))
}

fn classify(status: StatusCode, message: String) -> WriteError {
    if status == StatusCode::NOT_FOUND {
        WriteError::NotFound(message)
    } else if status.is_server_error() {
        WriteError::Transport(format!("{}: {}", status, message))
    } else {
        WriteError::Rejected {
            status: status.as_u16(),
            message,
        }
    }
}

#[async_trait]
impl BoardWriter for BoardClient {
    async fn create_item(&self, project_id: i64, request: &CreateItemRequest) -> Result<Item, WriteError> {
        let url = self.url(&format!("/projects/{}/items", project_id));
        self.send_json(self.http.post(url).json(request)).await
    }

    async fn update_item(&self, item_id: i64, patch: &ItemPatch) -> Result<Item, WriteError> {
        let url = self.url(&format!("/items/{}", item_id));
        self.send_json(self.http.patch(url).json(patch)).await
    }

    async fn move_item(&self, item_id: i64, column_id: i64, position: i32) -> Result<Item, WriteError> {
        let url = self.url(&format!("/items/{}/move", item_id));
        let body = MoveItemRequest { column_id, position };
        self.send_json(self.http.patch(url).json(&body)).await
    }

    async fn delete_item(&self, item_id: i64) -> Result<(), WriteError> {
        let url = self.url(&format!("/items/{}", item_id));
        self.send_empty(self.http.delete(url)).await
    }

    async fn set_field_value(
        &self,
        item_id: i64,
        field_id: i64,
        value: &serde_json::Value,
    ) -> Result<Item, WriteError> {
        let url = self.url(&format!("/items/{}/fields/{}", item_id, field_id));
        let body = SetFieldValueRequest { value: value.clone() };
        self.send_json(self.http.put(url).json(&body)).await
    }
}

#[async_trait]
impl BoardReader for BoardClient {
    async fn fetch_board(&self, project_id: i64) -> Result<BoardSnapshot, WriteError> {
        let url = self.url(&format!("/projects/{}/board", project_id));
        self.send_json(self.http.get(url)).await
    }
}
