//! HTTP handlers, one per API operation.
//!
//! Storage calls are blocking, so every one of them runs on tokio's blocking
//! pool through [`AppState::with_db`].

use std::sync::Arc;

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    Json,
};
use serde_json::{json, Map, Value};

use crate::db::Database;
use crate::error::{ApiError, StoreError, StoreResult};
use crate::models::{Health, Pagination, Stats, Todo, TodoPage};
use crate::validation::{self, ListParams};

pub type HandlerResult<T> = Result<Json<T>, ApiError>;

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
}

impl AppState {
    pub fn new(db: Database) -> Self {
        Self { db: Arc::new(db) }
    }

    /// Runs `f` against the database without holding up a runtime worker.
    pub async fn with_db<F, T>(&self, f: F) -> Result<T, ApiError>
    where
        F: FnOnce(&Database) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = Arc::clone(&self.db);
        let result = tokio::task::spawn_blocking(move || f(&db)).await?;
        Ok(result?)
    }
}

/// GET /health
pub async fn health() -> Json<Health> {
    Json(Health::ok())
}

/// GET /api/todos
pub async fn list_todos(
    State(state): State<AppState>,
    params: Result<Query<ListParams>, QueryRejection>,
) -> HandlerResult<TodoPage> {
    let Query(params) = params.map_err(|rejection| ApiError::BadRequest(rejection.body_text()))?;
    let query = validation::list_query(&params)?;
    let page = state
        .with_db(move |db| db.find_page(query.filter, query.limit, query.offset()))
        .await?;

    Ok(Json(TodoPage {
        pagination: Pagination::new(&query, page.total),
        todos: page.todos,
    }))
}

/// GET /api/todos/stats
pub async fn todo_stats(State(state): State<AppState>) -> HandlerResult<Stats> {
    Ok(Json(state.with_db(Database::stats).await?))
}

/// GET /api/todos/:id
pub async fn get_todo(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
) -> HandlerResult<Todo> {
    let id = validation::id(&raw_id)?;
    let todo = state
        .with_db(move |db| db.find_by_id(id)?.ok_or(StoreError::NotFound))
        .await?;
    Ok(Json(todo))
}

/// POST /api/todos
pub async fn create_todo(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<(StatusCode, Json<Todo>), ApiError> {
    let body = body(payload)?;
    let new = validation::create(&body)?;
    let todo = state.with_db(move |db| db.create(new)).await?;
    Ok((StatusCode::CREATED, Json(todo)))
}

/// PUT /api/todos/:id
pub async fn update_todo(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
    payload: Result<Json<Value>, JsonRejection>,
) -> HandlerResult<Todo> {
    let body = body(payload)?;
    let (id, changes) = validation::both(validation::id(&raw_id), validation::update(&body))?;
    Ok(Json(state.with_db(move |db| db.update(id, changes)).await?))
}

/// PATCH /api/todos/:id/toggle
pub async fn toggle_todo(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
) -> HandlerResult<Todo> {
    let id = validation::id(&raw_id)?;
    Ok(Json(state.with_db(move |db| db.toggle(id)).await?))
}

/// DELETE /api/todos/:id
pub async fn delete_todo(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = validation::id(&raw_id)?;
    state.with_db(move |db| db.delete(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn not_found() -> (StatusCode, Json<Value>) {
    (StatusCode::NOT_FOUND, Json(json!({ "error": "Route not found" })))
}

// A request without a JSON content type carries no fields at all.
fn body(payload: Result<Json<Value>, JsonRejection>) -> Result<Value, ApiError> {
    match payload {
        Ok(Json(value)) => Ok(value),
        Err(JsonRejection::MissingJsonContentType(_)) => Ok(Value::Object(Map::new())),
        Err(rejection) => Err(ApiError::BadRequest(rejection.body_text())),
    }
}
