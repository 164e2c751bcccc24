//! REST routes. Every successful write is followed by a commit broadcast
//! to all hub connections, the requester included.

use std::sync::Arc;

use axum::extract::rejection::{JsonRejection, PathRejection};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, put};
use axum::{Json, Router};
use log::{debug, warn};
use serde::Serialize;
use serde_json::{json, Value};
use taskhub_core::{
    CustomField, CustomFieldInput, Owner, OwnerInput, Task, TaskInput, TaskStore, TaskView,
};
use taskhub_sync::{BroadcastHub, Envelope, MessageKind, CORRELATION_ID_HEADER};
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use crate::error::ApiError;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<TaskStore>,
    pub hub: Arc<BroadcastHub>,
}

impl AppState {
    pub fn new(store: Arc<TaskStore>, hub: Arc<BroadcastHub>) -> Self {
        Self { store, hub }
    }

    /// Fan a committed record out to every connected client.
    async fn publish<T: Serialize>(&self, kind: MessageKind, record: &T, headers: &HeaderMap) {
        let payload = match serde_json::to_value(record) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to serialize {} payload: {}", kind, e);
                return;
            }
        };
        let envelope = Envelope::new(kind, payload).with_correlation_id(correlation_id(headers));
        let delivered = self.hub.broadcast(&envelope, None).await;
        debug!("{} delivered to {} connections", envelope.kind, delivered);
    }
}

/// A malformed header is ignored; the broadcast then goes out untagged.
fn correlation_id(headers: &HeaderMap) -> Option<Uuid> {
    let raw = headers.get(CORRELATION_ID_HEADER)?.to_str().ok()?;
    match Uuid::parse_str(raw.trim()) {
        Ok(id) => Some(id),
        Err(_) => {
            debug!("Ignoring malformed {} header {:?}", CORRELATION_ID_HEADER, raw);
            None
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/tasks", get(list_tasks).post(create_task))
        .route("/api/tasks/{id}", get(get_task).put(update_task))
        .route("/api/tasks/{id}/subtasks", get(subtasks))
        .route("/api/owners", get(list_owners).post(create_owner))
        .route("/api/owners/{id}", put(update_owner))
        .route(
            "/api/custom-fields",
            get(list_custom_fields).post(create_custom_field),
        )
        .route(
            "/api/custom-fields/{id}",
            put(update_custom_field).delete(delete_custom_field),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}

type PathId = Result<Path<i64>, PathRejection>;

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "connections": state.hub.connection_count().await,
    }))
}

// -- tasks --

async fn list_tasks(State(state): State<AppState>) -> Json<Vec<TaskView>> {
    Json(state.store.list_tasks())
}

async fn get_task(State(state): State<AppState>, id: PathId) -> Result<Json<Task>, ApiError> {
    let Path(id) = id?;
    Ok(Json(state.store.get_task(id)?))
}

async fn subtasks(State(state): State<AppState>, id: PathId) -> Result<Json<Vec<Task>>, ApiError> {
    let Path(id) = id?;
    Ok(Json(state.store.subtasks(id)))
}

async fn create_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<TaskInput>, JsonRejection>,
) -> Result<(StatusCode, Json<Task>), ApiError> {
    let Json(input) = body?;
    let task = state.store.create_task(input)?;
    state.publish(MessageKind::TaskCreated, &task, &headers).await;
    Ok((StatusCode::CREATED, Json(task)))
}

async fn update_task(
    State(state): State<AppState>,
    id: PathId,
    headers: HeaderMap,
    body: Result<Json<TaskInput>, JsonRejection>,
) -> Result<Json<Task>, ApiError> {
    let Path(id) = id?;
    let Json(patch) = body?;
    let task = state.store.update_task(id, patch)?;
    state.publish(MessageKind::TaskUpdated, &task, &headers).await;
    Ok(Json(task))
}

// -- owners --

async fn list_owners(State(state): State<AppState>) -> Json<Vec<Owner>> {
    Json(state.store.list_owners())
}

async fn create_owner(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<OwnerInput>, JsonRejection>,
) -> Result<(StatusCode, Json<Owner>), ApiError> {
    let Json(input) = body?;
    let owner = state.store.create_owner(input)?;
    state.publish(MessageKind::OwnerCreated, &owner, &headers).await;
    Ok((StatusCode::CREATED, Json(owner)))
}

async fn update_owner(
    State(state): State<AppState>,
    id: PathId,
    headers: HeaderMap,
    body: Result<Json<OwnerInput>, JsonRejection>,
) -> Result<Json<Owner>, ApiError> {
    let Path(id) = id?;
    let Json(input) = body?;
    let owner = state.store.update_owner(id, input)?;
    state.publish(MessageKind::OwnerUpdated, &owner, &headers).await;
    Ok(Json(owner))
}

// -- custom fields --

async fn list_custom_fields(State(state): State<AppState>) -> Json<Vec<CustomField>> {
    Json(state.store.list_custom_fields())
}

async fn create_custom_field(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<CustomFieldInput>, JsonRejection>,
) -> Result<(StatusCode, Json<CustomField>), ApiError> {
    let Json(input) = body?;
    let field = state.store.create_custom_field(input)?;
    state
        .publish(MessageKind::CustomFieldCreated, &field, &headers)
        .await;
    Ok((StatusCode::CREATED, Json(field)))
}

async fn update_custom_field(
    State(state): State<AppState>,
    id: PathId,
    headers: HeaderMap,
    body: Result<Json<CustomFieldInput>, JsonRejection>,
) -> Result<Json<CustomField>, ApiError> {
    let Path(id) = id?;
    let Json(input) = body?;
    let field = state.store.update_custom_field(id, input)?;
    state
        .publish(MessageKind::CustomFieldUpdated, &field, &headers)
        .await;
    Ok(Json(field))
}

async fn delete_custom_field(
    State(state): State<AppState>,
    id: PathId,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let Path(id) = id?;
    let removed = state.store.delete_custom_field(id)?;
    state
        .publish(MessageKind::CustomFieldDeleted, &json!({ "id": removed.id }), &headers)
        .await;
    Ok(Json(json!({ "message": "Custom field deleted successfully" })))
}
