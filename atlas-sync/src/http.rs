//! Request/response transport.
//!
//! ```text
//! GET  /health                   → "ok"
//! GET  /documents[?owner=ID]     → [Document]
//! GET  /documents/{id}           → Document | 404
//! POST /documents                → 201 Document | 400
//! PUT  /documents/{id}           → Document | 400 | 403 | 404
//! GET  /documents/{id}/changes   → [ChangeLogEntry] | 404
//! ```
//!
//! Writes go through the hub so HTTP edits reach WebSocket clients.

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::StoreError;
use crate::hub::SyncHub;
use crate::identity::IdentityProvider;
use crate::model::{ChangeLogEntry, Document};

/// Shared state for HTTP handlers
#[derive(Clone)]
pub struct ApiState {
    pub hub: Arc<SyncHub>,
    pub identity: Arc<dyn IdentityProvider>,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub owner: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateDocumentRequest {
    /// Client-chosen id; generated when absent
    #[serde(default)]
    pub id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub owner_id: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateDocumentRequest {
    pub content: String,
    #[serde(default)]
    pub editor_id: String,
    /// WebSocket client id of the submitter, excluded from the broadcast
    #[serde(default)]
    pub client_id: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

/// Store errors mapped to HTTP responses.
#[derive(Debug)]
pub struct ApiError(pub StoreError);

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ApiError(e)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self.0 {
            StoreError::Validation(_) => StatusCode::BAD_REQUEST,
            StoreError::NotFound(_) => StatusCode::NOT_FOUND,
            StoreError::PermissionDenied { .. } => StatusCode::FORBIDDEN,
            StoreError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
            StoreError::Corrupt(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            log::error!("Request failed: {}", self.0);
        }
        let body = ErrorBody {
            error: self.0.kind(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/documents", get(list_documents).post(create_document))
        .route("/documents/{id}", get(get_document).put(update_document))
        .route("/documents/{id}/changes", get(list_changes))
        .with_state(state)
}

/// Bind `addr` and serve the router until the listener fails.
pub async fn serve(addr: &str, state: ApiState) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    log::info!("HTTP API listening on {}", listener.local_addr()?);
    axum::serve(listener, router(state)).await
}

async fn health() -> &'static str {
    "ok"
}

async fn list_documents(
    State(state): State<ApiState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Document>>, ApiError> {
    let owner = query.owner.as_deref().filter(|o| !o.is_empty());
    Ok(Json(state.hub.list_documents(owner)?))
}

async fn get_document(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<Document>, ApiError> {
    Ok(Json(state.hub.get_document(&id).await?))
}

async fn create_document(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Result<Json<CreateDocumentRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Document>), ApiError> {
    let req = json_body(body)?;
    let owner_id = resolve_user(&state, &headers, req.owner_id);
    let id = req.id.as_deref().filter(|id| !id.is_empty());

    let doc = state
        .hub
        .create_document(id, &req.title, &req.content, &owner_id)
        .await?;
    Ok((StatusCode::CREATED, Json(doc)))
}

async fn update_document(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Result<Json<UpdateDocumentRequest>, JsonRejection>,
) -> Result<Json<Document>, ApiError> {
    let req = json_body(body)?;
    let editor_id = resolve_user(&state, &headers, req.editor_id);
    if editor_id.is_empty() {
        return Err(StoreError::Validation("editor_id is required".into()).into());
    }
    let origin = Some(req.client_id.as_str()).filter(|c| !c.is_empty());

    let doc = state
        .hub
        .apply_edit(&id, &req.content, &editor_id, origin)
        .await?;
    Ok(Json(doc))
}

async fn list_changes(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<ChangeLogEntry>>, ApiError> {
    Ok(Json(state.hub.changes(&id)?))
}

/// Unreadable or incomplete bodies are validation errors like any other.
fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    match body {
        Ok(Json(req)) => Ok(req),
        Err(rejection) => Err(StoreError::Validation(rejection.body_text()).into()),
    }
}

/// Body value wins; the identity header fills it in when empty.
fn resolve_user(state: &ApiState, headers: &HeaderMap, from_body: String) -> String {
    if !from_body.trim().is_empty() {
        return from_body;
    }
    state.identity.current_user(headers).unwrap_or_default()
}
