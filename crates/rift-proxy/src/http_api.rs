//! HTTP admin API
//!
//! REST surface for branch management: create/list/delete, pin/unpin,
//! diff, merge-SQL generation, and TTL garbage collection. Merge SQL is
//! returned for review; nothing here executes it.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use rift_common::RiftError;
use rift_core::merge::format_merge_sql;
use rift_core::Engine;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Shared state for HTTP handlers.
#[derive(Clone)]
pub struct ApiState {
    pub engine: Arc<Engine>,
}

/// Build the admin router.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/branches", get(list_branches).post(create_branch))
        .route("/branches/:name", delete(delete_branch).get(get_branch))
        .route("/branches/:name/pin", post(pin_branch))
        .route("/branches/:name/unpin", post(unpin_branch))
        .route("/branches/:name/diff", get(diff_branch))
        .route("/branches/:name/merge", get(merge_branch))
        .route("/gc", post(run_gc))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct CreateBranchRequest {
    name: String,
    #[serde(default)]
    parent: String,
    #[serde(default)]
    ttl_seconds: Option<i64>,
}

#[derive(Debug, Serialize)]
struct BranchResponse {
    name: String,
    parent: String,
    database: String,
    created_at: String,
    updated_at: String,
    ttl_seconds: Option<i64>,
    pinned: bool,
    delta_size: i64,
    rows_changed: i64,
    status: String,
}

impl From<rift_core::store::Branch> for BranchResponse {
    fn from(b: rift_core::store::Branch) -> Self {
        Self {
            name: b.name,
            parent: b.parent,
            database: b.database,
            created_at: b.created_at.to_rfc3339(),
            updated_at: b.updated_at.to_rfc3339(),
            ttl_seconds: b.ttl_seconds,
            pinned: b.pinned,
            delta_size: b.delta_size,
            rows_changed: b.rows_changed,
            status: b.status,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    code: String,
}

/// RiftError rendered as an HTTP response.
struct ApiError(RiftError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            RiftError::BranchNotFound(_) | RiftError::UnknownTable(_) => StatusCode::NOT_FOUND,
            RiftError::BranchExists(_)
            | RiftError::BranchPinned(_)
            | RiftError::BranchHasChildren(_, _)
            | RiftError::CannotModifyMain => StatusCode::CONFLICT,
            RiftError::InvalidBranchName(_) | RiftError::Parse(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorBody {
            error: self.0.to_string(),
            code: self.0.sqlstate().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<RiftError> for ApiError {
    fn from(err: RiftError) -> Self {
        Self(err)
    }
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn list_branches(State(state): State<ApiState>) -> Result<Response, ApiError> {
    let branches = state.engine.manager().list().await?;
    let out: Vec<BranchResponse> = branches.into_iter().map(Into::into).collect();
    Ok(Json(out).into_response())
}

async fn get_branch(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    let branch = state.engine.manager().get(&name).await?;
    Ok(Json(BranchResponse::from(branch)).into_response())
}

async fn create_branch(
    State(state): State<ApiState>,
    Json(req): Json<CreateBranchRequest>,
) -> Result<Response, ApiError> {
    info!(branch = %req.name, parent = %req.parent, "api: create branch");
    let branch = state
        .engine
        .create_branch(&req.name, &req.parent, req.ttl_seconds)
        .await?;
    Ok((StatusCode::CREATED, Json(BranchResponse::from(branch))).into_response())
}

async fn delete_branch(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    info!(branch = %name, "api: delete branch");
    state.engine.delete_branch(&name).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn pin_branch(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    state.engine.manager().pin(&name).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn unpin_branch(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    state.engine.manager().unpin(&name).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn diff_branch(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    let diff = state.engine.diff(&name).await?;
    Ok(Json(diff).into_response())
}

#[derive(Debug, Serialize)]
struct MergeResponse {
    table: String,
    statements: Vec<String>,
    sql: String,
}

async fn merge_branch(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    let merges = state.engine.generate_merge(&name).await?;
    let out: Vec<MergeResponse> = merges
        .into_iter()
        .map(|m| MergeResponse {
            table: m.table_name.clone(),
            sql: format_merge_sql(&m),
            statements: m.statements,
        })
        .collect();
    Ok(Json(out).into_response())
}

async fn run_gc(State(state): State<ApiState>) -> Result<Response, ApiError> {
    let deleted = state.engine.manager().gc().await?;
    Ok(Json(serde_json::json!({ "deleted": deleted })).into_response())
}
