//! Sync API endpoints: up, down, summary, resolve-conflict.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    routing::{get, post},
    Extension, Json, Router,
};
use serde::Deserialize;
use tracing::{debug, info};

use aula_core::sync::{
    ResolveConflictRequest, ResolveConflictResponse, SyncDownRequest, SyncDownResponse,
    SyncSummaryResponse, SyncUpRequest, SyncUpResponse,
};

use crate::auth::TenantSession;
use crate::error::ApiResult;
use crate::AppState;

async fn sync_up(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<TenantSession>,
    Json(body): Json<SyncUpRequest>,
) -> ApiResult<Json<SyncUpResponse>> {
    info!(
        tenant = %session.tenant_id,
        client = %body.client_id,
        events = body.events.len(),
        "sync-up batch received"
    );

    let response = state.store.sync_up(&session.tenant_id, body).await?;
    Ok(Json(response))
}

async fn sync_down(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<TenantSession>,
    Json(body): Json<SyncDownRequest>,
) -> ApiResult<Json<SyncDownResponse>> {
    debug!(
        tenant = %session.tenant_id,
        client = %body.client_id,
        watermark = %body.last_sync_timestamp,
        "sync-down requested"
    );

    let response = state.store.sync_down(&session.tenant_id, body).await?;
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SummaryQuery {
    client_id: Option<String>,
}

async fn sync_summary(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<TenantSession>,
    Query(query): Query<SummaryQuery>,
) -> ApiResult<Json<SyncSummaryResponse>> {
    let response = state
        .store
        .summary(&session.tenant_id, query.client_id.as_deref())
        .await?;
    Ok(Json(response))
}

async fn resolve_conflict(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<TenantSession>,
    Json(body): Json<ResolveConflictRequest>,
) -> ApiResult<Json<ResolveConflictResponse>> {
    info!(
        tenant = %session.tenant_id,
        event = %body.outbox_event_id,
        accept_server = body.accept_server_version,
        "conflict resolution requested"
    );

    let response = state
        .store
        .resolve_conflict(&session.tenant_id, body)
        .await?;
    Ok(Json(response))
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/sync/up", post(sync_up))
        .route("/sync/down", post(sync_down))
        .route("/sync/summary", get(sync_summary))
        .route("/sync/resolve-conflict", post(resolve_conflict))
}
