//! Wire contracts for the sync API.

use serde::{Deserialize, Serialize};

use super::model::{ConflictResolution, OutboxEvent, SyncEntity, SyncOperation};

/// Hard cap on events per sync-up call; larger batches are rejected before
/// any per-event processing.
pub const MAX_SYNC_UP_BATCH: usize = 1000;

/// Tenant scoping header, checked against the session token on every call.
pub const TENANT_HEADER: &str = "x-aula-tenant";

/// Page size for sync-down responses.
pub const SYNC_DOWN_PAGE_LIMIT: usize = 500;

/// One outbox event as transmitted to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushEvent {
    pub event_id: String,
    pub tenant_id: String,
    pub entity: SyncEntity,
    pub entity_id: String,
    pub op: SyncOperation,
    pub local_version: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub override_baseline: Option<i64>,
    pub payload: serde_json::Value,
    pub created_at: String,
}

impl From<OutboxEvent> for PushEvent {
    fn from(event: OutboxEvent) -> Self {
        Self {
            event_id: event.event_id,
            tenant_id: event.tenant_id,
            entity: event.entity,
            entity_id: event.entity_id,
            op: event.op,
            local_version: event.local_version,
            override_baseline: event.override_baseline,
            payload: event.payload,
            created_at: event.created_at,
        }
    }
}

/// `POST /api/v1/sync/up` request body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncUpRequest {
    pub client_id: String,
    /// Events still queued locally after this batch; feeds the server-side
    /// summary so operators can see backlog without reaching the client.
    pub pending_after: i64,
    pub events: Vec<PushEvent>,
}

/// Per-event outcome of a sync-up call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PushOutcomeKind {
    Applied,
    RejectedConflict,
    RejectedInvalid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushOutcome {
    pub event_id: String,
    pub outcome: PushOutcomeKind,
    /// Server version after an applied event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_version: Option<i64>,
    /// Server version at rejection time for conflicts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_version: Option<i64>,
    /// Server's current record state, attached to conflicts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_state: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncUpResponse {
    pub results: Vec<PushOutcome>,
}

/// `POST /api/v1/sync/down` request body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncDownRequest {
    pub client_id: String,
    pub last_sync_timestamp: String,
}

/// One committed server-side mutation replayed to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerChange {
    pub seq: i64,
    pub committed_at: String,
    pub origin_client_id: String,
    pub entity: SyncEntity,
    pub entity_id: String,
    pub op: SyncOperation,
    pub payload: serde_json::Value,
    pub version: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncDownResponse {
    pub changes: Vec<ServerChange>,
    pub new_watermark: String,
    pub has_more: bool,
}

/// `GET /api/v1/sync/summary` response body (server-side view).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSummaryResponse {
    pub pending_count: i64,
    pub last_sync_up: Option<String>,
    pub last_sync_down: Option<String>,
    pub conflict_count: i64,
}

/// `POST /api/v1/sync/resolve-conflict` request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveConflictRequest {
    pub outbox_event_id: String,
    pub accept_server_version: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveConflictResponse {
    pub outbox_event_id: String,
    pub resolution: ConflictResolution,
    /// Current server version, returned when the client version was accepted
    /// so the resubmission carries the right baseline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_baseline_version: Option<i64>,
}

/// Error body returned by the sync API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiErrorBody {
    pub code: String,
    pub message: String,
}
