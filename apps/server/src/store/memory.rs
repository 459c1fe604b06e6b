//! In-memory tenant store.
//!
//! One mutex per tenant serializes every increment-and-compare, so two
//! concurrent sync-up batches for the same tenant can never both believe they
//! hold the latest entity version.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tracing::debug;

use aula_core::sync::{
    ConflictResolution, PushEvent, PushOutcome, PushOutcomeKind, ResolveConflictRequest,
    ResolveConflictResponse, ServerChange, SyncDownRequest, SyncDownResponse, SyncEntity,
    SyncOperation, SyncSummaryResponse, SyncUpRequest, SyncUpResponse, MAX_SYNC_UP_BATCH,
    SYNC_DOWN_PAGE_LIMIT,
};

use super::{StoreError, StoreResult, SyncStore};

type EntityKey = (SyncEntity, String);

/// Server-side record of a rejected event, retained until resolved.
#[derive(Debug, Clone)]
struct LedgerConflict {
    entity: SyncEntity,
    entity_id: String,
    resolution: ConflictResolution,
    /// One-shot grant consumed by the accept-client resubmission.
    override_available: bool,
}

#[derive(Debug, Clone, Default)]
struct ClientRegistry {
    last_sync_up: Option<String>,
    last_sync_down: Option<String>,
    pending_after: i64,
}

#[derive(Default)]
struct TenantState {
    /// The sole conflict arbiter: per-entity version counters, unset == 0.
    versions: HashMap<EntityKey, i64>,
    /// Current record state; create replaces, update merges, delete removes.
    records: HashMap<EntityKey, serde_json::Value>,
    /// Append-only change log in commit order.
    change_log: Vec<ServerChange>,
    /// Idempotence ledger: event id -> version it produced.
    applied_events: HashMap<String, i64>,
    conflicts: HashMap<String, LedgerConflict>,
    clients: HashMap<String, ClientRegistry>,
    next_seq: i64,
    last_commit_at: Option<DateTime<Utc>>,
}

impl TenantState {
    /// Strictly monotonic commit timestamp, bumped on same-instant ties so
    /// `committed_at > watermark` never skips or duplicates a change.
    fn next_commit_timestamp(&mut self) -> DateTime<Utc> {
        let mut now = Utc::now();
        if let Some(last) = self.last_commit_at {
            if now <= last {
                now = last + Duration::milliseconds(1);
            }
        }
        self.last_commit_at = Some(now);
        now
    }

    fn apply_event(&mut self, client_id: &str, event: &PushEvent) -> PushOutcome {
        // Idempotence: a resubmitted event is acknowledged again, untouched.
        if let Some(&version) = self.applied_events.get(&event.event_id) {
            return PushOutcome {
                event_id: event.event_id.clone(),
                outcome: PushOutcomeKind::Applied,
                new_version: Some(version),
                server_version: None,
                server_state: None,
                reason: None,
            };
        }

        if let Some(reason) = validate_event(event) {
            return PushOutcome {
                event_id: event.event_id.clone(),
                outcome: PushOutcomeKind::RejectedInvalid,
                new_version: None,
                server_version: None,
                server_state: None,
                reason: Some(reason),
            };
        }

        let key: EntityKey = (event.entity, event.entity_id.clone());
        let current = self.versions.get(&key).copied().unwrap_or(0);

        let override_granted = event.override_baseline.is_some()
            && self
                .conflicts
                .get(&event.event_id)
                .map(|c| c.override_available)
                .unwrap_or(false);

        if !override_granted && current != event.local_version {
            // Any divergence goes through resolution, never a silent overwrite.
            self.conflicts
                .entry(event.event_id.clone())
                .or_insert(LedgerConflict {
                    entity: event.entity,
                    entity_id: event.entity_id.clone(),
                    resolution: ConflictResolution::Pending,
                    override_available: false,
                });
            return PushOutcome {
                event_id: event.event_id.clone(),
                outcome: PushOutcomeKind::RejectedConflict,
                new_version: None,
                server_version: Some(current),
                server_state: self.records.get(&key).cloned(),
                reason: None,
            };
        }

        if override_granted {
            if let Some(conflict) = self.conflicts.get_mut(&event.event_id) {
                conflict.override_available = false;
            }
            debug!(event_id = %event.event_id, "applying override resubmission");
        }

        let new_version = current + 1;
        match event.op {
            SyncOperation::Create => {
                self.records.insert(key.clone(), event.payload.clone());
            }
            SyncOperation::Update => {
                let record = self
                    .records
                    .entry(key.clone())
                    .or_insert_with(|| serde_json::json!({}));
                if let (Some(target), Some(fields)) =
                    (record.as_object_mut(), event.payload.as_object())
                {
                    for (field, value) in fields {
                        target.insert(field.clone(), value.clone());
                    }
                }
            }
            SyncOperation::Delete => {
                self.records.remove(&key);
            }
        }
        self.versions.insert(key, new_version);

        let seq = self.next_seq + 1;
        self.next_seq = seq;
        let committed_at = self.next_commit_timestamp().to_rfc3339();
        self.change_log.push(ServerChange {
            seq,
            committed_at,
            origin_client_id: client_id.to_string(),
            entity: event.entity,
            entity_id: event.entity_id.clone(),
            op: event.op,
            payload: event.payload.clone(),
            version: new_version,
        });
        self.applied_events
            .insert(event.event_id.clone(), new_version);

        PushOutcome {
            event_id: event.event_id.clone(),
            outcome: PushOutcomeKind::Applied,
            new_version: Some(new_version),
            server_version: None,
            server_state: None,
            reason: None,
        }
    }

    fn open_conflict_count(&self) -> i64 {
        self.conflicts
            .values()
            .filter(|c| c.resolution == ConflictResolution::Pending)
            .count() as i64
    }
}

fn validate_event(event: &PushEvent) -> Option<String> {
    if event.event_id.trim().is_empty() {
        return Some("event id must not be empty".to_string());
    }
    if event.entity_id.trim().is_empty() {
        return Some("entity id must not be empty".to_string());
    }
    if matches!(event.op, SyncOperation::Create | SyncOperation::Update)
        && !event.payload.is_object()
    {
        return Some("create/update payload must be a JSON object".to_string());
    }
    if event.local_version < 0 {
        return Some("local version must not be negative".to_string());
    }
    None
}

#[derive(Default)]
pub struct MemoryStore {
    tenants: Mutex<HashMap<String, Arc<Mutex<TenantState>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn tenant_state(&self, tenant_id: &str) -> Arc<Mutex<TenantState>> {
        let mut tenants = self.tenants.lock().await;
        Arc::clone(
            tenants
                .entry(tenant_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(TenantState::default()))),
        )
    }
}

#[async_trait]
impl SyncStore for MemoryStore {
    async fn sync_up(
        &self,
        tenant_id: &str,
        request: SyncUpRequest,
    ) -> StoreResult<SyncUpResponse> {
        if request.events.len() > MAX_SYNC_UP_BATCH {
            return Err(StoreError::BatchTooLarge {
                len: request.events.len(),
                cap: MAX_SYNC_UP_BATCH,
            });
        }
        // No partial trust: one foreign-tenant event rejects the whole batch
        // before anything is applied.
        for event in &request.events {
            if event.tenant_id != tenant_id {
                return Err(StoreError::TenantMismatch {
                    event_tenant: event.tenant_id.clone(),
                    session_tenant: tenant_id.to_string(),
                });
            }
        }

        let state = self.tenant_state(tenant_id).await;
        let mut state = state.lock().await;

        let results = request
            .events
            .iter()
            .map(|event| state.apply_event(&request.client_id, event))
            .collect();

        let registry = state.clients.entry(request.client_id.clone()).or_default();
        registry.last_sync_up = Some(Utc::now().to_rfc3339());
        registry.pending_after = request.pending_after;

        Ok(SyncUpResponse { results })
    }

    async fn sync_down(
        &self,
        tenant_id: &str,
        request: SyncDownRequest,
    ) -> StoreResult<SyncDownResponse> {
        let watermark = DateTime::parse_from_rfc3339(&request.last_sync_timestamp)
            .map_err(|_| StoreError::InvalidWatermark(request.last_sync_timestamp.clone()))?;

        let state = self.tenant_state(tenant_id).await;
        let mut state = state.lock().await;

        let mut changes: Vec<ServerChange> = Vec::new();
        let mut has_more = false;
        for change in &state.change_log {
            let committed = DateTime::parse_from_rfc3339(&change.committed_at)
                .map_err(|_| StoreError::InvalidWatermark(change.committed_at.clone()))?;
            if committed <= watermark {
                continue;
            }
            if changes.len() == SYNC_DOWN_PAGE_LIMIT {
                has_more = true;
                break;
            }
            changes.push(change.clone());
        }

        let new_watermark = changes
            .last()
            .map(|change| change.committed_at.clone())
            .unwrap_or_else(|| request.last_sync_timestamp.clone());

        let registry = state.clients.entry(request.client_id.clone()).or_default();
        registry.last_sync_down = Some(Utc::now().to_rfc3339());

        Ok(SyncDownResponse {
            changes,
            new_watermark,
            has_more,
        })
    }

    async fn summary(
        &self,
        tenant_id: &str,
        client_id: Option<&str>,
    ) -> StoreResult<SyncSummaryResponse> {
        let state = self.tenant_state(tenant_id).await;
        let state = state.lock().await;

        let conflict_count = state.open_conflict_count();
        let summary = match client_id {
            Some(client_id) => {
                let registry = state.clients.get(client_id).cloned().unwrap_or_default();
                SyncSummaryResponse {
                    pending_count: registry.pending_after,
                    last_sync_up: registry.last_sync_up,
                    last_sync_down: registry.last_sync_down,
                    conflict_count,
                }
            }
            None => SyncSummaryResponse {
                pending_count: state.clients.values().map(|c| c.pending_after).sum(),
                last_sync_up: state
                    .clients
                    .values()
                    .filter_map(|c| c.last_sync_up.clone())
                    .max(),
                last_sync_down: state
                    .clients
                    .values()
                    .filter_map(|c| c.last_sync_down.clone())
                    .max(),
                conflict_count,
            },
        };
        Ok(summary)
    }

    async fn resolve_conflict(
        &self,
        tenant_id: &str,
        request: ResolveConflictRequest,
    ) -> StoreResult<ResolveConflictResponse> {
        let state = self.tenant_state(tenant_id).await;
        let mut state = state.lock().await;

        let Some(conflict) = state.conflicts.get(&request.outbox_event_id).cloned() else {
            return Err(StoreError::UnknownConflict(request.outbox_event_id));
        };
        if conflict.resolution != ConflictResolution::Pending {
            return Err(StoreError::ConflictAlreadyResolved(request.outbox_event_id));
        }

        if request.accept_server_version {
            let entry = state
                .conflicts
                .get_mut(&request.outbox_event_id)
                .expect("conflict just read");
            entry.resolution = ConflictResolution::AcceptServer;
            entry.override_available = false;
            Ok(ResolveConflictResponse {
                outbox_event_id: request.outbox_event_id,
                resolution: ConflictResolution::AcceptServer,
                new_baseline_version: None,
            })
        } else {
            let key: EntityKey = (conflict.entity, conflict.entity_id.clone());
            let baseline = state.versions.get(&key).copied().unwrap_or(0);
            let entry = state
                .conflicts
                .get_mut(&request.outbox_event_id)
                .expect("conflict just read");
            entry.resolution = ConflictResolution::AcceptClient;
            entry.override_available = true;
            Ok(ResolveConflictResponse {
                outbox_event_id: request.outbox_event_id,
                resolution: ConflictResolution::AcceptClient,
                new_baseline_version: Some(baseline),
            })
        }
    }
}
