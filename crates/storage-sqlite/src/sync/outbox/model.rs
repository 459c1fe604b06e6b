//! Database models for sync control-plane tables.

use diesel::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(
    Queryable,
    Identifiable,
    Insertable,
    AsChangeset,
    Selectable,
    Debug,
    Clone,
    Serialize,
    Deserialize,
)]
#[diesel(primary_key(event_id))]
#[diesel(table_name = crate::schema::outbox_events)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct OutboxEventDB {
    pub event_id: String,
    pub client_id: String,
    pub tenant_id: String,
    pub entity: String,
    pub entity_id: String,
    pub op: String,
    pub payload: String,
    pub base_fields: Option<String>,
    pub local_version: i64,
    pub override_baseline: Option<i64>,
    pub status: String,
    pub last_error: Option<String>,
    pub created_at: String,
}

#[derive(
    Queryable,
    Identifiable,
    Insertable,
    AsChangeset,
    Selectable,
    Debug,
    Clone,
    Serialize,
    Deserialize,
)]
#[diesel(table_name = crate::schema::sync_watermark)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct SyncWatermarkDB {
    pub id: i32,
    pub client_id: String,
    pub tenant_id: String,
    pub last_sync_timestamp: String,
    pub updated_at: String,
}

#[derive(
    Queryable,
    Identifiable,
    Insertable,
    AsChangeset,
    Selectable,
    Debug,
    Clone,
    Serialize,
    Deserialize,
)]
#[diesel(primary_key(entity, entity_id))]
#[diesel(table_name = crate::schema::sync_entity_versions)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct SyncEntityVersionDB {
    pub entity: String,
    pub entity_id: String,
    pub server_version: i64,
    pub updated_at: String,
}

#[derive(
    Queryable,
    Identifiable,
    Insertable,
    AsChangeset,
    Selectable,
    Debug,
    Clone,
    Serialize,
    Deserialize,
)]
#[diesel(primary_key(outbox_event_id))]
#[diesel(table_name = crate::schema::conflict_records)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct ConflictRecordDB {
    pub outbox_event_id: String,
    pub entity: String,
    pub entity_id: String,
    pub server_version: i64,
    pub server_state: Option<String>,
    pub client_payload: String,
    pub resolution: String,
    pub created_at: String,
    pub resolved_at: Option<String>,
}

#[derive(
    Queryable,
    Identifiable,
    Insertable,
    AsChangeset,
    Selectable,
    Debug,
    Clone,
    Serialize,
    Deserialize,
)]
#[diesel(table_name = crate::schema::sync_engine_state)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct SyncEngineStateDB {
    pub id: i32,
    pub last_push_at: Option<String>,
    pub last_pull_at: Option<String>,
    pub last_error: Option<String>,
    pub consecutive_failures: i32,
    pub next_retry_at: Option<String>,
    pub last_cycle_status: Option<String>,
    pub last_cycle_duration_ms: Option<i64>,
}
