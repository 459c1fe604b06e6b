//! Repository for the client-side sync tables.

use chrono::{DateTime, Duration, Utc};
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, OnceLock};
use uuid::Uuid;

use aula_core::errors::{DatabaseError, Error, Result};
use aula_core::sync::{
    ConflictRecord, ConflictResolution, EngineStatus, OutboxEvent, OutboxStatus, ServerChange,
    SyncEntity, SyncOperation, SyncSummary, EPOCH_WATERMARK, MAX_SYNC_UP_BATCH,
    TENANT_SYNC_TABLES,
};

use crate::db::{get_connection, DbPool, WriteHandle};
use crate::errors::StorageError;
use crate::schema::{
    conflict_records, outbox_events, sync_engine_state, sync_entity_versions, sync_watermark,
};

use super::model::{
    ConflictRecordDB, OutboxEventDB, SyncEngineStateDB, SyncEntityVersionDB, SyncWatermarkDB,
};

fn enum_to_db<T: serde::Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?.trim_matches('"').to_string())
}

fn enum_from_db<T: serde::de::DeserializeOwned>(value: &str) -> Result<T> {
    Ok(serde_json::from_str(&format!("\"{}\"", value))?)
}

fn validate_sync_table(table: &str) -> Result<()> {
    if TENANT_SYNC_TABLES.contains(&table) {
        return Ok(());
    }
    Err(Error::Database(DatabaseError::Internal(format!(
        "Unsupported sync table '{}'",
        table
    ))))
}

fn escape_sqlite_str(value: &str) -> String {
    value.replace('\'', "''")
}

fn quote_identifier(value: &str) -> String {
    format!("`{}`", value.replace('`', "``"))
}

fn payload_columns_cache() -> &'static Mutex<HashMap<String, HashSet<String>>> {
    static CACHE: OnceLock<Mutex<HashMap<String, HashSet<String>>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

#[derive(diesel::QueryableByName)]
struct PragmaTableInfoRow {
    #[diesel(sql_type = diesel::sql_types::Text)]
    name: String,
}

#[derive(diesel::QueryableByName)]
struct JsonRecordRow {
    #[diesel(sql_type = diesel::sql_types::Text)]
    record: String,
}

#[derive(diesel::QueryableByName)]
struct CountRow {
    #[diesel(sql_type = diesel::sql_types::BigInt)]
    c: i64,
}

fn load_table_columns(conn: &mut SqliteConnection, table_name: &str) -> Result<Vec<String>> {
    let pragma_sql = format!("PRAGMA table_info('{}')", escape_sqlite_str(table_name));
    let columns = diesel::sql_query(pragma_sql)
        .load::<PragmaTableInfoRow>(conn)
        .map_err(StorageError::from)?
        .into_iter()
        .map(|row| row.name)
        .collect::<Vec<_>>();
    Ok(columns)
}

fn validate_payload_columns(
    conn: &mut SqliteConnection,
    table_name: &str,
    fields: &[(String, serde_json::Value)],
) -> Result<()> {
    let known_columns = {
        let cache = payload_columns_cache().lock().map_err(|_| {
            Error::Database(DatabaseError::Internal(
                "Sync payload column cache is poisoned".to_string(),
            ))
        })?;
        cache.get(table_name).cloned()
    };
    let known_columns = if let Some(columns) = known_columns {
        columns
    } else {
        let columns = load_table_columns(conn, table_name)?
            .into_iter()
            .collect::<HashSet<_>>();
        let mut cache = payload_columns_cache().lock().map_err(|_| {
            Error::Database(DatabaseError::Internal(
                "Sync payload column cache is poisoned".to_string(),
            ))
        })?;
        cache.insert(table_name.to_string(), columns.clone());
        columns
    };

    for (column, _) in fields {
        if !known_columns.contains(column) {
            return Err(Error::Database(DatabaseError::Internal(format!(
                "Sync payload column '{}' is not valid for table '{}'",
                column, table_name
            ))));
        }
    }

    Ok(())
}

fn payload_value_matches_entity_id(value: &serde_json::Value, entity_id: &str) -> bool {
    match value {
        serde_json::Value::String(v) => v == entity_id,
        serde_json::Value::Number(v) => v.to_string() == entity_id,
        _ => false,
    }
}

fn json_value_to_sql_literal(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => "NULL".to_string(),
        serde_json::Value::Bool(v) => {
            if *v {
                "1".to_string()
            } else {
                "0".to_string()
            }
        }
        serde_json::Value::Number(v) => v.to_string(),
        serde_json::Value::String(v) => format!("'{}'", escape_sqlite_str(v)),
        serde_json::Value::Array(_) | serde_json::Value::Object(_) => {
            format!(
                "'{}'",
                escape_sqlite_str(&serde_json::to_string(value).unwrap_or_default())
            )
        }
    }
}

/// Local table and primary-key column an entity maps onto.
fn entity_storage_mapping(entity: &SyncEntity) -> (&'static str, &'static str) {
    match entity {
        SyncEntity::Student => ("students", "id"),
        SyncEntity::Guardian => ("guardians", "id"),
        SyncEntity::Enrollment => ("enrollments", "id"),
        SyncEntity::GradeRecord => ("grade_records", "id"),
        SyncEntity::AttendanceRecord => ("attendance_records", "id"),
        SyncEntity::Invoice => ("invoices", "id"),
        SyncEntity::Payment => ("payments", "id"),
        SyncEntity::StaffMember => ("staff_members", "id"),
        SyncEntity::Announcement => ("announcements", "id"),
    }
}

fn timestamp_is_newer(candidate: &str, current: &str) -> bool {
    match (
        DateTime::parse_from_rfc3339(candidate),
        DateTime::parse_from_rfc3339(current),
    ) {
        (Ok(a), Ok(b)) => a > b,
        _ => candidate > current,
    }
}

/// A local mutation queued for the outbox.
#[derive(Debug, Clone)]
pub struct NewOutboxEvent {
    pub event_id: Option<String>,
    pub tenant_id: String,
    pub entity: SyncEntity,
    pub entity_id: String,
    pub op: SyncOperation,
    pub payload: serde_json::Value,
    /// Pre-mutation values of the fields an update touches; enables the
    /// attribute-level merge policy on conflicts.
    pub base_fields: Option<serde_json::Value>,
    pub created_at: String,
}

impl NewOutboxEvent {
    pub fn new(
        tenant_id: impl Into<String>,
        entity: SyncEntity,
        entity_id: impl Into<String>,
        op: SyncOperation,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_id: None,
            tenant_id: tenant_id.into(),
            entity,
            entity_id: entity_id.into(),
            op,
            payload,
            base_fields: None,
            created_at: Utc::now().to_rfc3339(),
        }
    }

    pub fn with_base_fields(mut self, base_fields: serde_json::Value) -> Self {
        self.base_fields = Some(base_fields);
        self
    }
}

fn current_entity_version(
    conn: &mut SqliteConnection,
    entity: &SyncEntity,
    entity_id: &str,
) -> Result<i64> {
    let entity_db = enum_to_db(entity)?;
    let row = sync_entity_versions::table
        .find((entity_db, entity_id))
        .first::<SyncEntityVersionDB>(conn)
        .optional()
        .map_err(StorageError::from)?;
    Ok(row.map(|r| r.server_version).unwrap_or(0))
}

fn upsert_entity_version(
    conn: &mut SqliteConnection,
    entity: &SyncEntity,
    entity_id: &str,
    version: i64,
) -> Result<()> {
    let row = SyncEntityVersionDB {
        entity: enum_to_db(entity)?,
        entity_id: entity_id.to_string(),
        server_version: version,
        updated_at: Utc::now().to_rfc3339(),
    };
    diesel::insert_into(sync_entity_versions::table)
        .values(&row)
        .on_conflict((
            sync_entity_versions::entity,
            sync_entity_versions::entity_id,
        ))
        .do_update()
        .set((
            sync_entity_versions::server_version.eq(row.server_version),
            sync_entity_versions::updated_at.eq(row.updated_at.clone()),
        ))
        .execute(conn)
        .map_err(StorageError::from)?;
    Ok(())
}

/// Append one mutation to the outbox inside the caller's transaction.
///
/// Usable from the same writer job that applies the domain mutation, so the
/// record change and its outbox entry commit or roll back together. The
/// event's baseline is the entity version the client currently believes, and
/// the believed version is bumped so chained local edits carry increasing
/// baselines.
pub fn append_outbox_event(
    conn: &mut SqliteConnection,
    client_id: &str,
    active_tenant: &str,
    request: NewOutboxEvent,
) -> Result<String> {
    if request.tenant_id != active_tenant {
        return Err(Error::authorization(format!(
            "Event tenant '{}' does not match the active session tenant",
            request.tenant_id
        )));
    }
    if request.entity_id.trim().is_empty() {
        return Err(Error::validation("Event entity id must not be empty"));
    }
    if matches!(request.op, SyncOperation::Create | SyncOperation::Update)
        && !request.payload.is_object()
    {
        return Err(Error::validation(
            "Create/update payload must be a JSON object",
        ));
    }

    let event_id = request
        .event_id
        .unwrap_or_else(|| Uuid::now_v7().to_string());
    let local_version = current_entity_version(conn, &request.entity, &request.entity_id)?;

    let row = OutboxEventDB {
        event_id: event_id.clone(),
        client_id: client_id.to_string(),
        tenant_id: request.tenant_id,
        entity: enum_to_db(&request.entity)?,
        entity_id: request.entity_id.clone(),
        op: enum_to_db(&request.op)?,
        payload: serde_json::to_string(&request.payload)?,
        base_fields: request
            .base_fields
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?,
        local_version,
        override_baseline: None,
        status: enum_to_db(&OutboxStatus::Pending)?,
        last_error: None,
        created_at: request.created_at,
    };

    diesel::insert_into(outbox_events::table)
        .values(&row)
        .execute(conn)
        .map_err(StorageError::from)?;

    upsert_entity_version(conn, &request.entity, &request.entity_id, local_version + 1)?;

    Ok(event_id)
}

fn to_outbox_event(row: OutboxEventDB) -> Result<OutboxEvent> {
    Ok(OutboxEvent {
        event_id: row.event_id,
        client_id: row.client_id,
        tenant_id: row.tenant_id,
        entity: enum_from_db(&row.entity)?,
        entity_id: row.entity_id,
        op: enum_from_db(&row.op)?,
        payload: serde_json::from_str(&row.payload)?,
        base_fields: row
            .base_fields
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?,
        local_version: row.local_version,
        override_baseline: row.override_baseline,
        status: enum_from_db(&row.status)?,
        last_error: row.last_error,
        created_at: row.created_at,
    })
}

fn to_conflict_record(row: ConflictRecordDB) -> Result<ConflictRecord> {
    Ok(ConflictRecord {
        outbox_event_id: row.outbox_event_id,
        entity: enum_from_db(&row.entity)?,
        entity_id: row.entity_id,
        server_version: row.server_version,
        server_state: row
            .server_state
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?,
        client_payload: serde_json::from_str(&row.client_payload)?,
        resolution: enum_from_db(&row.resolution)?,
        created_at: row.created_at,
        resolved_at: row.resolved_at,
    })
}

fn transition_status_tx(
    conn: &mut SqliteConnection,
    event_id: &str,
    next: OutboxStatus,
    last_error: Option<String>,
) -> Result<()> {
    let row = outbox_events::table
        .find(event_id)
        .first::<OutboxEventDB>(conn)
        .optional()
        .map_err(StorageError::from)?
        .ok_or_else(|| {
            Error::Database(DatabaseError::Internal(format!(
                "Unknown outbox event '{}'",
                event_id
            )))
        })?;

    let current: OutboxStatus = enum_from_db(&row.status)?;
    if !current.can_transition(next) {
        return Err(Error::InvalidTransition {
            from: row.status,
            to: enum_to_db(&next)?,
        });
    }

    diesel::update(outbox_events::table.find(event_id))
        .set((
            outbox_events::status.eq(enum_to_db(&next)?),
            outbox_events::last_error.eq(last_error),
        ))
        .execute(conn)
        .map_err(StorageError::from)?;
    Ok(())
}

fn delete_domain_row(
    conn: &mut SqliteConnection,
    entity: &SyncEntity,
    entity_id: &str,
) -> Result<()> {
    let (table_name, pk_name) = entity_storage_mapping(entity);
    validate_sync_table(table_name)?;
    let sql = format!(
        "DELETE FROM {} WHERE {} = '{}'",
        quote_identifier(table_name),
        quote_identifier(pk_name),
        escape_sqlite_str(entity_id)
    );
    diesel::sql_query(sql)
        .execute(conn)
        .map_err(StorageError::from)?;
    Ok(())
}

fn upsert_domain_row(
    conn: &mut SqliteConnection,
    entity: &SyncEntity,
    entity_id: &str,
    payload: &serde_json::Value,
) -> Result<()> {
    let (table_name, pk_name) = entity_storage_mapping(entity);
    validate_sync_table(table_name)?;

    let payload_obj = payload.as_object().ok_or_else(|| {
        Error::Database(DatabaseError::Internal(
            "Sync payload must be a JSON object".to_string(),
        ))
    })?;
    if let Some(payload_pk) = payload_obj.get(pk_name) {
        if !payload_value_matches_entity_id(payload_pk, entity_id) {
            return Err(Error::Database(DatabaseError::Internal(format!(
                "Sync payload PK '{}' does not match entity_id '{}'",
                pk_name, entity_id
            ))));
        }
    }

    let mut fields: Vec<(String, serde_json::Value)> = payload_obj
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    if !fields.iter().any(|(k, _)| k == pk_name) {
        fields.push((
            pk_name.to_string(),
            serde_json::Value::String(entity_id.to_string()),
        ));
    }
    validate_payload_columns(conn, table_name, &fields)?;

    let columns = fields
        .iter()
        .map(|(k, _)| quote_identifier(k))
        .collect::<Vec<_>>()
        .join(", ");
    let values = fields
        .iter()
        .map(|(_, v)| json_value_to_sql_literal(v))
        .collect::<Vec<_>>()
        .join(", ");
    let upserts = fields
        .iter()
        .map(|(k, _)| {
            let quoted = quote_identifier(k);
            format!("{quoted}=excluded.{quoted}")
        })
        .collect::<Vec<_>>()
        .join(", ");

    let sql = format!(
        "INSERT INTO {} ({columns}) VALUES ({values}) \
         ON CONFLICT({}) DO UPDATE SET {upserts}",
        quote_identifier(table_name),
        quote_identifier(pk_name)
    );
    diesel::sql_query(sql)
        .execute(conn)
        .map_err(StorageError::from)?;
    Ok(())
}

fn apply_server_change_tx(conn: &mut SqliteConnection, change: &ServerChange) -> Result<()> {
    match change.op {
        SyncOperation::Delete => delete_domain_row(conn, &change.entity, &change.entity_id)?,
        SyncOperation::Create | SyncOperation::Update => {
            upsert_domain_row(conn, &change.entity, &change.entity_id, &change.payload)?
        }
    }
    upsert_entity_version(conn, &change.entity, &change.entity_id, change.version)?;
    Ok(())
}

fn upsert_watermark_tx(
    conn: &mut SqliteConnection,
    client_id: &str,
    tenant_id: &str,
    new_watermark: &str,
) -> Result<()> {
    let current = sync_watermark::table
        .find(1)
        .first::<SyncWatermarkDB>(conn)
        .optional()
        .map_err(StorageError::from)?;

    // The watermark never moves backwards, regardless of what the server says.
    if let Some(ref row) = current {
        if !timestamp_is_newer(new_watermark, &row.last_sync_timestamp) {
            return Ok(());
        }
    }

    let now = Utc::now().to_rfc3339();
    let row = SyncWatermarkDB {
        id: 1,
        client_id: client_id.to_string(),
        tenant_id: tenant_id.to_string(),
        last_sync_timestamp: new_watermark.to_string(),
        updated_at: now.clone(),
    };
    diesel::insert_into(sync_watermark::table)
        .values(&row)
        .on_conflict(sync_watermark::id)
        .do_update()
        .set((
            sync_watermark::last_sync_timestamp.eq(new_watermark.to_string()),
            sync_watermark::updated_at.eq(now),
        ))
        .execute(conn)
        .map_err(StorageError::from)?;
    Ok(())
}

/// Client-side sync state repository, scoped to one session's tenant.
pub struct SyncRepository {
    pool: Arc<DbPool>,
    writer: WriteHandle,
    client_id: String,
    tenant_id: String,
}

impl SyncRepository {
    pub fn new(
        pool: Arc<DbPool>,
        writer: WriteHandle,
        client_id: impl Into<String>,
        tenant_id: impl Into<String>,
    ) -> Self {
        Self {
            pool,
            writer,
            client_id: client_id.into(),
            tenant_id: tenant_id.into(),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    /// Queue a local mutation. Rejects events for a foreign tenant before
    /// anything is written.
    pub async fn append(&self, request: NewOutboxEvent) -> Result<String> {
        let client_id = self.client_id.clone();
        let tenant_id = self.tenant_id.clone();
        self.writer
            .exec(move |conn| append_outbox_event(conn, &client_id, &tenant_id, request))
            .await
    }

    /// Apply a local mutation to its domain table and queue the outbox event
    /// in the same transaction, so the record change and its queue entry
    /// commit or roll back together.
    pub async fn apply_local_mutation(&self, request: NewOutboxEvent) -> Result<String> {
        let client_id = self.client_id.clone();
        let tenant_id = self.tenant_id.clone();
        self.writer
            .exec(move |conn| {
                match request.op {
                    SyncOperation::Delete => {
                        delete_domain_row(conn, &request.entity, &request.entity_id)?
                    }
                    SyncOperation::Create | SyncOperation::Update => upsert_domain_row(
                        conn,
                        &request.entity,
                        &request.entity_id,
                        &request.payload,
                    )?,
                }
                append_outbox_event(conn, &client_id, &tenant_id, request)
            })
            .await
    }

    /// Pending events, oldest first, never skipping any. The limit is clamped
    /// to the sync-up batch cap.
    pub fn list_pending(&self, limit: i64) -> Result<Vec<OutboxEvent>> {
        let mut conn = get_connection(&self.pool)?;
        let limit = limit.clamp(1, MAX_SYNC_UP_BATCH as i64);

        let rows = outbox_events::table
            .filter(outbox_events::status.eq(enum_to_db(&OutboxStatus::Pending)?))
            .order((
                outbox_events::created_at.asc(),
                outbox_events::event_id.asc(),
            ))
            .limit(limit)
            .load::<OutboxEventDB>(&mut conn)
            .map_err(StorageError::from)?;

        rows.into_iter().map(to_outbox_event).collect()
    }

    pub fn get_event(&self, event_id: &str) -> Result<Option<OutboxEvent>> {
        let mut conn = get_connection(&self.pool)?;
        let row = outbox_events::table
            .find(event_id)
            .first::<OutboxEventDB>(&mut conn)
            .optional()
            .map_err(StorageError::from)?;
        row.map(to_outbox_event).transpose()
    }

    /// Atomic status transition; fails with `InvalidTransition` on illegal
    /// moves.
    pub async fn mark_status(&self, event_id: String, status: OutboxStatus) -> Result<()> {
        self.writer
            .exec(move |conn| transition_status_tx(conn, &event_id, status, None))
            .await
    }

    /// Transition a batch of events in one transaction.
    pub async fn mark_statuses(&self, event_ids: Vec<String>, status: OutboxStatus) -> Result<()> {
        if event_ids.is_empty() {
            return Ok(());
        }
        self.writer
            .exec(move |conn| {
                for event_id in &event_ids {
                    transition_status_tx(conn, event_id, status, None)?;
                }
                Ok(())
            })
            .await
    }

    pub async fn mark_failed(&self, event_id: String, reason: String) -> Result<()> {
        self.writer
            .exec(move |conn| {
                transition_status_tx(conn, &event_id, OutboxStatus::Failed, Some(reason))
            })
            .await
    }

    /// Record a server-reported conflict and move the event to `conflicted`
    /// in one transaction.
    pub async fn record_conflict(&self, record: ConflictRecord) -> Result<()> {
        self.writer
            .exec(move |conn| {
                transition_status_tx(
                    conn,
                    &record.outbox_event_id,
                    OutboxStatus::Conflicted,
                    None,
                )?;

                let row = ConflictRecordDB {
                    outbox_event_id: record.outbox_event_id.clone(),
                    entity: enum_to_db(&record.entity)?,
                    entity_id: record.entity_id.clone(),
                    server_version: record.server_version,
                    server_state: record
                        .server_state
                        .as_ref()
                        .map(serde_json::to_string)
                        .transpose()?,
                    client_payload: serde_json::to_string(&record.client_payload)?,
                    resolution: enum_to_db(&ConflictResolution::Pending)?,
                    created_at: record.created_at.clone(),
                    resolved_at: None,
                };
                diesel::insert_into(conflict_records::table)
                    .values(&row)
                    .on_conflict(conflict_records::outbox_event_id)
                    .do_update()
                    .set((
                        conflict_records::server_version.eq(row.server_version),
                        conflict_records::server_state.eq(row.server_state.clone()),
                    ))
                    .execute(conn)
                    .map_err(StorageError::from)?;
                Ok(())
            })
            .await
    }

    pub fn get_conflict(&self, event_id: &str) -> Result<Option<ConflictRecord>> {
        let mut conn = get_connection(&self.pool)?;
        let row = conflict_records::table
            .find(event_id)
            .first::<ConflictRecordDB>(&mut conn)
            .optional()
            .map_err(StorageError::from)?;
        row.map(to_conflict_record).transpose()
    }

    pub fn list_open_conflicts(&self) -> Result<Vec<ConflictRecord>> {
        let mut conn = get_connection(&self.pool)?;
        let rows = conflict_records::table
            .filter(conflict_records::resolution.eq(enum_to_db(&ConflictResolution::Pending)?))
            .order(conflict_records::created_at.asc())
            .load::<ConflictRecordDB>(&mut conn)
            .map_err(StorageError::from)?;
        rows.into_iter().map(to_conflict_record).collect()
    }

    /// Accept the server version: the conflict closes and the local event is
    /// acknowledged without being applied.
    pub async fn resolve_accept_server(&self, event_id: String) -> Result<()> {
        self.writer
            .exec(move |conn| {
                resolve_conflict_tx(conn, &event_id, ConflictResolution::AcceptServer)?;
                transition_status_tx(conn, &event_id, OutboxStatus::Acknowledged, None)?;
                Ok(())
            })
            .await
    }

    /// Accept the client version (or an automatic merge): the event re-enters
    /// the queue with the server's version as its new baseline, flagged as a
    /// one-time override.
    pub async fn resolve_accept_client(
        &self,
        event_id: String,
        baseline_version: i64,
        resolution: ConflictResolution,
    ) -> Result<()> {
        self.writer
            .exec(move |conn| {
                resolve_conflict_tx(conn, &event_id, resolution)?;
                transition_status_tx(conn, &event_id, OutboxStatus::Pending, None)?;
                diesel::update(outbox_events::table.find(&event_id))
                    .set((
                        outbox_events::override_baseline.eq(Some(baseline_version)),
                        outbox_events::local_version.eq(baseline_version),
                    ))
                    .execute(conn)
                    .map_err(StorageError::from)?;
                Ok(())
            })
            .await
    }

    /// Garbage-collect acknowledged events older than the retention window.
    pub async fn purge_acknowledged(&self, older_than_hours: i64) -> Result<usize> {
        self.writer
            .exec(move |conn| {
                let cutoff = (Utc::now() - Duration::hours(older_than_hours)).to_rfc3339();
                let deleted = diesel::delete(
                    outbox_events::table
                        .filter(
                            outbox_events::status.eq(enum_to_db(&OutboxStatus::Acknowledged)?),
                        )
                        .filter(outbox_events::created_at.lt(cutoff)),
                )
                .execute(conn)
                .map_err(StorageError::from)?;
                Ok(deleted)
            })
            .await
    }

    pub fn watermark(&self) -> Result<String> {
        let mut conn = get_connection(&self.pool)?;
        let row = sync_watermark::table
            .find(1)
            .first::<SyncWatermarkDB>(&mut conn)
            .optional()
            .map_err(StorageError::from)?;
        Ok(row
            .map(|r| r.last_sync_timestamp)
            .unwrap_or_else(|| EPOCH_WATERMARK.to_string()))
    }

    /// Apply one sync-down page and advance the watermark, all in a single
    /// transaction: either every change lands and the watermark moves, or
    /// nothing does.
    pub async fn apply_server_changes(
        &self,
        changes: Vec<ServerChange>,
        new_watermark: String,
    ) -> Result<usize> {
        let client_id = self.client_id.clone();
        let tenant_id = self.tenant_id.clone();
        self.writer
            .exec(move |conn| {
                let mut applied = 0usize;
                for change in &changes {
                    apply_server_change_tx(conn, change).map_err(|err| {
                        Error::Database(DatabaseError::Internal(format!(
                            "Apply failed for {:?}/{} seq={}: {}",
                            change.entity, change.entity_id, change.seq, err
                        )))
                    })?;
                    applied += 1;
                }
                upsert_watermark_tx(conn, &client_id, &tenant_id, &new_watermark)?;
                Ok(applied)
            })
            .await
    }

    pub fn entity_version(&self, entity: SyncEntity, entity_id: &str) -> Result<i64> {
        let mut conn = get_connection(&self.pool)?;
        current_entity_version(&mut conn, &entity, entity_id)
    }

    pub async fn set_entity_version(
        &self,
        entity: SyncEntity,
        entity_id: String,
        version: i64,
    ) -> Result<()> {
        self.writer
            .exec(move |conn| upsert_entity_version(conn, &entity, &entity_id, version))
            .await
    }

    /// Read a local record as JSON, or `None` when it does not exist.
    pub fn local_record(
        &self,
        entity: SyncEntity,
        entity_id: &str,
    ) -> Result<Option<serde_json::Value>> {
        let mut conn = get_connection(&self.pool)?;
        let (table_name, pk_name) = entity_storage_mapping(&entity);
        let columns = load_table_columns(&mut conn, table_name)?;
        if columns.is_empty() {
            return Ok(None);
        }

        let pairs = columns
            .iter()
            .map(|column| {
                format!(
                    "'{}', {}",
                    escape_sqlite_str(column),
                    quote_identifier(column)
                )
            })
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT json_object({pairs}) AS record FROM {} WHERE {} = '{}'",
            quote_identifier(table_name),
            quote_identifier(pk_name),
            escape_sqlite_str(entity_id)
        );
        let row = diesel::sql_query(sql)
            .get_result::<JsonRecordRow>(&mut conn)
            .optional()
            .map_err(StorageError::from)?;
        row.map(|r| serde_json::from_str(&r.record).map_err(Error::from))
            .transpose()
    }

    fn count_outbox_with_status(&self, status: OutboxStatus) -> Result<i64> {
        let mut conn = get_connection(&self.pool)?;
        let count = outbox_events::table
            .filter(outbox_events::status.eq(enum_to_db(&status)?))
            .count()
            .get_result::<i64>(&mut conn)
            .map_err(StorageError::from)?;
        Ok(count)
    }

    pub fn pending_count(&self) -> Result<i64> {
        self.count_outbox_with_status(OutboxStatus::Pending)
    }

    pub async fn mark_push_completed(&self) -> Result<()> {
        self.mark_engine_fields(|state| {
            let now = Utc::now().to_rfc3339();
            state.last_push_at = Some(now);
            state.last_error = None;
            state.consecutive_failures = 0;
            state.next_retry_at = None;
        })
        .await
    }

    pub async fn mark_pull_completed(&self) -> Result<()> {
        self.mark_engine_fields(|state| {
            let now = Utc::now().to_rfc3339();
            state.last_pull_at = Some(now);
            state.last_error = None;
            state.consecutive_failures = 0;
            state.next_retry_at = None;
        })
        .await
    }

    pub async fn mark_engine_error(&self, error_message: String) -> Result<()> {
        self.mark_engine_fields(move |state| {
            state.last_error = Some(error_message.clone());
            state.consecutive_failures += 1;
        })
        .await
    }

    pub async fn mark_cycle_outcome(
        &self,
        status_value: String,
        duration_ms_value: i64,
        next_retry_at_value: Option<String>,
    ) -> Result<()> {
        self.mark_engine_fields(move |state| {
            state.last_cycle_status = Some(status_value.clone());
            state.last_cycle_duration_ms = Some(duration_ms_value);
            state.next_retry_at = next_retry_at_value.clone();
        })
        .await
    }

    async fn mark_engine_fields<F>(&self, mutate: F) -> Result<()>
    where
        F: Fn(&mut SyncEngineStateDB) + Send + 'static,
    {
        self.writer
            .exec(move |conn| {
                let mut state = sync_engine_state::table
                    .find(1)
                    .first::<SyncEngineStateDB>(conn)
                    .optional()
                    .map_err(StorageError::from)?
                    .unwrap_or(SyncEngineStateDB {
                        id: 1,
                        last_push_at: None,
                        last_pull_at: None,
                        last_error: None,
                        consecutive_failures: 0,
                        next_retry_at: None,
                        last_cycle_status: None,
                        last_cycle_duration_ms: None,
                    });
                mutate(&mut state);

                diesel::insert_into(sync_engine_state::table)
                    .values(&state)
                    .on_conflict(sync_engine_state::id)
                    .do_update()
                    .set((
                        sync_engine_state::last_push_at.eq(state.last_push_at.clone()),
                        sync_engine_state::last_pull_at.eq(state.last_pull_at.clone()),
                        sync_engine_state::last_error.eq(state.last_error.clone()),
                        sync_engine_state::consecutive_failures.eq(state.consecutive_failures),
                        sync_engine_state::next_retry_at.eq(state.next_retry_at.clone()),
                        sync_engine_state::last_cycle_status.eq(state.last_cycle_status.clone()),
                        sync_engine_state::last_cycle_duration_ms
                            .eq(state.last_cycle_duration_ms),
                    ))
                    .execute(conn)
                    .map_err(StorageError::from)?;
                Ok(())
            })
            .await
    }

    pub fn get_engine_status(&self) -> Result<EngineStatus> {
        let mut conn = get_connection(&self.pool)?;
        let state = sync_engine_state::table
            .find(1)
            .first::<SyncEngineStateDB>(&mut conn)
            .optional()
            .map_err(StorageError::from)?;

        Ok(EngineStatus {
            last_push_at: state.as_ref().and_then(|s| s.last_push_at.clone()),
            last_pull_at: state.as_ref().and_then(|s| s.last_pull_at.clone()),
            last_error: state.as_ref().and_then(|s| s.last_error.clone()),
            consecutive_failures: state.as_ref().map(|s| s.consecutive_failures).unwrap_or(0),
            next_retry_at: state.as_ref().and_then(|s| s.next_retry_at.clone()),
            last_cycle_status: state.as_ref().and_then(|s| s.last_cycle_status.clone()),
            last_cycle_duration_ms: state.and_then(|s| s.last_cycle_duration_ms),
        })
    }

    /// Local synchronization health; reads local tables only.
    pub fn get_summary(&self) -> Result<SyncSummary> {
        let mut conn = get_connection(&self.pool)?;
        let open_conflicts = conflict_records::table
            .filter(conflict_records::resolution.eq(enum_to_db(&ConflictResolution::Pending)?))
            .count()
            .get_result::<i64>(&mut conn)
            .map_err(StorageError::from)?;
        drop(conn);

        let engine = self.get_engine_status()?;
        Ok(SyncSummary {
            pending_count: self.count_outbox_with_status(OutboxStatus::Pending)?,
            conflict_count: open_conflicts,
            failed_count: self.count_outbox_with_status(OutboxStatus::Failed)?,
            last_sync_up: engine.last_push_at,
            last_sync_down: engine.last_pull_at,
        })
    }
}

fn resolve_conflict_tx(
    conn: &mut SqliteConnection,
    event_id: &str,
    resolution: ConflictResolution,
) -> Result<()> {
    let row = conflict_records::table
        .find(event_id)
        .first::<ConflictRecordDB>(conn)
        .optional()
        .map_err(StorageError::from)?
        .ok_or_else(|| {
            Error::Database(DatabaseError::Internal(format!(
                "No conflict record for event '{}'",
                event_id
            )))
        })?;

    let current: ConflictResolution = enum_from_db(&row.resolution)?;
    if !current.can_transition(resolution) {
        return Err(Error::InvalidTransition {
            from: row.resolution,
            to: enum_to_db(&resolution)?,
        });
    }

    diesel::update(conflict_records::table.find(event_id))
        .set((
            conflict_records::resolution.eq(enum_to_db(&resolution)?),
            conflict_records::resolved_at.eq(Some(Utc::now().to_rfc3339())),
        ))
        .execute(conn)
        .map_err(StorageError::from)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    use crate::db::{create_pool, init, run_migrations, spawn_writer};

    const TENANT: &str = "tenant-elmwood";
    const CLIENT: &str = "client-frontdesk";

    fn setup_repo() -> SyncRepository {
        let app_data = tempdir()
            .expect("tempdir")
            .keep()
            .to_string_lossy()
            .to_string();
        let db_path = init(&app_data).expect("init db");
        run_migrations(&db_path).expect("migrate db");
        let pool = create_pool(&db_path).expect("create pool");
        let writer = spawn_writer(pool.as_ref().clone());
        SyncRepository::new(pool, writer, CLIENT, TENANT)
    }

    fn student_event(entity_id: &str) -> NewOutboxEvent {
        NewOutboxEvent::new(
            TENANT,
            SyncEntity::Student,
            entity_id,
            SyncOperation::Create,
            json!({ "id": entity_id, "first_name": "Amara", "last_name": "Okoro" }),
        )
    }

    fn change(seq: i64, committed_at: &str, op: SyncOperation, payload: serde_json::Value) -> ServerChange {
        ServerChange {
            seq,
            committed_at: committed_at.to_string(),
            origin_client_id: "client-registrar".to_string(),
            entity: SyncEntity::Student,
            entity_id: "s1".to_string(),
            op,
            payload,
            version: seq,
        }
    }

    #[tokio::test]
    async fn creates_sync_foundation_tables() {
        let repo = setup_repo();
        let mut conn = get_connection(&repo.pool).expect("conn");
        for table in [
            "outbox_events",
            "sync_watermark",
            "sync_entity_versions",
            "conflict_records",
            "sync_engine_state",
            "students",
            "invoices",
        ] {
            let sql = format!(
                "SELECT COUNT(*) as c FROM sqlite_master WHERE type='table' AND name='{}'",
                table
            );
            let row = diesel::sql_query(sql)
                .get_result::<CountRow>(&mut conn)
                .expect("table exists");
            assert_eq!(row.c, 1, "missing table {table}");
        }
    }

    #[tokio::test]
    async fn append_rejects_foreign_tenant_before_writing() {
        let repo = setup_repo();
        let mut request = student_event("s1");
        request.tenant_id = "tenant-other".to_string();

        let result = repo.append(request).await;
        assert!(matches!(result, Err(Error::Authorization(_))));
        assert_eq!(repo.pending_count().expect("count"), 0);
    }

    #[tokio::test]
    async fn local_mutation_and_outbox_entry_commit_atomically() {
        let repo = setup_repo();
        let mut request = student_event("s1");
        // Foreign tenant fails the append; the domain upsert in the same
        // transaction must roll back with it.
        request.tenant_id = "tenant-other".to_string();

        let result = repo.apply_local_mutation(request).await;
        assert!(matches!(result, Err(Error::Authorization(_))));
        assert!(repo
            .local_record(SyncEntity::Student, "s1")
            .expect("query")
            .is_none());

        let applied = repo
            .apply_local_mutation(student_event("s1"))
            .await
            .expect("apply");
        assert!(!applied.is_empty());
        assert!(repo
            .local_record(SyncEntity::Student, "s1")
            .expect("query")
            .is_some());
        assert_eq!(repo.pending_count().expect("count"), 1);
    }

    #[tokio::test]
    async fn chained_local_edits_carry_increasing_baselines() {
        let repo = setup_repo();
        repo.append(student_event("s1")).await.expect("create");
        repo.append(
            NewOutboxEvent::new(
                TENANT,
                SyncEntity::Student,
                "s1",
                SyncOperation::Update,
                json!({ "last_name": "Okafor" }),
            )
            .with_base_fields(json!({ "last_name": "Okoro" })),
        )
        .await
        .expect("update");

        let pending = repo.list_pending(10).expect("pending");
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].local_version, 0);
        assert_eq!(pending[1].local_version, 1);
        assert_eq!(
            repo.entity_version(SyncEntity::Student, "s1").expect("version"),
            2
        );
    }

    #[tokio::test]
    async fn list_pending_orders_oldest_first() {
        let repo = setup_repo();
        let mut older = student_event("s1");
        older.created_at = "2026-03-01T08:00:00+00:00".to_string();
        let mut newer = NewOutboxEvent::new(
            TENANT,
            SyncEntity::Student,
            "s2",
            SyncOperation::Create,
            json!({ "id": "s2", "first_name": "Bram", "last_name": "de Vries" }),
        );
        newer.created_at = "2026-03-01T09:00:00+00:00".to_string();

        // Insert newest first to prove ordering comes from created_at.
        repo.append(newer).await.expect("append newer");
        repo.append(older).await.expect("append older");

        let pending = repo.list_pending(10).expect("pending");
        assert_eq!(pending[0].entity_id, "s1");
        assert_eq!(pending[1].entity_id, "s2");
    }

    #[tokio::test]
    async fn mark_status_rejects_illegal_transitions() {
        let repo = setup_repo();
        let event_id = repo.append(student_event("s1")).await.expect("append");

        let result = repo
            .mark_status(event_id.clone(), OutboxStatus::Acknowledged)
            .await;
        assert!(matches!(result, Err(Error::InvalidTransition { .. })));

        repo.mark_status(event_id.clone(), OutboxStatus::Sent)
            .await
            .expect("pending -> sent");
        repo.mark_status(event_id.clone(), OutboxStatus::Acknowledged)
            .await
            .expect("sent -> acknowledged");

        let result = repo.mark_status(event_id, OutboxStatus::Pending).await;
        assert!(matches!(result, Err(Error::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn apply_server_changes_upserts_and_advances_watermark() {
        let repo = setup_repo();
        let changes = vec![
            change(
                1,
                "2026-03-01T10:00:00+00:00",
                SyncOperation::Create,
                json!({ "id": "s1", "tenant_id": TENANT, "first_name": "Amara", "last_name": "Okoro", "created_at": "2026-03-01T10:00:00+00:00", "updated_at": "2026-03-01T10:00:00+00:00" }),
            ),
            change(
                2,
                "2026-03-01T10:00:01+00:00",
                SyncOperation::Update,
                json!({ "last_name": "Okafor" }),
            ),
        ];

        let applied = repo
            .apply_server_changes(changes, "2026-03-01T10:00:01+00:00".to_string())
            .await
            .expect("apply");
        assert_eq!(applied, 2);
        assert_eq!(repo.watermark().expect("watermark"), "2026-03-01T10:00:01+00:00");

        let record = repo
            .local_record(SyncEntity::Student, "s1")
            .expect("record")
            .expect("exists");
        assert_eq!(record["last_name"], "Okafor");
        assert_eq!(record["first_name"], "Amara");
        assert_eq!(
            repo.entity_version(SyncEntity::Student, "s1").expect("version"),
            2
        );
    }

    #[tokio::test]
    async fn failed_apply_leaves_watermark_untouched() {
        let repo = setup_repo();
        repo.apply_server_changes(
            vec![change(
                1,
                "2026-03-01T10:00:00+00:00",
                SyncOperation::Create,
                json!({ "id": "s1", "first_name": "Amara", "last_name": "Okoro" }),
            )],
            "2026-03-01T10:00:00+00:00".to_string(),
        )
        .await
        .expect("first batch");

        let bad_batch = vec![change(
            2,
            "2026-03-01T11:00:00+00:00",
            SyncOperation::Update,
            json!({ "no_such_column": true }),
        )];
        let result = repo
            .apply_server_changes(bad_batch, "2026-03-01T11:00:00+00:00".to_string())
            .await;
        assert!(result.is_err());

        // Whole batch rolled back: watermark still at the first batch.
        assert_eq!(repo.watermark().expect("watermark"), "2026-03-01T10:00:00+00:00");
        assert_eq!(
            repo.entity_version(SyncEntity::Student, "s1").expect("version"),
            1
        );
    }

    #[tokio::test]
    async fn delete_changes_remove_local_rows() {
        let repo = setup_repo();
        repo.apply_server_changes(
            vec![change(
                1,
                "2026-03-01T10:00:00+00:00",
                SyncOperation::Create,
                json!({ "id": "s1", "first_name": "Amara", "last_name": "Okoro" }),
            )],
            "2026-03-01T10:00:00+00:00".to_string(),
        )
        .await
        .expect("create");

        repo.apply_server_changes(
            vec![change(2, "2026-03-01T10:01:00+00:00", SyncOperation::Delete, json!({}))],
            "2026-03-01T10:01:00+00:00".to_string(),
        )
        .await
        .expect("delete");

        assert!(repo
            .local_record(SyncEntity::Student, "s1")
            .expect("query")
            .is_none());
    }

    #[tokio::test]
    async fn conflict_resolution_is_terminal() {
        let repo = setup_repo();
        let event_id = repo.append(student_event("s1")).await.expect("append");
        repo.mark_status(event_id.clone(), OutboxStatus::Sent)
            .await
            .expect("sent");

        repo.record_conflict(ConflictRecord {
            outbox_event_id: event_id.clone(),
            entity: SyncEntity::Student,
            entity_id: "s1".to_string(),
            server_version: 3,
            server_state: Some(json!({ "id": "s1", "last_name": "Adeyemi" })),
            client_payload: json!({ "id": "s1", "last_name": "Okoro" }),
            resolution: ConflictResolution::Pending,
            created_at: Utc::now().to_rfc3339(),
            resolved_at: None,
        })
        .await
        .expect("record conflict");

        assert_eq!(repo.list_open_conflicts().expect("open").len(), 1);

        repo.resolve_accept_server(event_id.clone())
            .await
            .expect("accept server");
        let event = repo.get_event(&event_id).expect("get").expect("exists");
        assert_eq!(event.status, OutboxStatus::Acknowledged);
        assert!(repo.list_open_conflicts().expect("open").is_empty());

        let again = repo
            .resolve_accept_client(event_id, 3, ConflictResolution::AcceptClient)
            .await;
        assert!(matches!(again, Err(Error::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn accept_client_requeues_with_override_baseline() {
        let repo = setup_repo();
        let event_id = repo.append(student_event("s1")).await.expect("append");
        repo.mark_status(event_id.clone(), OutboxStatus::Sent)
            .await
            .expect("sent");
        repo.record_conflict(ConflictRecord {
            outbox_event_id: event_id.clone(),
            entity: SyncEntity::Student,
            entity_id: "s1".to_string(),
            server_version: 4,
            server_state: None,
            client_payload: json!({ "id": "s1" }),
            resolution: ConflictResolution::Pending,
            created_at: Utc::now().to_rfc3339(),
            resolved_at: None,
        })
        .await
        .expect("record conflict");

        repo.resolve_accept_client(event_id.clone(), 4, ConflictResolution::AcceptClient)
            .await
            .expect("accept client");

        let event = repo.get_event(&event_id).expect("get").expect("exists");
        assert_eq!(event.status, OutboxStatus::Pending);
        assert_eq!(event.override_baseline, Some(4));
        assert_eq!(event.local_version, 4);
    }

    #[tokio::test]
    async fn purge_removes_only_old_acknowledged_events() {
        let repo = setup_repo();
        let mut old_event = student_event("s1");
        old_event.created_at = "2026-01-01T00:00:00+00:00".to_string();
        let old_id = repo.append(old_event).await.expect("append old");
        repo.mark_status(old_id.clone(), OutboxStatus::Sent)
            .await
            .expect("sent");
        repo.mark_status(old_id, OutboxStatus::Acknowledged)
            .await
            .expect("ack");

        let fresh_id = repo
            .append(NewOutboxEvent::new(
                TENANT,
                SyncEntity::Student,
                "s2",
                SyncOperation::Create,
                json!({ "id": "s2", "first_name": "Bram", "last_name": "de Vries" }),
            ))
            .await
            .expect("append fresh");

        let purged = repo.purge_acknowledged(24).await.expect("purge");
        assert_eq!(purged, 1);
        assert!(repo.get_event(&fresh_id).expect("get").is_some());
    }

    #[tokio::test]
    async fn summary_reflects_queue_and_engine_state() {
        let repo = setup_repo();
        repo.append(student_event("s1")).await.expect("append");
        repo.mark_push_completed().await.expect("push mark");

        let summary = repo.get_summary().expect("summary");
        assert_eq!(summary.pending_count, 1);
        assert_eq!(summary.conflict_count, 0);
        assert_eq!(summary.failed_count, 0);
        assert!(summary.last_sync_up.is_some());
        assert!(summary.last_sync_down.is_none());
    }
}
