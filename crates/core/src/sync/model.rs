//! Tenant sync domain models.

use serde::{Deserialize, Serialize};

/// Canonical list of local tables that participate in tenant sync.
pub const TENANT_SYNC_TABLES: [&str; 9] = [
    "students",
    "guardians",
    "enrollments",
    "grade_records",
    "attendance_records",
    "invoices",
    "payments",
    "staff_members",
    "announcements",
];

/// Entity names used by sync events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncEntity {
    Student,
    Guardian,
    Enrollment,
    GradeRecord,
    AttendanceRecord,
    Invoice,
    Payment,
    StaffMember,
    Announcement,
}

/// Supported sync operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOperation {
    Create,
    Update,
    Delete,
}

/// Local outbox lifecycle status.
///
/// Events are immutable once created; only the status column moves, and only
/// along the transitions admitted by [`OutboxStatus::can_transition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    Sent,
    Acknowledged,
    Conflicted,
    Failed,
}

impl OutboxStatus {
    /// Terminal statuses never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Acknowledged | Self::Failed)
    }

    /// Whether `self -> next` is a legal status move.
    ///
    /// `Sent -> Pending` covers the network-failure retry path;
    /// `Conflicted -> Pending` covers an accept-client resubmission;
    /// `Conflicted -> Acknowledged` covers accept-server discards.
    pub fn can_transition(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Sent)
                | (Self::Sent, Self::Pending)
                | (Self::Sent, Self::Acknowledged)
                | (Self::Sent, Self::Conflicted)
                | (Self::Sent, Self::Failed)
                | (Self::Conflicted, Self::Pending)
                | (Self::Conflicted, Self::Acknowledged)
        )
    }
}

/// A queued local mutation awaiting server confirmation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxEvent {
    pub event_id: String,
    pub client_id: String,
    pub tenant_id: String,
    pub entity: SyncEntity,
    pub entity_id: String,
    pub op: SyncOperation,
    pub payload: serde_json::Value,
    /// Pre-mutation values of the fields an update touched; feeds the
    /// attribute-level merge policy.
    pub base_fields: Option<serde_json::Value>,
    /// Per-entity server version the client believed current at mutation time.
    pub local_version: i64,
    /// Set when a conflict resolution re-submits this event against a new
    /// server baseline, bypassing the version check exactly once.
    pub override_baseline: Option<i64>,
    pub status: OutboxStatus,
    pub last_error: Option<String>,
    pub created_at: String,
}

/// Watermark value for a client that has never completed a sync-down.
pub const EPOCH_WATERMARK: &str = "1970-01-01T00:00:00+00:00";

/// Resolution state of a conflicted event. `Pending` is the only
/// non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    Pending,
    AcceptServer,
    AcceptClient,
    Merged,
}

impl ConflictResolution {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }

    pub fn can_transition(self, next: Self) -> bool {
        self == Self::Pending && next != Self::Pending
    }
}

/// Divergent entity versions retained until an operator or the merge policy
/// resolves them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    pub outbox_event_id: String,
    pub entity: SyncEntity,
    pub entity_id: String,
    pub server_version: i64,
    pub server_state: Option<serde_json::Value>,
    pub client_payload: serde_json::Value,
    pub resolution: ConflictResolution,
    pub created_at: String,
    pub resolved_at: Option<String>,
}

/// Local synchronization health, assembled from local reads only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSummary {
    pub pending_count: i64,
    pub conflict_count: i64,
    pub failed_count: i64,
    pub last_sync_up: Option<String>,
    pub last_sync_down: Option<String>,
}

/// Engine bookkeeping persisted between cycles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatus {
    pub last_push_at: Option<String>,
    pub last_pull_at: Option<String>,
    pub last_error: Option<String>,
    pub consecutive_failures: i32,
    pub next_retry_at: Option<String>,
    pub last_cycle_status: Option<String>,
    pub last_cycle_duration_ms: Option<i64>,
}

/// Trigger source for sync cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncCycleTrigger {
    Startup,
    LocalMutation,
    Periodic,
    Manual,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses_never_leave() {
        for next in [
            OutboxStatus::Pending,
            OutboxStatus::Sent,
            OutboxStatus::Conflicted,
            OutboxStatus::Failed,
        ] {
            assert!(!OutboxStatus::Acknowledged.can_transition(next));
            assert!(!OutboxStatus::Failed.can_transition(next));
        }
    }

    #[test]
    fn retry_and_resolution_transitions_are_legal() {
        assert!(OutboxStatus::Pending.can_transition(OutboxStatus::Sent));
        assert!(OutboxStatus::Sent.can_transition(OutboxStatus::Pending));
        assert!(OutboxStatus::Conflicted.can_transition(OutboxStatus::Pending));
        assert!(OutboxStatus::Conflicted.can_transition(OutboxStatus::Acknowledged));
        assert!(!OutboxStatus::Pending.can_transition(OutboxStatus::Acknowledged));
        assert!(!OutboxStatus::Conflicted.can_transition(OutboxStatus::Failed));
    }

    #[test]
    fn conflict_resolution_is_single_shot() {
        assert!(ConflictResolution::Pending.can_transition(ConflictResolution::Merged));
        assert!(ConflictResolution::Pending.can_transition(ConflictResolution::AcceptServer));
        assert!(!ConflictResolution::Merged.can_transition(ConflictResolution::AcceptServer));
        assert!(!ConflictResolution::AcceptClient.can_transition(ConflictResolution::Pending));
    }

    #[test]
    fn sync_entity_serialization_matches_wire_contract() {
        let actual = [
            SyncEntity::Student,
            SyncEntity::Guardian,
            SyncEntity::Enrollment,
            SyncEntity::GradeRecord,
            SyncEntity::AttendanceRecord,
            SyncEntity::Invoice,
            SyncEntity::Payment,
            SyncEntity::StaffMember,
            SyncEntity::Announcement,
        ]
        .iter()
        .map(|entity| serde_json::to_string(entity).expect("serialize sync entity"))
        .collect::<Vec<_>>();

        let expected = vec![
            "\"student\"",
            "\"guardian\"",
            "\"enrollment\"",
            "\"grade_record\"",
            "\"attendance_record\"",
            "\"invoice\"",
            "\"payment\"",
            "\"staff_member\"",
            "\"announcement\"",
        ];

        assert_eq!(actual, expected);
    }
}
