//! Conflict merge policy.

use super::model::SyncOperation;

/// Outcome of the automatic merge check for a rejected event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeDecision {
    /// The client's update touches only fields the server did not diverge on;
    /// the payload can be re-submitted on the server's baseline.
    AutoMerge { baseline_version: i64 },
    /// Overlapping or structural conflict; an operator must choose.
    Manual,
}

/// Decide whether a conflicted event can be merged automatically.
///
/// Only partial updates qualify. For every field the payload touches, the
/// server's current value must equal either the client's pre-mutation value
/// (server never touched it) or the client's new value (both sides wrote the
/// same thing). Create/delete conflicts, missing base snapshots and deleted
/// server records always require an operator.
pub fn merge_decision(
    op: SyncOperation,
    payload: &serde_json::Value,
    base_fields: Option<&serde_json::Value>,
    server_state: Option<&serde_json::Value>,
    server_version: i64,
) -> MergeDecision {
    if op != SyncOperation::Update {
        return MergeDecision::Manual;
    }
    let (Some(payload), Some(base), Some(server)) = (
        payload.as_object(),
        base_fields.and_then(|value| value.as_object()),
        server_state.and_then(|value| value.as_object()),
    ) else {
        return MergeDecision::Manual;
    };

    for (field, new_value) in payload {
        let server_value = server.get(field).unwrap_or(&serde_json::Value::Null);
        if server_value == new_value {
            continue;
        }
        match base.get(field) {
            Some(base_value) if server_value == base_value => continue,
            _ => return MergeDecision::Manual,
        }
    }

    MergeDecision::AutoMerge {
        baseline_version: server_version,
    }
}
