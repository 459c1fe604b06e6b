//! Storage abstraction for the tenant reconciler.
//!
//! The platform of record keeps tenant truth in a relational database; the
//! reconciler only needs the operations below, so it is written against this
//! trait. The in-memory backend carries the reference semantics and the
//! atomicity guarantees (per-tenant serialization of increment-and-compare).

use async_trait::async_trait;
use thiserror::Error;

use aula_core::sync::{
    ResolveConflictRequest, ResolveConflictResponse, SyncDownRequest, SyncDownResponse,
    SyncSummaryResponse, SyncUpRequest, SyncUpResponse,
};

pub mod memory;

pub use memory::MemoryStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Event tenant '{event_tenant}' does not match session tenant '{session_tenant}'")]
    TenantMismatch {
        event_tenant: String,
        session_tenant: String,
    },

    #[error("Batch of {len} events exceeds the {cap}-event cap")]
    BatchTooLarge { len: usize, cap: usize },

    #[error("No conflict recorded for event '{0}'")]
    UnknownConflict(String),

    #[error("Conflict for event '{0}' is already resolved")]
    ConflictAlreadyResolved(String),

    #[error("Invalid watermark '{0}'")]
    InvalidWatermark(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait SyncStore: Send + Sync {
    /// Validate and apply a batch of client events, returning per-event
    /// outcomes. The whole batch is rejected on any tenant mismatch, with
    /// zero side effects.
    async fn sync_up(&self, tenant_id: &str, request: SyncUpRequest)
        -> StoreResult<SyncUpResponse>;

    /// Changes committed after the client's watermark, in commit order.
    async fn sync_down(
        &self,
        tenant_id: &str,
        request: SyncDownRequest,
    ) -> StoreResult<SyncDownResponse>;

    /// Tenant-scoped sync health as seen by the server.
    async fn summary(
        &self,
        tenant_id: &str,
        client_id: Option<&str>,
    ) -> StoreResult<SyncSummaryResponse>;

    /// Close a conflict on the ledger; accepting the client version grants a
    /// one-shot version-check override for the resubmission.
    async fn resolve_conflict(
        &self,
        tenant_id: &str,
        request: ResolveConflictRequest,
    ) -> StoreResult<ResolveConflictResponse>;
}
