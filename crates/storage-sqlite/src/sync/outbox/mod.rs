//! Outbox, watermark, conflict and engine-state persistence.

mod model;
mod repository;

pub use model::*;
pub use repository::{append_outbox_event, NewOutboxEvent, SyncRepository};
