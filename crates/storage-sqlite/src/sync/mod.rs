//! SQLite storage implementation for tenant sync state.

pub mod outbox;

pub use outbox::{append_outbox_event, NewOutboxEvent, SyncRepository};
