//! Client-side sync engine: cycle orchestration, conflict resolution and the
//! background loop.

mod engine;

pub use engine::{SyncCycleOutcome, SyncEngine, SyncSession};
