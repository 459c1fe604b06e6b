//! HTTP API modules.

mod sync;

pub use sync::router;
