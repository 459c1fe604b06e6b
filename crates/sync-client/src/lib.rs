//! HTTP client for the Aula sync API.

mod client;
mod error;

pub use client::SyncApiClient;
pub use error::{Result, SyncApiError};
