//! Aula cloud sync service.

use std::sync::Arc;

use axum::{middleware, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod store;

use auth::{require_auth, SessionRegistry};
use store::SyncStore;

pub struct AppState {
    pub store: Arc<dyn SyncStore>,
    pub sessions: SessionRegistry,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: i64,
}

async fn healthz() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: Utc::now().timestamp(),
    })
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let protected = api::router()
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/healthz", get(healthz))
        .nest("/api/v1", protected)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers(Any)
                .allow_methods(Any),
        )
        .with_state(state)
}
