//! Tenant-bound session authentication.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;

use aula_core::sync::TENANT_HEADER;

use crate::error::ApiError;
use crate::AppState;

/// The authenticated tenant scope attached to every request.
#[derive(Debug, Clone)]
pub struct TenantSession {
    pub tenant_id: String,
}

/// Static token -> tenant registry. Session issuance itself is an external
/// collaborator; the sync service only checks tenant binding.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    tokens: Arc<HashMap<String, String>>,
}

impl SessionRegistry {
    pub fn new(pairs: Vec<(String, String)>) -> Self {
        Self {
            tokens: Arc::new(pairs.into_iter().collect()),
        }
    }

    pub fn resolve(&self, token: &str) -> Option<&str> {
        self.tokens.get(token).map(String::as_str)
    }
}

fn extract_bearer_token(request: &Request) -> Result<&str, ApiError> {
    request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or_else(|| ApiError::unauthorized("Missing bearer token"))
}

/// Reject requests without a tenant-bound session before any handler runs.
/// The tenant header must match the tenant the token is bound to.
pub async fn require_auth(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = extract_bearer_token(&request)?;
    let tenant_id = state
        .sessions
        .resolve(token)
        .ok_or_else(|| ApiError::unauthorized("Unknown session token"))?
        .to_string();

    let header_tenant = request
        .headers()
        .get(TENANT_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ApiError::unauthorized("Missing tenant header"))?;
    if header_tenant != tenant_id {
        return Err(ApiError::forbidden(format!(
            "Tenant header '{}' does not match the session tenant",
            header_tenant
        )));
    }

    request.extensions_mut().insert(TenantSession { tenant_id });
    Ok(next.run(request).await)
}
