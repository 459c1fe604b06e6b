//! Sync API client for communicating with the Aula cloud service.

use std::time::Duration;

use log::debug;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};

use aula_core::sync::{
    ApiErrorBody, ResolveConflictRequest, ResolveConflictResponse, SyncDownRequest,
    SyncDownResponse, SyncSummaryResponse, SyncUpRequest, SyncUpResponse, TENANT_HEADER,
};

use crate::error::{Result, SyncApiError};

/// Default timeout for API requests. The round trip is the engine's only
/// suspension point; hitting this timeout is equivalent to a network failure.
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const MAX_LOG_BODY_CHARS: usize = 512;

/// Client for the Aula sync cloud API.
#[derive(Debug, Clone)]
pub struct SyncApiClient {
    client: reqwest::Client,
    base_url: String,
}

impl SyncApiClient {
    /// Create a new sync API client.
    ///
    /// `base_url` must carry an http(s) scheme; trailing slashes are trimmed
    /// so endpoint paths concatenate cleanly.
    pub fn new(base_url: &str) -> Result<Self> {
        let trimmed = base_url.trim();
        if !(trimmed.starts_with("http://") || trimmed.starts_with("https://")) {
            return Err(SyncApiError::invalid_request(
                "Sync API base URL must include http:// or https://",
            ));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url: trimmed.trim_end_matches('/').to_string(),
        })
    }

    fn headers(&self, token: &str, tenant_id: &str) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let auth_value = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|_| SyncApiError::auth("Invalid access token format"))?;
        headers.insert(AUTHORIZATION, auth_value);

        let tenant_value = HeaderValue::from_str(tenant_id)
            .map_err(|_| SyncApiError::auth("Invalid tenant id format"))?;
        headers.insert(TENANT_HEADER, tenant_value);

        Ok(headers)
    }

    fn log_response(status: reqwest::StatusCode, body: &str) {
        if status.is_success() {
            debug!("Sync API response status: {}", status);
            return;
        }

        let mut preview = body.chars().take(MAX_LOG_BODY_CHARS).collect::<String>();
        if body.chars().count() > MAX_LOG_BODY_CHARS {
            preview.push_str("...");
        }
        debug!("Sync API response error ({}): {}", status, preview);
    }

    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T> {
        let status = response.status();
        let body = response.text().await?;
        Self::log_response(status, &body);

        if !status.is_success() {
            if let Ok(error) = serde_json::from_str::<ApiErrorBody>(&body) {
                return Err(SyncApiError::api(
                    status.as_u16(),
                    format!("{}: {}", error.code, error.message),
                ));
            }
            return Err(SyncApiError::api(
                status.as_u16(),
                format!("Request failed: {}", body),
            ));
        }

        serde_json::from_str(&body).map_err(|e| {
            log::error!("Failed to deserialize response. Body: {}, Error: {}", body, e);
            SyncApiError::api(status.as_u16(), format!("Failed to parse response: {}", e))
        })
    }

    /// Push pending outbox events.
    ///
    /// POST /api/v1/sync/up
    pub async fn sync_up(
        &self,
        token: &str,
        tenant_id: &str,
        req: &SyncUpRequest,
    ) -> Result<SyncUpResponse> {
        let url = format!("{}/api/v1/sync/up", self.base_url);
        debug!("sync_up: {} events", req.events.len());

        let response = self
            .client
            .post(&url)
            .headers(self.headers(token, tenant_id)?)
            .json(req)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Pull server changes since the client's watermark.
    ///
    /// POST /api/v1/sync/down
    pub async fn sync_down(
        &self,
        token: &str,
        tenant_id: &str,
        req: &SyncDownRequest,
    ) -> Result<SyncDownResponse> {
        let url = format!("{}/api/v1/sync/down", self.base_url);
        debug!("sync_down: watermark {}", req.last_sync_timestamp);

        let response = self
            .client
            .post(&url)
            .headers(self.headers(token, tenant_id)?)
            .json(req)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Server-side sync summary for this tenant/client.
    ///
    /// GET /api/v1/sync/summary?clientId={clientId}
    pub async fn summary(
        &self,
        token: &str,
        tenant_id: &str,
        client_id: &str,
    ) -> Result<SyncSummaryResponse> {
        let url = format!(
            "{}/api/v1/sync/summary?clientId={}",
            self.base_url, client_id
        );

        let response = self
            .client
            .get(&url)
            .headers(self.headers(token, tenant_id)?)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Resolve a conflicted event on the server ledger.
    ///
    /// POST /api/v1/sync/resolve-conflict
    pub async fn resolve_conflict(
        &self,
        token: &str,
        tenant_id: &str,
        req: &ResolveConflictRequest,
    ) -> Result<ResolveConflictResponse> {
        let url = format!("{}/api/v1/sync/resolve-conflict", self.base_url);

        let response = self
            .client
            .post(&url)
            .headers(self.headers(token, tenant_id)?)
            .json(req)
            .send()
            .await?;

        Self::parse_response(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aula_core::sync::{PushOutcomeKind, SyncRetryClass};
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn new_rejects_base_url_without_scheme() {
        assert!(SyncApiClient::new("api.aula.school").is_err());
        assert!(SyncApiClient::new("https://api.aula.school/").is_ok());
    }

    #[tokio::test]
    async fn sync_up_sends_auth_and_tenant_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/sync/up"))
            .and(header("authorization", "Bearer token-1"))
            .and(header(TENANT_HEADER, "tenant-elmwood"))
            .and(body_partial_json(serde_json::json!({ "clientId": "c1" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "results": [{ "eventId": "e1", "outcome": "applied", "newVersion": 1 }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = SyncApiClient::new(&server.uri()).expect("client");
        let response = client
            .sync_up(
                "token-1",
                "tenant-elmwood",
                &SyncUpRequest {
                    client_id: "c1".to_string(),
                    pending_after: 0,
                    events: vec![],
                },
            )
            .await
            .expect("sync up");

        assert_eq!(response.results.len(), 1);
        assert_eq!(response.results[0].outcome, PushOutcomeKind::Applied);
        assert_eq!(response.results[0].new_version, Some(1));
    }

    #[tokio::test]
    async fn api_error_body_maps_to_api_error_with_retry_class() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/sync/down"))
            .respond_with(ResponseTemplate::new(503).set_body_json(serde_json::json!({
                "code": "unavailable",
                "message": "try later"
            })))
            .mount(&server)
            .await;

        let client = SyncApiClient::new(&server.uri()).expect("client");
        let err = client
            .sync_down(
                "token-1",
                "tenant-elmwood",
                &SyncDownRequest {
                    client_id: "c1".to_string(),
                    last_sync_timestamp: "1970-01-01T00:00:00+00:00".to_string(),
                },
            )
            .await
            .expect_err("should fail");

        assert_eq!(err.status_code(), Some(503));
        assert_eq!(err.retry_class(), SyncRetryClass::Retryable);
        assert!(err.to_string().contains("unavailable"));
    }

    #[tokio::test]
    async fn authorization_failure_is_reauth_class() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/sync/summary"))
            .respond_with(ResponseTemplate::new(403).set_body_json(serde_json::json!({
                "code": "forbidden",
                "message": "tenant mismatch"
            })))
            .mount(&server)
            .await;

        let client = SyncApiClient::new(&server.uri()).expect("client");
        let err = client
            .summary("token-1", "tenant-other", "c1")
            .await
            .expect_err("should fail");
        assert_eq!(err.retry_class(), SyncRetryClass::ReauthRequired);
    }
}
