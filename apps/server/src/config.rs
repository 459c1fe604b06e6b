//! Server configuration from environment variables.

use std::net::SocketAddr;

use anyhow::Context;

/// One canonical bind address; no fallback chain.
const DEFAULT_BIND: &str = "127.0.0.1:3000";

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    /// `(token, tenant_id)` pairs forming the tenant-bound session registry.
    pub sessions: Vec<(String, String)>,
}

impl ServerConfig {
    /// Load configuration from `AULA_BIND` and `AULA_SYNC_TOKENS`.
    ///
    /// `AULA_SYNC_TOKENS` is a comma-separated list of `token=tenant` pairs,
    /// e.g. `frontdesk-key=tenant-elmwood,registrar-key=tenant-elmwood`.
    pub fn from_env() -> anyhow::Result<Self> {
        let bind = std::env::var("AULA_BIND")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BIND.to_string())
            .parse::<SocketAddr>()
            .context("AULA_BIND must be a host:port address")?;

        let sessions = std::env::var("AULA_SYNC_TOKENS")
            .ok()
            .map(|raw| parse_token_pairs(&raw))
            .transpose()?
            .unwrap_or_default();

        Ok(Self { bind, sessions })
    }
}

fn parse_token_pairs(raw: &str) -> anyhow::Result<Vec<(String, String)>> {
    raw.split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (token, tenant) = pair
                .split_once('=')
                .with_context(|| format!("Invalid token pair '{}', expected token=tenant", pair))?;
            let token = token.trim();
            let tenant = tenant.trim();
            if token.is_empty() || tenant.is_empty() {
                anyhow::bail!("Invalid token pair '{}', empty token or tenant", pair);
            }
            Ok((token.to_string(), tenant.to_string()))
        })
        .collect()
}
