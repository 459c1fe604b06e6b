//! Sync cycle engine: push/pull orchestration and background loop.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use rand::Rng;
use tokio::task::JoinHandle;

use aula_core::errors::{Error, Result};
use aula_core::sync::{
    backoff_seconds, merge_decision, ConflictRecord, ConflictResolution, MergeDecision,
    OutboxEvent, OutboxStatus, PushEvent, PushOutcomeKind, ResolveConflictRequest,
    SyncCycleTrigger, SyncDownRequest, SyncRetryClass, SyncSummary, SyncUpRequest,
    MAX_SYNC_UP_BATCH, ACKNOWLEDGED_RETENTION_HOURS, SYNC_FOREGROUND_INTERVAL_SECS,
    SYNC_INTERVAL_JITTER_SECS, SYNC_PENDING_FAST_DELAY_MS,
};
use aula_storage_sqlite::sync::SyncRepository;
use aula_sync_client::{SyncApiClient, SyncApiError};

/// Connection parameters for one tenant-bound session, injected explicitly.
#[derive(Debug, Clone)]
pub struct SyncSession {
    pub tenant_id: String,
    pub client_id: String,
    pub base_url: String,
    pub access_token: String,
}

/// Result of one sync cycle.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCycleOutcome {
    pub status: String,
    pub pushed_count: usize,
    pub pulled_count: usize,
    pub conflict_count: usize,
    pub watermark: String,
}

fn millis_until_rfc3339(timestamp: &str) -> Option<u64> {
    let target = DateTime::parse_from_rfc3339(timestamp).ok()?;
    let delta = target.timestamp_millis() - Utc::now().timestamp_millis();
    (delta > 0).then_some(delta as u64)
}

fn api_error_to_core(err: &SyncApiError) -> Error {
    match err.retry_class() {
        SyncRetryClass::ReauthRequired => Error::authorization(err.to_string()),
        SyncRetryClass::Retryable => Error::network(err.to_string()),
        SyncRetryClass::Permanent => Error::validation(err.to_string()),
    }
}

/// Tracks mutable progress during a cycle and records failures.
struct CycleContext {
    repo: Arc<SyncRepository>,
    started_at: std::time::Instant,
    pushed_count: usize,
    pulled_count: usize,
    conflict_count: usize,
}

impl CycleContext {
    /// Record a cycle failure: persist error + outcome, then return a result.
    async fn fail(
        &self,
        status: &str,
        message: String,
        retry_secs: Option<i64>,
    ) -> Result<SyncCycleOutcome> {
        self.repo.mark_engine_error(message).await?;
        let retry_at =
            retry_secs.map(|s| (Utc::now() + chrono::Duration::seconds(s)).to_rfc3339());
        let _ = self
            .repo
            .mark_cycle_outcome(
                status.to_string(),
                self.started_at.elapsed().as_millis() as i64,
                retry_at,
            )
            .await;
        Ok(SyncCycleOutcome {
            status: status.to_string(),
            pushed_count: self.pushed_count,
            pulled_count: self.pulled_count,
            conflict_count: self.conflict_count,
            watermark: self.repo.watermark().unwrap_or_default(),
        })
    }
}

pub struct SyncEngine {
    repo: Arc<SyncRepository>,
    client: SyncApiClient,
    session: SyncSession,
    cycle_lock: tokio::sync::Mutex<()>,
    background_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SyncEngine {
    pub fn new(repo: Arc<SyncRepository>, session: SyncSession) -> Result<Self> {
        let client = SyncApiClient::new(&session.base_url)
            .map_err(|e| Error::validation(e.to_string()))?;
        Ok(Self {
            repo,
            client,
            session,
            cycle_lock: tokio::sync::Mutex::new(()),
            background_task: tokio::sync::Mutex::new(None),
        })
    }

    pub fn repository(&self) -> &Arc<SyncRepository> {
        &self.repo
    }

    /// Local synchronization health. Reads local state only; never blocks on
    /// the network, so it is always safe to call from the UI.
    pub fn summary(&self) -> Result<SyncSummary> {
        self.repo.get_summary()
    }

    /// Run one push+pull cycle.
    ///
    /// A second trigger while a cycle is in flight is coalesced, not queued:
    /// the in-flight cycle already covers it.
    pub async fn run_cycle(&self, trigger: SyncCycleTrigger) -> Result<SyncCycleOutcome> {
        let Ok(_cycle_guard) = self.cycle_lock.try_lock() else {
            debug!("Sync cycle already in flight; coalescing {:?} trigger", trigger);
            return Ok(SyncCycleOutcome {
                status: "coalesced".to_string(),
                pushed_count: 0,
                pulled_count: 0,
                conflict_count: 0,
                watermark: self.repo.watermark().unwrap_or_default(),
            });
        };

        let mut ctx = CycleContext {
            repo: Arc::clone(&self.repo),
            started_at: std::time::Instant::now(),
            pushed_count: 0,
            pulled_count: 0,
            conflict_count: 0,
        };
        debug!("Sync cycle started (trigger {:?})", trigger);

        if let Some(outcome) = self.push_phase(&mut ctx).await? {
            return Ok(outcome);
        }
        if let Some(outcome) = self.pull_phase(&mut ctx).await? {
            return Ok(outcome);
        }

        let _ = self
            .repo
            .purge_acknowledged(ACKNOWLEDGED_RETENTION_HOURS)
            .await;

        self.repo
            .mark_cycle_outcome(
                "ok".to_string(),
                ctx.started_at.elapsed().as_millis() as i64,
                None,
            )
            .await?;

        Ok(SyncCycleOutcome {
            status: "ok".to_string(),
            pushed_count: ctx.pushed_count,
            pulled_count: ctx.pulled_count,
            conflict_count: ctx.conflict_count,
            watermark: self.repo.watermark()?,
        })
    }

    /// Push pending outbox events. Returns `Some` when the cycle should end
    /// early with the given outcome.
    async fn push_phase(&self, ctx: &mut CycleContext) -> Result<Option<SyncCycleOutcome>> {
        let pending = self.repo.list_pending(MAX_SYNC_UP_BATCH as i64)?;
        if pending.is_empty() {
            return Ok(None);
        }

        let event_ids: Vec<String> = pending.iter().map(|e| e.event_id.clone()).collect();
        let events_by_id: HashMap<String, OutboxEvent> = pending
            .iter()
            .map(|e| (e.event_id.clone(), e.clone()))
            .collect();

        self.repo
            .mark_statuses(event_ids.clone(), OutboxStatus::Sent)
            .await?;

        let request = SyncUpRequest {
            client_id: self.session.client_id.clone(),
            pending_after: self.repo.pending_count()?,
            events: pending.into_iter().map(PushEvent::from).collect(),
        };

        let response = match self
            .client
            .sync_up(&self.session.access_token, &self.session.tenant_id, &request)
            .await
        {
            Ok(response) => response,
            Err(err) => {
                // No response means no server-side effect we can rely on;
                // events go back to pending and the idempotent resubmission
                // covers the case where the server did apply them.
                self.repo
                    .mark_statuses(event_ids, OutboxStatus::Pending)
                    .await?;

                let failures = self.repo.get_engine_status()?.consecutive_failures;
                let backoff = backoff_seconds(failures);
                let (status, retry) = match err.retry_class() {
                    SyncRetryClass::ReauthRequired => ("auth_error", Some(30)),
                    _ => ("push_error", Some(backoff)),
                };
                return ctx
                    .fail(status, format!("Push failed: {}", err), retry)
                    .await
                    .map(Some);
            }
        };

        for result in response.results {
            let Some(event) = events_by_id.get(&result.event_id) else {
                warn!("Server reported outcome for unknown event {}", result.event_id);
                continue;
            };
            match result.outcome {
                PushOutcomeKind::Applied => {
                    self.repo
                        .mark_status(result.event_id.clone(), OutboxStatus::Acknowledged)
                        .await?;
                    if let Some(new_version) = result.new_version {
                        // Chained local edits may already believe a higher
                        // version; never regress the belief.
                        let believed =
                            self.repo.entity_version(event.entity, &event.entity_id)?;
                        if new_version > believed {
                            self.repo
                                .set_entity_version(
                                    event.entity,
                                    event.entity_id.clone(),
                                    new_version,
                                )
                                .await?;
                        }
                    }
                    ctx.pushed_count += 1;
                }
                PushOutcomeKind::RejectedConflict => {
                    let server_version = result.server_version.unwrap_or(0);
                    self.repo
                        .record_conflict(ConflictRecord {
                            outbox_event_id: result.event_id.clone(),
                            entity: event.entity,
                            entity_id: event.entity_id.clone(),
                            server_version,
                            server_state: result.server_state.clone(),
                            client_payload: event.payload.clone(),
                            resolution: ConflictResolution::Pending,
                            created_at: Utc::now().to_rfc3339(),
                            resolved_at: None,
                        })
                        .await?;
                    ctx.conflict_count += 1;

                    self.try_auto_merge(event, result.server_state.as_ref(), server_version)
                        .await;
                }
                PushOutcomeKind::RejectedInvalid => {
                    let reason = result
                        .reason
                        .unwrap_or_else(|| "rejected by server validation".to_string());
                    warn!(
                        "Event {} rejected as invalid: {}",
                        result.event_id, reason
                    );
                    self.repo.mark_failed(result.event_id, reason).await?;
                }
            }
        }

        self.repo.mark_push_completed().await?;
        Ok(None)
    }

    /// Attempt an attribute-level merge for a freshly recorded conflict.
    async fn try_auto_merge(
        &self,
        event: &OutboxEvent,
        server_state: Option<&serde_json::Value>,
        server_version: i64,
    ) {
        let decision = merge_decision(
            event.op,
            &event.payload,
            event.base_fields.as_ref(),
            server_state,
            server_version,
        );
        let MergeDecision::AutoMerge { baseline_version } = decision else {
            return;
        };

        // The server ledger must grant the override before the event re-enters
        // the queue; when that call fails the conflict simply stays open for
        // the operator.
        let grant = self
            .client
            .resolve_conflict(
                &self.session.access_token,
                &self.session.tenant_id,
                &ResolveConflictRequest {
                    outbox_event_id: event.event_id.clone(),
                    accept_server_version: false,
                },
            )
            .await;
        let baseline = match grant {
            Ok(response) => response.new_baseline_version.unwrap_or(baseline_version),
            Err(err) => {
                warn!(
                    "Auto-merge override grant failed for {}: {}",
                    event.event_id, err
                );
                return;
            }
        };

        if let Err(err) = self
            .repo
            .resolve_accept_client(event.event_id.clone(), baseline, ConflictResolution::Merged)
            .await
        {
            warn!("Auto-merge requeue failed for {}: {}", event.event_id, err);
        } else {
            info!(
                "Auto-merged conflict on {:?}/{} at baseline {}",
                event.entity, event.entity_id, baseline
            );
        }
    }

    /// Pull and apply server changes page by page. Returns `Some` when the
    /// cycle should end early with the given outcome.
    async fn pull_phase(&self, ctx: &mut CycleContext) -> Result<Option<SyncCycleOutcome>> {
        loop {
            let watermark = self.repo.watermark()?;
            let response = match self
                .client
                .sync_down(
                    &self.session.access_token,
                    &self.session.tenant_id,
                    &SyncDownRequest {
                        client_id: self.session.client_id.clone(),
                        last_sync_timestamp: watermark,
                    },
                )
                .await
            {
                Ok(response) => response,
                Err(err) => {
                    let (status, retry) = match err.retry_class() {
                        SyncRetryClass::ReauthRequired => ("auth_error", Some(30)),
                        _ => ("pull_error", Some(10)),
                    };
                    return ctx
                        .fail(status, format!("Pull failed: {}", err), retry)
                        .await
                        .map(Some);
                }
            };

            let has_more = response.has_more;
            let new_watermark = response.new_watermark.clone();
            // Changes this client originated are already applied locally.
            let changes: Vec<_> = response
                .changes
                .into_iter()
                .filter(|change| change.origin_client_id != self.session.client_id)
                .collect();

            let applied = match self
                .repo
                .apply_server_changes(changes, new_watermark)
                .await
            {
                Ok(applied) => applied,
                Err(err) => {
                    // The page rolled back and the watermark did not move;
                    // the next cycle retries the batch wholesale.
                    return ctx
                        .fail("apply_error", format!("Local apply failed: {}", err), Some(10))
                        .await
                        .map(Some);
                }
            };
            ctx.pulled_count += applied;

            if !has_more {
                break;
            }
        }

        self.repo.mark_pull_completed().await?;
        Ok(None)
    }

    /// Resolve a conflicted event by operator choice.
    ///
    /// Accepting the server version acknowledges the local event without
    /// applying it; accepting the client version re-queues the event against
    /// the server's baseline with a one-time override.
    pub async fn resolve_conflict(
        &self,
        outbox_event_id: &str,
        accept_server_version: bool,
    ) -> Result<ConflictResolution> {
        let conflict = self
            .repo
            .get_conflict(outbox_event_id)?
            .ok_or_else(|| Error::validation(format!("Unknown conflict '{}'", outbox_event_id)))?;
        if conflict.resolution.is_terminal() {
            return Err(Error::InvalidTransition {
                from: format!("{:?}", conflict.resolution).to_lowercase(),
                to: "resolved".to_string(),
            });
        }

        let response = self
            .client
            .resolve_conflict(
                &self.session.access_token,
                &self.session.tenant_id,
                &ResolveConflictRequest {
                    outbox_event_id: outbox_event_id.to_string(),
                    accept_server_version,
                },
            )
            .await
            .map_err(|e| api_error_to_core(&e))?;

        if accept_server_version {
            self.repo
                .resolve_accept_server(outbox_event_id.to_string())
                .await?;
            Ok(ConflictResolution::AcceptServer)
        } else {
            let baseline = response
                .new_baseline_version
                .unwrap_or(conflict.server_version);
            self.repo
                .resolve_accept_client(
                    outbox_event_id.to_string(),
                    baseline,
                    ConflictResolution::AcceptClient,
                )
                .await?;
            Ok(ConflictResolution::AcceptClient)
        }
    }

    /// Start the periodic background loop; idempotent while it is running.
    pub async fn ensure_background_started(self: &Arc<Self>) -> Result<()> {
        let mut guard = self.background_task.lock().await;
        if let Some(handle) = guard.as_ref() {
            if !handle.is_finished() {
                return Ok(());
            }
            guard.take();
        }

        let engine = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut consecutive_auth_errors: u32 = 0;
            loop {
                match engine.run_cycle(SyncCycleTrigger::Periodic).await {
                    Err(err) => {
                        warn!("Background sync cycle failed: {}", err);
                    }
                    Ok(outcome) => {
                        debug!(
                            "Cycle complete status={} pushed={} pulled={} conflicts={} watermark={}",
                            outcome.status,
                            outcome.pushed_count,
                            outcome.pulled_count,
                            outcome.conflict_count,
                            outcome.watermark
                        );
                        if outcome.status == "auth_error" {
                            consecutive_auth_errors += 1;
                            if consecutive_auth_errors >= 5 {
                                info!(
                                    "{} consecutive auth errors; stopping background engine until re-auth",
                                    consecutive_auth_errors
                                );
                                break;
                            }
                        } else {
                            consecutive_auth_errors = 0;
                        }
                    }
                }

                let jitter_bound = SYNC_INTERVAL_JITTER_SECS.saturating_mul(1000);
                let jitter_ms = rand::thread_rng().gen_range(0..=jitter_bound);
                let mut delay_ms =
                    SYNC_FOREGROUND_INTERVAL_SECS.saturating_mul(1000) + jitter_ms;

                if let Ok(engine_status) = engine.repo.get_engine_status() {
                    if let Some(next_retry_at) = engine_status.next_retry_at.as_deref() {
                        if let Some(wait_ms) = millis_until_rfc3339(next_retry_at) {
                            delay_ms = wait_ms.saturating_add(jitter_ms).max(1_000);
                        }
                    }
                }

                if let Ok(pending) = engine.repo.pending_count() {
                    if pending > 0 {
                        delay_ms = delay_ms.min(SYNC_PENDING_FAST_DELAY_MS + (jitter_ms % 500));
                    }
                }

                tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
            }
        });
        *guard = Some(handle);
        Ok(())
    }

    pub async fn ensure_background_stopped(&self) {
        let mut guard = self.background_task.lock().await;
        if let Some(handle) = guard.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    use aula_core::sync::{SyncEntity, SyncOperation};
    use aula_storage_sqlite::db::{create_pool, init, run_migrations, spawn_writer};
    use aula_storage_sqlite::sync::NewOutboxEvent;

    const TENANT: &str = "tenant-elmwood";
    const CLIENT: &str = "client-frontdesk";

    fn setup_engine(base_url: &str) -> Arc<SyncEngine> {
        let app_data = tempdir()
            .expect("tempdir")
            .keep()
            .to_string_lossy()
            .to_string();
        let db_path = init(&app_data).expect("init db");
        run_migrations(&db_path).expect("migrate db");
        let pool = create_pool(&db_path).expect("create pool");
        let writer = spawn_writer(pool.as_ref().clone());
        let repo = Arc::new(SyncRepository::new(pool, writer, CLIENT, TENANT));
        Arc::new(
            SyncEngine::new(
                repo,
                SyncSession {
                    tenant_id: TENANT.to_string(),
                    client_id: CLIENT.to_string(),
                    base_url: base_url.to_string(),
                    access_token: "token-frontdesk".to_string(),
                },
            )
            .expect("engine"),
        )
    }

    #[tokio::test]
    async fn concurrent_trigger_is_coalesced() {
        let engine = setup_engine("http://127.0.0.1:9");
        let _held = engine.cycle_lock.lock().await;

        let outcome = engine
            .run_cycle(SyncCycleTrigger::Manual)
            .await
            .expect("cycle");
        assert_eq!(outcome.status, "coalesced");
    }

    #[tokio::test]
    async fn transport_failure_leaves_events_pending() {
        // Nothing listens on port 9; the push round trip fails outright.
        let engine = setup_engine("http://127.0.0.1:9");
        engine
            .repo
            .append(NewOutboxEvent::new(
                TENANT,
                SyncEntity::Student,
                "s1",
                SyncOperation::Create,
                json!({ "id": "s1", "first_name": "Amara", "last_name": "Okoro" }),
            ))
            .await
            .expect("append");

        let outcome = engine
            .run_cycle(SyncCycleTrigger::Manual)
            .await
            .expect("cycle");
        assert_eq!(outcome.status, "push_error");

        // Safe blanket retry: the event is pending again, nothing advanced.
        let summary = engine.summary().expect("summary");
        assert_eq!(summary.pending_count, 1);
        assert_eq!(summary.failed_count, 0);
        assert!(summary.last_sync_up.is_none());
    }

    #[test]
    fn millis_until_handles_past_and_future() {
        let past = (Utc::now() - chrono::Duration::seconds(5)).to_rfc3339();
        assert!(millis_until_rfc3339(&past).is_none());

        let future = (Utc::now() + chrono::Duration::seconds(5)).to_rfc3339();
        let wait = millis_until_rfc3339(&future).expect("future wait");
        assert!(wait > 3_000 && wait <= 5_000);
    }
}
