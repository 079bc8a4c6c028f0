//! Reconciliation worker: the single scheduled pass that moves the
//! pipeline forward.
//!
//! One cycle, under the cron singleton lock: resolve deliveries waiting on
//! a consent signal, drain queued order jobs into per-destination delivery
//! attempts, then deliver everything that is ready. Every transition is a
//! guarded single-statement update, so a second instance running the same
//! cycle concurrently can only skip work, never repeat it.

use std::collections::HashMap;

use futures::{stream, StreamExt};
use rusqlite::Connection;
use tokio::time::{timeout, Duration};

use crate::config::Config;
use crate::consent;
use crate::db::{queries, AppState};
use crate::error::Result;
use crate::models::{ConversionLog, CreateConversionLog, DeliveryStatus, Tenant};
use crate::platforms::{ConversionDelivery, ConversionEvent, HttpDelivery, Platform};
use crate::util::{checkout_token_hash, gen_event_id, parse_order_payload};

/// Lock name for the reconciliation schedule.
const RECONCILIATION_LOCK: &str = "reconciliation";

/// Retries are capped at one day apart regardless of attempt count.
const MAX_BACKOFF_SECS: i64 = 86_400;

/// Counters for one reconciliation cycle, logged at the end of each pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleStats {
    /// Another instance held the lock; nothing was attempted.
    pub skipped: bool,
    pub consent_confirmed: i64,
    pub consent_denied: i64,
    pub consent_expired: i64,
    pub jobs_fanned_out: i64,
    pub jobs_failed: i64,
    pub deliveries_sent: i64,
    pub deliveries_retried: i64,
    pub deliveries_dead_lettered: i64,
}

/// Exponential backoff schedule: base * 2^attempts, capped at one day.
pub fn backoff_delay(base_secs: i64, attempts: i64) -> i64 {
    let shift = attempts.clamp(0, 30) as u32;
    base_secs
        .saturating_mul(1i64 << shift)
        .min(MAX_BACKOFF_SECS)
}

/// Run one reconciliation cycle under the singleton lock.
pub async fn run_cycle<D: ConversionDelivery>(state: &AppState, delivery: &D) -> Result<CycleStats> {
    let config = &state.config;
    let mut stats = CycleStats::default();

    {
        let conn = state.db.get()?;

        let swept = queries::sweep_stale_locks(&conn, config.cron_lock_ttl_secs)?;
        if swept > 0 {
            tracing::warn!(swept, "removed stale cron locks");
        }

        if !queries::try_acquire_cron_lock(&conn, RECONCILIATION_LOCK)? {
            tracing::debug!("reconciliation lock held elsewhere, skipping cycle");
            stats.skipped = true;
            return Ok(stats);
        }
    }

    // The lock is held from here; release it on every exit path.
    let result = run_locked_cycle(state, delivery, &mut stats).await;

    let conn = state.db.get()?;
    if let Err(e) = queries::release_cron_lock(&conn, RECONCILIATION_LOCK) {
        tracing::error!("Failed to release reconciliation lock: {}", e);
    }

    result?;

    tracing::info!(
        consent_confirmed = stats.consent_confirmed,
        consent_denied = stats.consent_denied,
        consent_expired = stats.consent_expired,
        jobs_fanned_out = stats.jobs_fanned_out,
        sent = stats.deliveries_sent,
        retried = stats.deliveries_retried,
        dead_lettered = stats.deliveries_dead_lettered,
        "reconciliation cycle complete"
    );

    Ok(stats)
}

async fn run_locked_cycle<D: ConversionDelivery>(
    state: &AppState,
    delivery: &D,
    stats: &mut CycleStats,
) -> Result<()> {
    let config = &state.config;

    {
        let conn = state.db.get()?;
        resolve_pending_consent(&conn, config, stats)?;
        drain_queued_jobs(&conn, config, stats)?;
    }

    // The outbound phase holds no connection across awaits.
    deliver_ready(state, delivery, stats).await
}

/// Phase 1: resolve attempts parked in pending_consent.
///
/// A matching receipt settles the attempt (forward on allow, dead-letter
/// on deny). No receipt within the consent window dead-letters the attempt
/// as presumed non-consent, exactly once via the status guard.
fn resolve_pending_consent(
    conn: &Connection,
    config: &Config,
    stats: &mut CycleStats,
) -> Result<()> {
    let logs = queries::list_pending_consent(conn, config.worker_batch_size)?;
    let mut tenants: HashMap<String, Tenant> = HashMap::new();
    let now = chrono::Utc::now().timestamp();

    for log in logs {
        let Some(tenant) = lookup_tenant(conn, &mut tenants, &log.tenant_id)? else {
            tracing::error!(log_id = %log.id, tenant_id = %log.tenant_id, "attempt for missing tenant");
            continue;
        };

        let receipt = match find_consent_receipt(conn, &log)? {
            Some(r) => r,
            None => {
                let age_secs = now - log.created_at;
                if age_secs > config.consent_timeout_hours * 3600 {
                    let reaped = queries::dead_letter_log(
                        conn,
                        &log.id,
                        DeliveryStatus::PendingConsent,
                        "consent window expired without a client signal",
                    )?;
                    if reaped {
                        stats.consent_expired += 1;
                        tracing::info!(
                            log_id = %log.id,
                            order_id = %log.order_id,
                            age_secs,
                            "consent window expired, dead-lettered"
                        );
                    }
                }
                continue;
            }
        };

        let decision = consent::evaluate(tenant.consent_strategy, Some(&receipt.consent));
        if decision.allowed {
            if queries::mark_log_consent_confirmed(conn, &log.id, "client_confirmed")? {
                stats.consent_confirmed += 1;
                tracing::debug!(log_id = %log.id, reason = decision.reason, "consent confirmed");
            }
        } else if queries::dead_letter_log(conn, &log.id, DeliveryStatus::PendingConsent, decision.reason)? {
            stats.consent_denied += 1;
            tracing::info!(log_id = %log.id, reason = decision.reason, "consent denied, dead-lettered");
        }
    }

    Ok(())
}

/// Receipt lookup for consent resolution: by order key first, then by the
/// checkout token hash for pixels that fired before the order id existed.
fn find_consent_receipt(
    conn: &Connection,
    log: &ConversionLog,
) -> Result<Option<crate::models::Receipt>> {
    if let Some(receipt) =
        queries::find_receipt_for_order(conn, &log.tenant_id, &log.order_id, &log.event_type)?
    {
        return Ok(Some(receipt));
    }
    if let Some(hash) = &log.checkout_token_hash {
        return queries::find_receipt_by_token_hash(conn, &log.tenant_id, hash);
    }
    Ok(None)
}

/// Phase 2: drain queued jobs into one delivery attempt per enabled
/// destination. The claim is the concurrency guard; the fan-out insert is
/// idempotent, so a crash between claim and complete cannot duplicate
/// attempts on the next pass.
fn drain_queued_jobs(conn: &Connection, config: &Config, stats: &mut CycleStats) -> Result<()> {
    let jobs = queries::list_queued_jobs(conn, config.worker_batch_size)?;
    let mut tenants: HashMap<String, Tenant> = HashMap::new();

    for job in jobs {
        if !queries::try_claim_job(conn, &job.id)? {
            continue;
        }

        let Some(tenant) = lookup_tenant(conn, &mut tenants, &job.tenant_id)? else {
            tracing::error!(job_id = %job.id, tenant_id = %job.tenant_id, "job for missing tenant");
            queries::fail_job(conn, &job.id)?;
            stats.jobs_failed += 1;
            continue;
        };

        let summary = match parse_order_payload(&job.payload) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(job_id = %job.id, "unparseable job payload: {}", e);
                queries::fail_job(conn, &job.id)?;
                stats.jobs_failed += 1;
                continue;
            }
        };

        let initial = queries::initial_delivery_status(tenant.consent_strategy);
        let token_hash = summary.checkout_token.as_deref().map(checkout_token_hash);

        for platform in &tenant.platforms {
            queries::create_conversion_log(
                conn,
                &CreateConversionLog {
                    tenant_id: tenant.id.clone(),
                    order_id: summary.order_id.clone(),
                    platform: *platform,
                    event_type: "purchase".to_string(),
                    status: initial,
                    order_value: summary.value,
                    currency: summary.currency.clone(),
                    checkout_token_hash: token_hash.clone(),
                    // Assigned once here; every retry sends the same id so
                    // the destination can dedup across attempts.
                    event_id: Some(gen_event_id()),
                },
            )?;
        }

        queries::complete_job(conn, &job.id)?;
        stats.jobs_fanned_out += 1;

        tracing::debug!(
            job_id = %job.id,
            order_id = %summary.order_id,
            platforms = tenant.platforms.len(),
            initial_status = initial.as_ref(),
            "job fanned out"
        );
    }

    Ok(())
}

/// One outbound unit prepared while the connection was held.
struct DeliveryUnit {
    log_id: String,
    attempts: i64,
    platform: Platform,
    credentials: serde_json::Value,
    event: ConversionEvent,
}

enum DeliveryOutcome {
    Sent(String),
    Failed(String),
}

/// Phase 3: deliver ready attempts concurrently, then apply the outcomes.
///
/// Preparation and bookkeeping hold the connection; the awaits in between
/// do not. All deliveries settle (no short-circuit), so one destination
/// outage cannot starve the others in the batch.
async fn deliver_ready<D: ConversionDelivery>(
    state: &AppState,
    delivery: &D,
    stats: &mut CycleStats,
) -> Result<()> {
    let config = &state.config;
    let now = chrono::Utc::now().timestamp();

    let units = {
        let conn = state.db.get()?;
        let logs = queries::list_deliverable(&conn, now, config.worker_batch_size)?;
        let mut tenants: HashMap<String, Tenant> = HashMap::new();
        let mut units = Vec::with_capacity(logs.len());

        for log in logs {
            let Some(tenant) = lookup_tenant(&conn, &mut tenants, &log.tenant_id)? else {
                tracing::error!(log_id = %log.id, tenant_id = %log.tenant_id, "attempt for missing tenant");
                continue;
            };

            let credentials: serde_json::Value = match &tenant.credentials {
                Some(raw) => serde_json::from_str(raw)?,
                None => {
                    if queries::dead_letter_log(
                        &conn,
                        &log.id,
                        DeliveryStatus::Pending,
                        "no destination credentials configured",
                    )? {
                        stats.deliveries_dead_lettered += 1;
                    }
                    continue;
                }
            };

            units.push(DeliveryUnit {
                log_id: log.id.clone(),
                attempts: log.attempts,
                platform: log.platform,
                credentials,
                event: ConversionEvent {
                    order_id: log.order_id.clone(),
                    event_type: log.event_type.clone(),
                    value: log.order_value,
                    currency: log.currency.clone(),
                    // Reuse the fan-out id so retries are deduplicable
                    // destination-side. Rows predating the fan-out id get
                    // one minted here.
                    event_id: log.event_id.clone().unwrap_or_else(gen_event_id),
                },
            });
        }
        units
    };

    if units.is_empty() {
        return Ok(());
    }

    let per_delivery_timeout = Duration::from_secs(config.tenant_scan_timeout_secs);
    let outcomes: Vec<(String, i64, DeliveryOutcome)> = stream::iter(units)
        .map(|unit| async move {
            let attempt = timeout(
                per_delivery_timeout,
                delivery.deliver(unit.platform, &unit.credentials, &unit.event),
            )
            .await;
            let outcome = match attempt {
                Ok(Ok(destination_event_id)) => DeliveryOutcome::Sent(destination_event_id),
                Ok(Err(e)) => DeliveryOutcome::Failed(e.to_string()),
                Err(_) => DeliveryOutcome::Failed("delivery timed out".to_string()),
            };
            (unit.log_id, unit.attempts, outcome)
        })
        .buffer_unordered(config.worker_concurrency)
        .collect()
        .await;

    let conn = state.db.get()?;
    let now = chrono::Utc::now().timestamp();

    for (log_id, attempts, outcome) in outcomes {
        match outcome {
            DeliveryOutcome::Sent(destination_event_id) => {
                if queries::mark_log_sent(&conn, &log_id, &destination_event_id)? {
                    stats.deliveries_sent += 1;
                    tracing::info!(log_id = %log_id, event_id = %destination_event_id, "conversion delivered");
                }
            }
            DeliveryOutcome::Failed(error) => {
                if attempts + 1 >= config.delivery_max_retries {
                    let reason = format!("retries exhausted: {}", error);
                    if queries::dead_letter_log(&conn, &log_id, DeliveryStatus::Pending, &reason)? {
                        stats.deliveries_dead_lettered += 1;
                        tracing::warn!(log_id = %log_id, error = %error, "retries exhausted, dead-lettered");
                    }
                } else {
                    let next_retry_at =
                        now + backoff_delay(config.retry_backoff_base_secs, attempts);
                    queries::record_delivery_failure(&conn, &log_id, &error, next_retry_at)?;
                    stats.deliveries_retried += 1;
                    tracing::warn!(log_id = %log_id, error = %error, next_retry_at, "delivery failed, retry scheduled");
                }
            }
        }
    }

    Ok(())
}

fn lookup_tenant<'a>(
    conn: &Connection,
    cache: &'a mut HashMap<String, Tenant>,
    tenant_id: &str,
) -> Result<Option<&'a Tenant>> {
    if !cache.contains_key(tenant_id) {
        match queries::get_tenant_by_id(conn, tenant_id)? {
            Some(t) => {
                cache.insert(tenant_id.to_string(), t);
            }
            None => return Ok(None),
        }
    }
    Ok(cache.get(tenant_id))
}

/// Spawn the periodic reconciliation loop. A failed cycle is logged and
/// retried on the next tick; only the task itself is long-lived.
pub fn spawn_worker_loop(state: AppState) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let delivery = HttpDelivery::new();
        let mut ticker =
            tokio::time::interval(Duration::from_secs(state.config.worker_interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            match run_cycle(&state, &delivery).await {
                Ok(stats) if stats.skipped => {}
                Ok(_) => {}
                Err(e) => tracing::error!("reconciliation cycle failed: {}", e),
            }
        }
    })
}
