//! Every mutation in the pipeline is a single atomic statement: unique-key
//! inserts, conditional updates, and upserts. No read-then-write pairs, no
//! advisory locks between instances.

use chrono::Utc;
use rusqlite::{params, Connection};
use uuid::Uuid;

use crate::consent::ConsentStrategy;
use crate::error::Result;
use crate::models::*;
use crate::platforms::Platform;

use super::from_row::{
    query_all, query_one, CONVERSION_LOG_COLS, JOB_COLS, RECEIPT_COLS, TENANT_COLS,
    USAGE_COUNTER_COLS, VERIFICATION_RUN_COLS, WEBHOOK_EVENT_COLS,
};

/// Reserved tenant id under which cron lock rows live in webhook_events.
pub const SYSTEM_TENANT: &str = "_system";
/// Topic marking a webhook_events row as a cron lock rather than a webhook.
pub const CRON_LOCK_TOPIC: &str = "cron_lock";

fn now() -> i64 {
    Utc::now().timestamp()
}

fn gen_id() -> String {
    Uuid::new_v4().to_string()
}

// ============ Tenants ============

pub fn create_tenant(conn: &Connection, input: &CreateTenant) -> Result<Tenant> {
    let id = gen_id();
    let now = now();
    let platforms = serde_json::to_string(&input.platforms)?;

    conn.execute(
        "INSERT INTO tenants (id, domain, plan, consent_strategy, platforms, webhook_secret, credentials, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            &id,
            &input.domain,
            input.plan.as_str(),
            input.consent_strategy.as_str(),
            &platforms,
            &input.webhook_secret,
            &input.credentials,
            now,
            now
        ],
    )?;

    Ok(Tenant {
        id,
        domain: input.domain.clone(),
        plan: input.plan,
        consent_strategy: input.consent_strategy,
        platforms: input.platforms.clone(),
        webhook_secret: input.webhook_secret.clone(),
        credentials: input.credentials.clone(),
        created_at: now,
        updated_at: now,
    })
}

pub fn get_tenant_by_id(conn: &Connection, id: &str) -> Result<Option<Tenant>> {
    query_one(
        conn,
        &format!("SELECT {} FROM tenants WHERE id = ?1", TENANT_COLS),
        &[&id],
    )
}

pub fn get_tenant_by_domain(conn: &Connection, domain: &str) -> Result<Option<Tenant>> {
    query_one(
        conn,
        &format!("SELECT {} FROM tenants WHERE domain = ?1", TENANT_COLS),
        &[&domain],
    )
}

// ============ Idempotency Ledger ============

/// Record a webhook id if it has not been seen before.
///
/// A single INSERT OR IGNORE races on the UNIQUE(tenant_id, webhook_id,
/// topic) key; zero affected rows is the normal "already seen" signal,
/// never an error. Callers must acknowledge upstream either way.
pub fn record_webhook_if_new(
    conn: &Connection,
    tenant_id: &str,
    webhook_id: &str,
    topic: &str,
) -> Result<IdempotencyOutcome> {
    let affected = conn.execute(
        "INSERT OR IGNORE INTO webhook_events (id, tenant_id, webhook_id, topic, status, received_at)
         VALUES (?1, ?2, ?3, ?4, 'processing', ?5)",
        params![gen_id(), tenant_id, webhook_id, topic, now()],
    )?;
    Ok(IdempotencyOutcome { is_new: affected > 0 })
}

pub fn mark_webhook_processed(
    conn: &Connection,
    tenant_id: &str,
    webhook_id: &str,
    topic: &str,
    order_id: Option<&str>,
) -> Result<()> {
    conn.execute(
        "UPDATE webhook_events SET status = 'processed', order_id = ?4, processed_at = ?5
         WHERE tenant_id = ?1 AND webhook_id = ?2 AND topic = ?3",
        params![tenant_id, webhook_id, topic, order_id, now()],
    )?;
    Ok(())
}

pub fn mark_webhook_failed(
    conn: &Connection,
    tenant_id: &str,
    webhook_id: &str,
    topic: &str,
) -> Result<()> {
    conn.execute(
        "UPDATE webhook_events SET status = 'failed', processed_at = ?4
         WHERE tenant_id = ?1 AND webhook_id = ?2 AND topic = ?3",
        params![tenant_id, webhook_id, topic, now()],
    )?;
    Ok(())
}

pub fn get_webhook_event(
    conn: &Connection,
    tenant_id: &str,
    webhook_id: &str,
    topic: &str,
) -> Result<Option<IdempotencyRecord>> {
    query_one(
        conn,
        &format!(
            "SELECT {} FROM webhook_events WHERE tenant_id = ?1 AND webhook_id = ?2 AND topic = ?3",
            WEBHOOK_EVENT_COLS
        ),
        &[&tenant_id, &webhook_id, &topic],
    )
}

// ============ Billing Gate ============

/// Atomically reserve one usage slot for the billing period.
///
/// Seeds (and refreshes the limit of) the counter row, then increments it
/// with a ceiling in a single conditional UPDATE. The affected-row count
/// is the decision; under N concurrent callers SQLite serializes the
/// updates, so `current` can never exceed the limit through this path.
pub fn reserve_usage_slot(
    conn: &Connection,
    tenant_id: &str,
    year_month: &str,
    limit: i64,
) -> Result<BillingDecision> {
    conn.execute(
        "INSERT INTO usage_counters (tenant_id, year_month, current, usage_limit)
         VALUES (?1, ?2, 0, ?3)
         ON CONFLICT(tenant_id, year_month) DO UPDATE SET usage_limit = excluded.usage_limit",
        params![tenant_id, year_month, limit],
    )?;

    let affected = conn.execute(
        "UPDATE usage_counters SET current = current + 1
         WHERE tenant_id = ?1 AND year_month = ?2 AND current < usage_limit",
        params![tenant_id, year_month],
    )?;

    let counter = get_usage_counter(conn, tenant_id, year_month)?.unwrap_or(UsageCounter {
        tenant_id: tenant_id.to_string(),
        year_month: year_month.to_string(),
        current: 0,
        usage_limit: limit,
    });

    let allowed = affected > 0;
    Ok(BillingDecision {
        allowed,
        usage: UsageSnapshot { current: counter.current, limit: counter.usage_limit },
        reason: if allowed {
            None
        } else {
            Some(format!(
                "monthly conversion limit reached ({}/{})",
                counter.current, counter.usage_limit
            ))
        },
    })
}

/// Compensate a speculative reservation, flooring at zero so a double
/// release cannot underflow the counter.
pub fn release_usage_slot(conn: &Connection, tenant_id: &str, year_month: &str) -> Result<()> {
    conn.execute(
        "UPDATE usage_counters SET current = current - 1
         WHERE tenant_id = ?1 AND year_month = ?2 AND current > 0",
        params![tenant_id, year_month],
    )?;
    Ok(())
}

pub fn get_usage_counter(
    conn: &Connection,
    tenant_id: &str,
    year_month: &str,
) -> Result<Option<UsageCounter>> {
    query_one(
        conn,
        &format!(
            "SELECT {} FROM usage_counters WHERE tenant_id = ?1 AND year_month = ?2",
            USAGE_COUNTER_COLS
        ),
        &[&tenant_id, &year_month],
    )
}

// ============ Job Queue ============

/// Upsert a job for (tenant, order).
///
/// A replayed or amended webhook merges payload fields into the existing
/// row, but the DO UPDATE is guarded on status = 'queued' so a job the
/// worker has already picked up is never regressed.
pub fn upsert_job(
    conn: &Connection,
    tenant_id: &str,
    order_id: &str,
    payload: &str,
    order_value: f64,
    currency: &str,
) -> Result<()> {
    let now = now();
    conn.execute(
        "INSERT INTO jobs (id, tenant_id, order_id, payload, order_value, currency, status, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'queued', ?7, ?7)
         ON CONFLICT(tenant_id, order_id) DO UPDATE SET
             payload = excluded.payload,
             order_value = excluded.order_value,
             currency = excluded.currency,
             updated_at = excluded.updated_at
         WHERE jobs.status = 'queued'",
        params![gen_id(), tenant_id, order_id, payload, order_value, currency, now],
    )?;
    Ok(())
}

pub fn get_job(conn: &Connection, tenant_id: &str, order_id: &str) -> Result<Option<Job>> {
    query_one(
        conn,
        &format!("SELECT {} FROM jobs WHERE tenant_id = ?1 AND order_id = ?2", JOB_COLS),
        &[&tenant_id, &order_id],
    )
}

pub fn list_queued_jobs(conn: &Connection, limit: i64) -> Result<Vec<Job>> {
    query_all(
        conn,
        &format!(
            "SELECT {} FROM jobs WHERE status = 'queued' ORDER BY created_at ASC LIMIT ?1",
            JOB_COLS
        ),
        &[&limit],
    )
}

/// Claim a queued job for processing. The status guard, not a row lock,
/// is what keeps two workers off the same job.
pub fn try_claim_job(conn: &Connection, job_id: &str) -> Result<bool> {
    let affected = conn.execute(
        "UPDATE jobs SET status = 'processing', updated_at = ?2
         WHERE id = ?1 AND status = 'queued'",
        params![job_id, now()],
    )?;
    Ok(affected > 0)
}

pub fn complete_job(conn: &Connection, job_id: &str) -> Result<()> {
    conn.execute(
        "UPDATE jobs SET status = 'completed', updated_at = ?2 WHERE id = ?1",
        params![job_id, now()],
    )?;
    Ok(())
}

pub fn fail_job(conn: &Connection, job_id: &str) -> Result<()> {
    conn.execute(
        "UPDATE jobs SET status = 'failed', updated_at = ?2 WHERE id = ?1",
        params![job_id, now()],
    )?;
    Ok(())
}

// ============ Receipts ============

pub fn create_receipt(conn: &Connection, tenant_id: &str, input: &CreateReceipt) -> Result<Receipt> {
    let id = gen_id();
    let now = now();

    conn.execute(
        "INSERT INTO receipts (id, tenant_id, order_key, event_type, platform, payload_json,
             consent_marketing, consent_analytics, is_trusted, hmac_matched, pixel_timestamp,
             event_id, event_name, value, currency, checkout_token_hash, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
        params![
            &id,
            tenant_id,
            &input.order_key,
            &input.event_type,
            input.platform.as_str(),
            &input.payload_json,
            input.consent.marketing.map(i64::from),
            input.consent.analytics.map(i64::from),
            input.is_trusted as i64,
            input.hmac_matched as i64,
            input.pixel_timestamp,
            &input.event_id,
            &input.event_name,
            input.value,
            &input.currency,
            &input.checkout_token_hash,
            now
        ],
    )?;

    Ok(Receipt {
        id,
        tenant_id: tenant_id.to_string(),
        order_key: input.order_key.clone(),
        event_type: input.event_type.clone(),
        platform: input.platform,
        payload_json: input.payload_json.clone(),
        consent: input.consent,
        is_trusted: input.is_trusted,
        hmac_matched: input.hmac_matched,
        pixel_timestamp: input.pixel_timestamp,
        event_id: input.event_id.clone(),
        event_name: input.event_name.clone(),
        value: input.value,
        currency: input.currency.clone(),
        checkout_token_hash: input.checkout_token_hash.clone(),
        created_at: now,
    })
}

/// Primary receipt lookup for consent resolution: any platform's receipt
/// carries the consent snapshot for the commerce event.
pub fn find_receipt_for_order(
    conn: &Connection,
    tenant_id: &str,
    order_key: &str,
    event_type: &str,
) -> Result<Option<Receipt>> {
    query_one(
        conn,
        &format!(
            "SELECT {} FROM receipts
             WHERE tenant_id = ?1 AND order_key = ?2 AND event_type = ?3
             ORDER BY created_at ASC LIMIT 1",
            RECEIPT_COLS
        ),
        &[&tenant_id, &order_key, &event_type],
    )
}

/// Secondary lookup for pre-order events, where the pixel fired before
/// the order id existed.
pub fn find_receipt_by_token_hash(
    conn: &Connection,
    tenant_id: &str,
    token_hash: &str,
) -> Result<Option<Receipt>> {
    query_one(
        conn,
        &format!(
            "SELECT {} FROM receipts
             WHERE tenant_id = ?1 AND checkout_token_hash = ?2
             ORDER BY created_at ASC LIMIT 1",
            RECEIPT_COLS
        ),
        &[&tenant_id, &token_hash],
    )
}

pub fn list_receipts_in_window(
    conn: &Connection,
    tenant_id: &str,
    window_start: i64,
    window_end: i64,
) -> Result<Vec<Receipt>> {
    query_all(
        conn,
        &format!(
            "SELECT {} FROM receipts
             WHERE tenant_id = ?1 AND pixel_timestamp >= ?2 AND pixel_timestamp < ?3
             ORDER BY pixel_timestamp ASC",
            RECEIPT_COLS
        ),
        &[&tenant_id, &window_start, &window_end],
    )
}

// ============ Conversion Logs ============

/// Create a delivery attempt record; a duplicate (tenant, order, platform,
/// event_type) is silently ignored so a re-drained job cannot fan out twice.
pub fn create_conversion_log(conn: &Connection, input: &CreateConversionLog) -> Result<bool> {
    let affected = conn.execute(
        "INSERT OR IGNORE INTO conversion_logs
             (id, tenant_id, order_id, platform, event_type, status, order_value, currency,
              checkout_token_hash, event_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            gen_id(),
            &input.tenant_id,
            &input.order_id,
            input.platform.as_str(),
            &input.event_type,
            input.status.as_ref(),
            input.order_value,
            &input.currency,
            &input.checkout_token_hash,
            &input.event_id,
            now()
        ],
    )?;
    Ok(affected > 0)
}

/// Record a conversion that was refused admission (billing denial) directly
/// as dead_letter. One statement: the record is never observable as pending,
/// so a concurrent delivery scan cannot pick it up. A duplicate
/// (tenant, order, platform, event_type) is silently ignored.
pub fn create_dead_lettered_log(
    conn: &Connection,
    input: &CreateConversionLog,
    reason: &str,
) -> Result<bool> {
    let now = now();
    let affected = conn.execute(
        "INSERT OR IGNORE INTO conversion_logs
             (id, tenant_id, order_id, platform, event_type, status, order_value, currency,
              checkout_token_hash, error_message, created_at, dead_lettered_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 'dead_letter', ?6, ?7, ?8, ?9, ?10, ?10)",
        params![
            gen_id(),
            &input.tenant_id,
            &input.order_id,
            input.platform.as_str(),
            &input.event_type,
            input.order_value,
            &input.currency,
            &input.checkout_token_hash,
            reason,
            now
        ],
    )?;
    Ok(affected > 0)
}

pub fn get_conversion_log(
    conn: &Connection,
    tenant_id: &str,
    order_id: &str,
    platform: Platform,
    event_type: &str,
) -> Result<Option<ConversionLog>> {
    query_one(
        conn,
        &format!(
            "SELECT {} FROM conversion_logs
             WHERE tenant_id = ?1 AND order_id = ?2 AND platform = ?3 AND event_type = ?4",
            CONVERSION_LOG_COLS
        ),
        &[&tenant_id, &order_id, &platform.as_str(), &event_type],
    )
}

/// Oldest-first batch of attempts waiting on a consent signal.
pub fn list_pending_consent(conn: &Connection, limit: i64) -> Result<Vec<ConversionLog>> {
    query_all(
        conn,
        &format!(
            "SELECT {} FROM conversion_logs WHERE status = 'pending_consent'
             ORDER BY created_at ASC LIMIT ?1",
            CONVERSION_LOG_COLS
        ),
        &[&limit],
    )
}

/// Attempts ready for delivery: pending, and past any scheduled backoff.
pub fn list_deliverable(conn: &Connection, now_ts: i64, limit: i64) -> Result<Vec<ConversionLog>> {
    query_all(
        conn,
        &format!(
            "SELECT {} FROM conversion_logs
             WHERE status = 'pending' AND (next_retry_at IS NULL OR next_retry_at <= ?1)
             ORDER BY created_at ASC LIMIT ?2",
            CONVERSION_LOG_COLS
        ),
        &[&now_ts, &limit],
    )
}

/// Move a pending_consent attempt to pending. Guarded on the current
/// status so concurrent worker instances resolve each attempt once.
pub fn mark_log_consent_confirmed(
    conn: &Connection,
    log_id: &str,
    consent_source: &str,
) -> Result<bool> {
    let affected = conn.execute(
        "UPDATE conversion_logs SET status = 'pending', consent_source = ?2
         WHERE id = ?1 AND status = 'pending_consent'",
        params![log_id, consent_source],
    )?;
    Ok(affected > 0)
}

/// Terminal transition; `from_status` guards the state machine so a
/// dead-letter happens exactly once.
pub fn dead_letter_log(
    conn: &Connection,
    log_id: &str,
    from_status: DeliveryStatus,
    reason: &str,
) -> Result<bool> {
    let affected = conn.execute(
        "UPDATE conversion_logs SET status = 'dead_letter', error_message = ?3, dead_lettered_at = ?4
         WHERE id = ?1 AND status = ?2",
        params![log_id, from_status.as_ref(), reason, now()],
    )?;
    Ok(affected > 0)
}

pub fn mark_log_sent(conn: &Connection, log_id: &str, destination_event_id: &str) -> Result<bool> {
    let affected = conn.execute(
        "UPDATE conversion_logs SET status = 'sent', event_id = ?2, sent_at = ?3, error_message = NULL
         WHERE id = ?1 AND status = 'pending'",
        params![log_id, destination_event_id, now()],
    )?;
    Ok(affected > 0)
}

/// Record a transient delivery failure and schedule the retry. The
/// attempt stays pending; dead-lettering on retry exhaustion is the
/// worker's decision.
pub fn record_delivery_failure(
    conn: &Connection,
    log_id: &str,
    error: &str,
    next_retry_at: i64,
) -> Result<()> {
    conn.execute(
        "UPDATE conversion_logs SET attempts = attempts + 1, error_message = ?2, next_retry_at = ?3
         WHERE id = ?1",
        params![log_id, error, next_retry_at],
    )?;
    Ok(())
}

/// Destination-side dedup check for the verification engine.
pub fn delivered_event_id_exists(
    conn: &Connection,
    tenant_id: &str,
    platform: Platform,
    event_id: &str,
) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM conversion_logs
         WHERE tenant_id = ?1 AND platform = ?2 AND event_id = ?3 AND status = 'sent'",
        params![tenant_id, platform.as_str(), event_id],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

// ============ Cron Singleton Lock ============

/// Remove lock rows held past the staleness TTL so a crashed worker
/// cannot wedge the schedule forever. Runs before every acquisition.
pub fn sweep_stale_locks(conn: &Connection, ttl_secs: i64) -> Result<usize> {
    let cutoff = now() - ttl_secs;
    let deleted = conn.execute(
        "DELETE FROM webhook_events
         WHERE tenant_id = ?1 AND topic = ?2 AND received_at < ?3",
        params![SYSTEM_TENANT, CRON_LOCK_TOPIC, cutoff],
    )?;
    Ok(deleted)
}

/// Acquire the singleton lock for a scheduled task by racing on the
/// idempotency table's unique key. Losing the race is a no-op skip.
pub fn try_acquire_cron_lock(conn: &Connection, lock_type: &str) -> Result<bool> {
    let affected = conn.execute(
        "INSERT OR IGNORE INTO webhook_events (id, tenant_id, webhook_id, topic, status, received_at)
         VALUES (?1, ?2, ?3, ?4, 'processing', ?5)",
        params![gen_id(), SYSTEM_TENANT, lock_type, CRON_LOCK_TOPIC, now()],
    )?;
    Ok(affected > 0)
}

pub fn release_cron_lock(conn: &Connection, lock_type: &str) -> Result<()> {
    conn.execute(
        "DELETE FROM webhook_events WHERE tenant_id = ?1 AND webhook_id = ?2 AND topic = ?3",
        params![SYSTEM_TENANT, lock_type, CRON_LOCK_TOPIC],
    )?;
    Ok(())
}

// ============ Verification Runs ============

pub fn create_verification_run(
    conn: &Connection,
    run_id: &str,
    input: &CreateVerificationRun,
) -> Result<VerificationRun> {
    let now = now();
    let platforms = serde_json::to_string(&input.platforms)?;

    conn.execute(
        "INSERT INTO verification_runs (id, tenant_id, status, platforms, window_start, window_end, created_at)
         VALUES (?1, ?2, 'pending', ?3, ?4, ?5, ?6)",
        params![run_id, &input.tenant_id, &platforms, input.window_start, input.window_end, now],
    )?;

    Ok(VerificationRun {
        id: run_id.to_string(),
        tenant_id: input.tenant_id.clone(),
        status: RunStatus::Pending,
        platforms: input.platforms.clone(),
        window_start: input.window_start,
        window_end: input.window_end,
        summary: VerificationSummary::default(),
        events: Vec::new(),
        error: None,
        created_at: now,
        completed_at: None,
    })
}

pub fn get_verification_run(conn: &Connection, run_id: &str) -> Result<Option<VerificationRun>> {
    query_one(
        conn,
        &format!("SELECT {} FROM verification_runs WHERE id = ?1", VERIFICATION_RUN_COLS),
        &[&run_id],
    )
}

/// Claim a pending run for analysis; the status guard keeps a run from
/// being analyzed twice.
pub fn try_start_verification_run(conn: &Connection, run_id: &str) -> Result<bool> {
    let affected = conn.execute(
        "UPDATE verification_runs SET status = 'running' WHERE id = ?1 AND status = 'pending'",
        params![run_id],
    )?;
    Ok(affected > 0)
}

pub fn complete_verification_run(
    conn: &Connection,
    run_id: &str,
    summary: &VerificationSummary,
    events: &[VerificationEvent],
) -> Result<()> {
    let events_json = serde_json::to_string(events)?;
    conn.execute(
        "UPDATE verification_runs SET status = 'completed',
             total_tests = ?2, passed_tests = ?3, failed_tests = ?4, missing_param_tests = ?5,
             deduplicated_events = ?6, parameter_completeness = ?7, value_accuracy = ?8,
             events = ?9, completed_at = ?10
         WHERE id = ?1 AND status = 'running'",
        params![
            run_id,
            summary.total_tests,
            summary.passed_tests,
            summary.failed_tests,
            summary.missing_param_tests,
            summary.deduplicated_events,
            summary.parameter_completeness,
            summary.value_accuracy,
            &events_json,
            now()
        ],
    )?;
    Ok(())
}

pub fn fail_verification_run(conn: &Connection, run_id: &str, error: &str) -> Result<()> {
    conn.execute(
        "UPDATE verification_runs SET status = 'failed', error = ?2, completed_at = ?3
         WHERE id = ?1 AND status IN ('pending', 'running')",
        params![run_id, error, now()],
    )?;
    Ok(())
}

// ============ Strategy helper ============

/// Initial delivery status for a fan-out under a tenant's strategy: weak
/// needs no client signal, everything else waits on a receipt.
pub fn initial_delivery_status(strategy: ConsentStrategy) -> DeliveryStatus {
    match strategy {
        ConsentStrategy::Weak => DeliveryStatus::Pending,
        ConsentStrategy::Strict | ConsentStrategy::Balanced => DeliveryStatus::PendingConsent,
    }
}
