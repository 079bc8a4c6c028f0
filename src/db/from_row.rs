//! Row mapping trait and helpers for reducing boilerplate in queries.

use rusqlite::{Connection, OptionalExtension, Row, ToSql};

use crate::consent::{ConsentState, ConsentStrategy};
use crate::models::*;
use crate::platforms::Platform;

/// Map an invalid stored enum value to a column type error instead of a
/// panic (covers corruption and migration mistakes).
fn invalid_column(col: usize, col_name: &str) -> rusqlite::Error {
    rusqlite::Error::InvalidColumnType(col, col_name.to_string(), rusqlite::types::Type::Text)
}

fn parse_platforms(col: usize, raw: &str) -> rusqlite::Result<Vec<Platform>> {
    serde_json::from_str(raw).map_err(|_| invalid_column(col, "platforms"))
}

/// Trait for constructing a type from a database row.
pub trait FromRow: Sized {
    fn from_row(row: &Row) -> rusqlite::Result<Self>;
}

/// Query for a single optional result.
pub fn query_one<T: FromRow>(
    conn: &Connection,
    sql: &str,
    params: &[&dyn ToSql],
) -> crate::error::Result<Option<T>> {
    conn.query_row(sql, params, T::from_row)
        .optional()
        .map_err(Into::into)
}

/// Query for multiple results.
pub fn query_all<T: FromRow>(
    conn: &Connection,
    sql: &str,
    params: &[&dyn ToSql],
) -> crate::error::Result<Vec<T>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, T::from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ============ SQL SELECT Constants ============

pub const TENANT_COLS: &str =
    "id, domain, plan, consent_strategy, platforms, webhook_secret, credentials, created_at, updated_at";

pub const WEBHOOK_EVENT_COLS: &str =
    "id, tenant_id, webhook_id, topic, status, order_id, received_at, processed_at";

pub const USAGE_COUNTER_COLS: &str = "tenant_id, year_month, current, usage_limit";

pub const JOB_COLS: &str =
    "id, tenant_id, order_id, payload, order_value, currency, status, created_at, updated_at";

pub const RECEIPT_COLS: &str = "id, tenant_id, order_key, event_type, platform, payload_json, \
     consent_marketing, consent_analytics, is_trusted, hmac_matched, pixel_timestamp, \
     event_id, event_name, value, currency, checkout_token_hash, created_at";

pub const CONVERSION_LOG_COLS: &str = "id, tenant_id, order_id, platform, event_type, status, \
     attempts, next_retry_at, error_message, event_id, order_value, currency, \
     checkout_token_hash, consent_source, created_at, sent_at, dead_lettered_at";

pub const VERIFICATION_RUN_COLS: &str = "id, tenant_id, status, platforms, window_start, \
     window_end, total_tests, passed_tests, failed_tests, missing_param_tests, \
     deduplicated_events, parameter_completeness, value_accuracy, events, error, \
     created_at, completed_at";

// ============ FromRow implementations ============

impl FromRow for Tenant {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let plan_raw: String = row.get(2)?;
        let strategy_raw: String = row.get(3)?;
        let platforms_raw: String = row.get(4)?;
        Ok(Tenant {
            id: row.get(0)?,
            domain: row.get(1)?,
            plan: Plan::from_str(&plan_raw).ok_or_else(|| invalid_column(2, "plan"))?,
            consent_strategy: ConsentStrategy::parse(&strategy_raw),
            platforms: parse_platforms(4, &platforms_raw)?,
            webhook_secret: row.get(5)?,
            credentials: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }
}

impl FromRow for IdempotencyRecord {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let status_raw: String = row.get(4)?;
        Ok(IdempotencyRecord {
            id: row.get(0)?,
            tenant_id: row.get(1)?,
            webhook_id: row.get(2)?,
            topic: row.get(3)?,
            status: WebhookStatus::from_str(&status_raw)
                .ok_or_else(|| invalid_column(4, "status"))?,
            order_id: row.get(5)?,
            received_at: row.get(6)?,
            processed_at: row.get(7)?,
        })
    }
}

impl FromRow for UsageCounter {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(UsageCounter {
            tenant_id: row.get(0)?,
            year_month: row.get(1)?,
            current: row.get(2)?,
            usage_limit: row.get(3)?,
        })
    }
}

impl FromRow for Job {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let status_raw: String = row.get(6)?;
        Ok(Job {
            id: row.get(0)?,
            tenant_id: row.get(1)?,
            order_id: row.get(2)?,
            payload: row.get(3)?,
            order_value: row.get(4)?,
            currency: row.get(5)?,
            status: JobStatus::from_str(&status_raw).ok_or_else(|| invalid_column(6, "status"))?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }
}

impl FromRow for Receipt {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let platform_raw: String = row.get(4)?;
        let consent_marketing: Option<i64> = row.get(6)?;
        let consent_analytics: Option<i64> = row.get(7)?;
        Ok(Receipt {
            id: row.get(0)?,
            tenant_id: row.get(1)?,
            order_key: row.get(2)?,
            event_type: row.get(3)?,
            platform: Platform::from_str(&platform_raw)
                .ok_or_else(|| invalid_column(4, "platform"))?,
            payload_json: row.get(5)?,
            consent: ConsentState {
                marketing: consent_marketing.map(|v| v != 0),
                analytics: consent_analytics.map(|v| v != 0),
            },
            is_trusted: row.get::<_, i64>(8)? != 0,
            hmac_matched: row.get::<_, i64>(9)? != 0,
            pixel_timestamp: row.get(10)?,
            event_id: row.get(11)?,
            event_name: row.get(12)?,
            value: row.get(13)?,
            currency: row.get(14)?,
            checkout_token_hash: row.get(15)?,
            created_at: row.get(16)?,
        })
    }
}

impl FromRow for ConversionLog {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let platform_raw: String = row.get(3)?;
        let status_raw: String = row.get(5)?;
        Ok(ConversionLog {
            id: row.get(0)?,
            tenant_id: row.get(1)?,
            order_id: row.get(2)?,
            platform: Platform::from_str(&platform_raw)
                .ok_or_else(|| invalid_column(3, "platform"))?,
            event_type: row.get(4)?,
            status: status_raw
                .parse::<DeliveryStatus>()
                .map_err(|_| invalid_column(5, "status"))?,
            attempts: row.get(6)?,
            next_retry_at: row.get(7)?,
            error_message: row.get(8)?,
            event_id: row.get(9)?,
            order_value: row.get(10)?,
            currency: row.get(11)?,
            checkout_token_hash: row.get(12)?,
            consent_source: row.get(13)?,
            created_at: row.get(14)?,
            sent_at: row.get(15)?,
            dead_lettered_at: row.get(16)?,
        })
    }
}

impl FromRow for VerificationRun {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let status_raw: String = row.get(2)?;
        let platforms_raw: String = row.get(3)?;
        let events_raw: String = row.get(13)?;
        Ok(VerificationRun {
            id: row.get(0)?,
            tenant_id: row.get(1)?,
            status: status_raw
                .parse::<RunStatus>()
                .map_err(|_| invalid_column(2, "status"))?,
            platforms: parse_platforms(3, &platforms_raw)?,
            window_start: row.get(4)?,
            window_end: row.get(5)?,
            summary: VerificationSummary {
                total_tests: row.get(6)?,
                passed_tests: row.get(7)?,
                failed_tests: row.get(8)?,
                missing_param_tests: row.get(9)?,
                deduplicated_events: row.get(10)?,
                parameter_completeness: row.get(11)?,
                value_accuracy: row.get(12)?,
            },
            events: serde_json::from_str(&events_raw)
                .map_err(|_| invalid_column(13, "events"))?,
            error: row.get(14)?,
            created_at: row.get(15)?,
            completed_at: row.get(16)?,
        })
    }
}
