//! Billing gate: atomic check-and-reserve of the monthly conversion quota.
//!
//! Reservation is admission control for the webhook path. A denial is a
//! terminal business outcome recorded on the delivery attempt, never an
//! error response upstream.

use chrono::Utc;
use rusqlite::Connection;

use crate::db::queries;
use crate::error::Result;
use crate::models::{BillingDecision, Plan};

/// Current billing period, formatted `YYYY-MM`.
pub fn current_period() -> String {
    Utc::now().format("%Y-%m").to_string()
}

/// Reserve one conversion slot for the tenant's current billing period.
///
/// Race-safe under concurrent webhook deliveries: the decision is a single
/// conditional UPDATE, never read-then-write.
pub fn reserve_slot(conn: &Connection, tenant_id: &str, plan: Plan) -> Result<BillingDecision> {
    let period = current_period();
    let decision = queries::reserve_usage_slot(conn, tenant_id, &period, plan.monthly_limit())?;

    if !decision.allowed {
        tracing::warn!(
            tenant_id,
            current = decision.usage.current,
            limit = decision.usage.limit,
            "billing gate denied conversion"
        );
    }

    Ok(decision)
}

/// Compensate a reservation made speculatively before a later validation
/// step failed, so denied-but-reserved slots do not leak quota.
pub fn release_slot(conn: &Connection, tenant_id: &str) -> Result<()> {
    let period = current_period();
    queries::release_usage_slot(conn, tenant_id, &period)
}
