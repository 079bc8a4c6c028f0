use serde::{Deserialize, Serialize};

/// Monthly usage counter, keyed (tenant_id, year_month).
///
/// Mutated only through the atomic increment-with-ceiling in queries;
/// the reservation is advisory admission control, not a hard invariant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageCounter {
    pub tenant_id: String,
    /// Billing period, formatted `YYYY-MM`.
    pub year_month: String,
    pub current: i64,
    pub usage_limit: i64,
}

/// Snapshot returned to billing gate callers.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct UsageSnapshot {
    pub current: i64,
    pub limit: i64,
}

/// Outcome of a billing gate reservation attempt.
#[derive(Debug, Clone, Serialize)]
pub struct BillingDecision {
    pub allowed: bool,
    pub usage: UsageSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}
