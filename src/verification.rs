//! Verification engine: scores delivered pixel events against
//! authoritative order records.
//!
//! A run joins receipts, the delivery log, and order truth (the retained
//! job rows) over a time window into an immutable scored report.

use rusqlite::Connection;

use crate::db::queries;
use crate::error::{AppError, Result};
use crate::models::{
    CreateVerificationRun, TestStatus, VerificationEvent, VerificationRun, VerificationSummary,
};
use crate::models::Receipt;
use crate::platforms::Platform;
use crate::util::{gen_run_id, money_eq};

/// Event types treated as purchase-like across platform vocabularies.
pub fn is_purchase_like(event_type: &str) -> bool {
    matches!(
        event_type.to_ascii_lowercase().as_str(),
        "purchase" | "checkout_completed" | "completepayment"
    )
}

pub fn create_run(conn: &Connection, input: &CreateVerificationRun) -> Result<VerificationRun> {
    if input.window_end <= input.window_start {
        return Err(AppError::BadRequest("window_end must be after window_start".into()));
    }
    queries::get_tenant_by_id(conn, &input.tenant_id)?
        .ok_or_else(|| AppError::NotFound("unknown tenant".into()))?;

    queries::create_verification_run(conn, &gen_run_id(), input)
}

/// Claim and execute a pending run. The pending→running guard means a run
/// is analyzed at most once; completed runs are immutable.
pub fn start_run(conn: &Connection, run_id: &str) -> Result<VerificationRun> {
    let run = queries::get_verification_run(conn, run_id)?
        .ok_or_else(|| AppError::NotFound(format!("verification run {}", run_id)))?;

    if !queries::try_start_verification_run(conn, run_id)? {
        return Err(AppError::Conflict(format!(
            "run {} is not pending (status: {})",
            run_id,
            run.status.as_ref()
        )));
    }

    match analyze(conn, &run.tenant_id, run.window_start, run.window_end, &run.platforms) {
        Ok((summary, events)) => {
            queries::complete_verification_run(conn, run_id, &summary, &events)?;
            tracing::info!(
                run_id,
                total = summary.total_tests,
                passed = summary.passed_tests,
                completeness = summary.parameter_completeness,
                accuracy = summary.value_accuracy,
                "verification run completed"
            );
        }
        Err(e) => {
            queries::fail_verification_run(conn, run_id, &e.to_string())?;
            return Err(e);
        }
    }

    queries::get_verification_run(conn, run_id)?
        .ok_or_else(|| AppError::Internal("run vanished after completion".into()))
}

/// Classify every receipt in the window and aggregate the summary metrics.
pub fn analyze(
    conn: &Connection,
    tenant_id: &str,
    window_start: i64,
    window_end: i64,
    platforms: &[Platform],
) -> Result<(VerificationSummary, Vec<VerificationEvent>)> {
    let receipts = queries::list_receipts_in_window(conn, tenant_id, window_start, window_end)?;

    let mut events = Vec::new();
    let mut accurate_comparisons = 0i64;
    let mut comparisons_attempted = 0i64;

    for receipt in &receipts {
        if !platforms.contains(&receipt.platform) {
            continue;
        }
        let (event, comparison) = classify_receipt(conn, receipt)?;
        if let Some(accurate) = comparison {
            comparisons_attempted += 1;
            if accurate {
                accurate_comparisons += 1;
            }
        }
        events.push(event);
    }

    let summary = summarize(&events, accurate_comparisons, comparisons_attempted);
    Ok((summary, events))
}

/// Returns the classified event plus, when an order record existed to
/// compare against, whether the reported value matched it.
fn classify_receipt(
    conn: &Connection,
    receipt: &Receipt,
) -> Result<(VerificationEvent, Option<bool>)> {
    let event_name = receipt
        .event_name
        .clone()
        .unwrap_or_else(|| receipt.event_type.clone());

    let mut event = VerificationEvent {
        receipt_id: receipt.id.clone(),
        platform: receipt.platform,
        event_name,
        status: TestStatus::Success,
        discrepancies: Vec::new(),
        consistency_issues: Vec::new(),
        value: receipt.value,
        currency: receipt.currency.clone(),
    };

    if !is_purchase_like(&receipt.event_type) {
        // Non-purchase events only need a minimal identity.
        if receipt.event_id.is_none() {
            event.discrepancies.push("missing event_id".to_string());
        }
        if receipt.event_name.is_none() {
            event.discrepancies.push("missing event_name".to_string());
        }
        if !event.discrepancies.is_empty() {
            event.status = TestStatus::MissingParams;
        }
        return Ok((event, None));
    }

    if receipt.value.is_none() {
        event.discrepancies.push("missing value".to_string());
    }
    if receipt.currency.is_none() {
        event.discrepancies.push("missing currency".to_string());
    }
    if !event.discrepancies.is_empty() {
        event.status = TestStatus::MissingParams;
        return Ok((event, None));
    }

    // An event id the destination already acknowledged means the pixel
    // and the server-side delivery met: expected, not an error.
    if let Some(event_id) = &receipt.event_id {
        if queries::delivered_event_id_exists(conn, &receipt.tenant_id, receipt.platform, event_id)?
        {
            event.status = TestStatus::Deduplicated;
            return Ok((event, None));
        }
    }

    // Cross-check against order truth when it exists. Absence of ground
    // truth is not a failure, and a mismatch is flagged without failing.
    let mut comparison = None;
    if let Some(job) = queries::get_job(conn, &receipt.tenant_id, &receipt.order_key)? {
        let value = receipt.value.unwrap_or(0.0);
        comparison = Some(true);
        if !money_eq(value, job.order_value) {
            comparison = Some(false);
            event.consistency_issues.push(format!(
                "value mismatch: pixel reported {:.2}, order total is {:.2}",
                value, job.order_value
            ));
        }
        if let Some(currency) = &receipt.currency {
            if !currency.eq_ignore_ascii_case(&job.currency) {
                comparison = Some(false);
                event.consistency_issues.push(format!(
                    "currency mismatch: pixel reported {}, order is {}",
                    currency, job.currency
                ));
            }
        }
    }

    Ok((event, comparison))
}

fn summarize(
    events: &[VerificationEvent],
    accurate_comparisons: i64,
    comparisons_attempted: i64,
) -> VerificationSummary {
    let mut summary = VerificationSummary::default();

    for event in events {
        match event.status {
            TestStatus::Deduplicated => {
                summary.deduplicated_events += 1;
                continue;
            }
            TestStatus::Success => summary.passed_tests += 1,
            TestStatus::MissingParams => summary.missing_param_tests += 1,
            TestStatus::Failed => summary.failed_tests += 1,
        }
        summary.total_tests += 1;
    }

    if summary.total_tests > 0 {
        summary.parameter_completeness = (summary.passed_tests + summary.missing_param_tests)
            as f64
            / summary.total_tests as f64;
    }
    summary.value_accuracy = if comparisons_attempted > 0 {
        accurate_comparisons as f64 / comparisons_attempted as f64
    } else {
        // No ground truth to compare against is not a failure.
        1.0
    };

    summary
}

/// Revenue aggregate over deduplicated commerce events.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct RevenueSummary {
    /// Distinct commerce transactions (groups, not receipt rows).
    pub order_count: i64,
    /// Sum of the per-group maximum reported value.
    pub total_value: f64,
    /// Receipts whose value diverged from their group maximum by more
    /// than the monetary tolerance (partial/truncated payloads).
    pub flagged_receipts: Vec<String>,
}

/// Dedupe receipts by order key before summing revenue.
///
/// A single commerce event legitimately produces one receipt per
/// destination pixel, so orders are counted as groups and each group
/// contributes its maximum reported value (truncated payloads undercount;
/// the maximum is the best observation).
pub fn dedupe_revenue(receipts: &[Receipt]) -> RevenueSummary {
    use std::collections::BTreeMap;

    let mut groups: BTreeMap<&str, f64> = BTreeMap::new();
    for receipt in receipts {
        let value = receipt.value.unwrap_or(0.0);
        let entry = groups.entry(receipt.order_key.as_str()).or_insert(value);
        if value > *entry {
            *entry = value;
        }
    }

    let mut flagged = Vec::new();
    for receipt in receipts {
        if let Some(value) = receipt.value {
            let max = groups[receipt.order_key.as_str()];
            if !money_eq(value, max) {
                flagged.push(receipt.id.clone());
            }
        }
    }

    RevenueSummary {
        order_count: groups.len() as i64,
        total_value: groups.values().sum(),
        flagged_receipts: flagged,
    }
}

/// Windowed revenue report for one tenant: purchase-like, deduped.
pub fn revenue_report(
    conn: &Connection,
    tenant_id: &str,
    window_start: i64,
    window_end: i64,
) -> Result<RevenueSummary> {
    let receipts = queries::list_receipts_in_window(conn, tenant_id, window_start, window_end)?;
    let purchases: Vec<Receipt> = receipts
        .into_iter()
        .filter(|r| is_purchase_like(&r.event_type))
        .collect();
    Ok(dedupe_revenue(&purchases))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consent::ConsentState;

    fn receipt(id: &str, order_key: &str, platform: Platform, value: Option<f64>) -> Receipt {
        Receipt {
            id: id.to_string(),
            tenant_id: "tnt_test".to_string(),
            order_key: order_key.to_string(),
            event_type: "purchase".to_string(),
            platform,
            payload_json: "{}".to_string(),
            consent: ConsentState::default(),
            is_trusted: true,
            hmac_matched: true,
            pixel_timestamp: 1_700_000_000,
            event_id: Some(format!("evt_{}", id)),
            event_name: Some("purchase".to_string()),
            value,
            currency: Some("USD".to_string()),
            checkout_token_hash: None,
            created_at: 1_700_000_000,
        }
    }

    #[test]
    fn purchase_vocabulary_spans_platforms() {
        assert!(is_purchase_like("purchase"));
        assert!(is_purchase_like("Purchase"));
        assert!(is_purchase_like("checkout_completed"));
        assert!(is_purchase_like("CompletePayment"));
        assert!(!is_purchase_like("page_view"));
        assert!(!is_purchase_like("add_to_cart"));
    }

    #[test]
    fn revenue_counts_orders_not_receipts() {
        let receipts = vec![
            receipt("r1", "1001", Platform::Google, Some(10.00)),
            receipt("r2", "1001", Platform::Meta, Some(10.00)),
            receipt("r3", "1001", Platform::TikTok, Some(9.99)),
        ];

        let summary = dedupe_revenue(&receipts);
        assert_eq!(summary.order_count, 1);
        assert!((summary.total_value - 10.00).abs() < 1e-9);
    }

    #[test]
    fn revenue_flags_truncated_reports() {
        let receipts = vec![
            receipt("r1", "1001", Platform::Google, Some(50.00)),
            receipt("r2", "1001", Platform::Meta, Some(49.50)),
        ];

        let summary = dedupe_revenue(&receipts);
        assert_eq!(summary.flagged_receipts, vec!["r2".to_string()]);
    }

    #[test]
    fn revenue_sums_across_distinct_orders() {
        let receipts = vec![
            receipt("r1", "1001", Platform::Google, Some(10.00)),
            receipt("r2", "1002", Platform::Google, Some(25.00)),
            receipt("r3", "1002", Platform::Meta, Some(25.00)),
        ];

        let summary = dedupe_revenue(&receipts);
        assert_eq!(summary.order_count, 2);
        assert!((summary.total_value - 35.00).abs() < 1e-9);
        assert!(summary.flagged_receipts.is_empty());
    }

    fn event(status: TestStatus) -> VerificationEvent {
        VerificationEvent {
            receipt_id: "rcpt".to_string(),
            platform: Platform::Google,
            event_name: "purchase".to_string(),
            status,
            discrepancies: Vec::new(),
            consistency_issues: Vec::new(),
            value: Some(10.0),
            currency: Some("USD".to_string()),
        }
    }

    #[test]
    fn deduplicated_events_are_excluded_from_tallies() {
        let events = vec![
            event(TestStatus::Success),
            event(TestStatus::Deduplicated),
            event(TestStatus::MissingParams),
        ];

        let summary = summarize(&events, 0, 0);
        assert_eq!(summary.total_tests, 2);
        assert_eq!(summary.passed_tests, 1);
        assert_eq!(summary.missing_param_tests, 1);
        assert_eq!(summary.deduplicated_events, 1);
        assert_eq!(summary.failed_tests, 0);
    }

    #[test]
    fn completeness_counts_observed_over_total() {
        let events = vec![
            event(TestStatus::Success),
            event(TestStatus::MissingParams),
            event(TestStatus::Failed),
            event(TestStatus::Failed),
        ];

        let summary = summarize(&events, 0, 0);
        assert!((summary.parameter_completeness - 0.5).abs() < 1e-9);
    }

    #[test]
    fn value_accuracy_defaults_to_one_without_comparisons() {
        let summary = summarize(&[event(TestStatus::Success)], 0, 0);
        assert!((summary.value_accuracy - 1.0).abs() < 1e-9);

        let summary = summarize(&[event(TestStatus::Success)], 3, 4);
        assert!((summary.value_accuracy - 0.75).abs() < 1e-9);
    }
}
