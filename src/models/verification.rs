use serde::{Deserialize, Serialize};
use strum::{AsRefStr, EnumString};

use crate::platforms::Platform;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr, EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Classification of a single receipt within a verification run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Success,
    MissingParams,
    /// The destination already acknowledged this event id: expected,
    /// excluded from pass/fail tallies.
    Deduplicated,
    Failed,
}

/// One materialized result row of a verification run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationEvent {
    pub receipt_id: String,
    pub platform: Platform,
    pub event_name: String,
    pub status: TestStatus,
    /// Itemized missing/mismatched parameter reasons.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub discrepancies: Vec<String>,
    /// Value/currency divergence from the authoritative order record.
    /// Flagged, never silently corrected, and never fails the test.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub consistency_issues: Vec<String>,
    pub value: Option<f64>,
    pub currency: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct VerificationSummary {
    pub total_tests: i64,
    pub passed_tests: i64,
    pub failed_tests: i64,
    pub missing_param_tests: i64,
    pub deduplicated_events: i64,
    pub parameter_completeness: f64,
    pub value_accuracy: f64,
}

/// On-demand analysis run; immutable once completed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationRun {
    pub id: String,
    pub tenant_id: String,
    pub status: RunStatus,
    pub platforms: Vec<Platform>,
    pub window_start: i64,
    pub window_end: i64,
    pub summary: VerificationSummary,
    pub events: Vec<VerificationEvent>,
    pub error: Option<String>,
    pub created_at: i64,
    pub completed_at: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateVerificationRun {
    pub tenant_id: String,
    pub platforms: Vec<Platform>,
    pub window_start: i64,
    pub window_end: i64,
}
