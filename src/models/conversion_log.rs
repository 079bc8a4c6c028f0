use serde::{Deserialize, Serialize};
use strum::{AsRefStr, EnumString};

use crate::platforms::Platform;

/// Delivery state machine for one (tenant, order, platform, event_type).
///
/// `pending_consent` waits on a matching receipt; `pending` is ready for
/// delivery (a transient failure stays `pending` with a scheduled
/// `next_retry_at`); `dead_letter` is terminal and never retried (billing
/// denial, consent denial, timeout, or retry exhaustion).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr, EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    PendingConsent,
    Sent,
    DeadLetter,
}

/// Per-destination delivery attempt record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionLog {
    pub id: String,
    pub tenant_id: String,
    pub order_id: String,
    pub platform: Platform,
    pub event_type: String,
    pub status: DeliveryStatus,
    pub attempts: i64,
    pub next_retry_at: Option<i64>,
    pub error_message: Option<String>,
    /// Destination-acknowledged event id, persisted for dedup and audit.
    pub event_id: Option<String>,
    pub order_value: f64,
    pub currency: String,
    /// Secondary receipt lookup key for pre-order events.
    pub checkout_token_hash: Option<String>,
    /// Where the consent signal came from when the attempt left
    /// pending_consent (e.g. "client_confirmed").
    pub consent_source: Option<String>,
    pub created_at: i64,
    pub sent_at: Option<i64>,
    pub dead_lettered_at: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct CreateConversionLog {
    pub tenant_id: String,
    pub order_id: String,
    pub platform: Platform,
    pub event_type: String,
    pub status: DeliveryStatus,
    pub order_value: f64,
    pub currency: String,
    pub checkout_token_hash: Option<String>,
    /// Dedup event id assigned at fan-out so every delivery attempt for
    /// this record carries the same id. Replaced by the
    /// destination-acknowledged id once the send succeeds.
    pub event_id: Option<String>,
}
