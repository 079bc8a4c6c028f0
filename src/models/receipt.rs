use serde::{Deserialize, Serialize};

use crate::consent::ConsentState;
use crate::platforms::Platform;

/// A client-observed record that a tracking pixel fired for a commerce
/// event. Immutable once written.
///
/// Identity is (tenant, order_key, event_type) but deliberately NOT
/// unique across platforms: every destination pixel observes the same
/// commerce event independently, so aggregates must dedupe by order_key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Receipt {
    pub id: String,
    pub tenant_id: String,
    /// Stable dedup key: the order id, or a hashed checkout token for
    /// pre-order events.
    pub order_key: String,
    pub event_type: String,
    pub platform: Platform,
    pub payload_json: String,
    pub consent: ConsentState,
    /// True when the pixel was loaded from a verified storefront context.
    pub is_trusted: bool,
    /// True when the pixel payload's HMAC matched the tenant secret.
    pub hmac_matched: bool,
    pub pixel_timestamp: i64,
    /// Client-side event id, used for destination-side dedup.
    pub event_id: Option<String>,
    pub event_name: Option<String>,
    pub value: Option<f64>,
    pub currency: Option<String>,
    /// Secondary lookup key for pre-order events.
    pub checkout_token_hash: Option<String>,
    pub created_at: i64,
}

/// Payload accepted by the pixel ingestion endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateReceipt {
    pub order_key: String,
    pub event_type: String,
    pub platform: Platform,
    pub payload_json: String,
    #[serde(default)]
    pub consent: ConsentState,
    #[serde(default)]
    pub is_trusted: bool,
    #[serde(default)]
    pub hmac_matched: bool,
    pub pixel_timestamp: i64,
    pub event_id: Option<String>,
    pub event_name: Option<String>,
    pub value: Option<f64>,
    pub currency: Option<String>,
    pub checkout_token_hash: Option<String>,
}
