//! Shared helpers: order-key derivation, order payload parsing, and
//! monetary comparison.

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{AppError, Result};

/// Monetary tolerance for value comparisons. Divergence beyond this is a
/// consistency issue, never silently corrected.
pub const MONEY_EPSILON: f64 = 0.01;

/// Derive the stable dedup key for a commerce transaction.
///
/// Uses the order id when known; pre-order events (the order id does not
/// exist yet) fall back to a hash of the checkout token.
pub fn order_key(order_id: Option<&str>, checkout_token: Option<&str>) -> Option<String> {
    match (order_id, checkout_token) {
        (Some(id), _) if !id.is_empty() => Some(id.to_string()),
        (_, Some(token)) if !token.is_empty() => Some(checkout_token_hash(token)),
        _ => None,
    }
}

/// Hash a checkout token into the pre-order lookup key.
pub fn checkout_token_hash(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    format!("ct_{}", hex::encode(&digest[..16]))
}

/// Whether two monetary values agree within [`MONEY_EPSILON`].
pub fn money_eq(a: f64, b: f64) -> bool {
    (a - b).abs() <= MONEY_EPSILON
}

/// Generate a client-side event id for destination dedup.
/// Prefixed to avoid collision with destination-issued ids.
pub fn gen_event_id() -> String {
    format!("px_evt_{}", Uuid::new_v4().simple())
}

/// Generate a verification run id.
pub fn gen_run_id() -> String {
    format!("px_run_{}", Uuid::new_v4().simple())
}

/// Order fields extracted from the raw commerce platform payload.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderSummary {
    pub order_id: String,
    pub value: f64,
    pub currency: String,
    pub checkout_token: Option<String>,
}

/// Parse the upstream order webhook payload.
///
/// Only the fields the pipeline needs are pulled out; the raw payload is
/// retained verbatim on the job for anything else.
pub fn parse_order_payload(payload: &str) -> Result<OrderSummary> {
    let value: serde_json::Value = serde_json::from_str(payload)?;

    let order_id = value
        .get("id")
        .and_then(|v| {
            v.as_str()
                .map(String::from)
                .or_else(|| v.as_i64().map(|n| n.to_string()))
        })
        .ok_or_else(|| AppError::BadRequest("order payload missing id".into()))?;

    let total = value
        .get("total_price")
        .and_then(|v| {
            v.as_f64()
                .or_else(|| v.as_str().and_then(|s| s.parse().ok()))
        })
        .unwrap_or(0.0);

    let currency = value
        .get("currency")
        .and_then(|v| v.as_str())
        .unwrap_or("USD")
        .to_string();

    let checkout_token = value
        .get("checkout_token")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(String::from);

    Ok(OrderSummary { order_id, value: total, currency, checkout_token })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_key_prefers_order_id() {
        assert_eq!(order_key(Some("1001"), Some("tok")), Some("1001".to_string()));
    }

    #[test]
    fn order_key_falls_back_to_token_hash() {
        let key = order_key(None, Some("tok")).unwrap();
        assert!(key.starts_with("ct_"));
        // Same token, same key.
        assert_eq!(key, order_key(None, Some("tok")).unwrap());
    }

    #[test]
    fn order_key_absent_when_nothing_known() {
        assert_eq!(order_key(None, None), None);
        assert_eq!(order_key(Some(""), Some("")), None);
    }

    #[test]
    fn money_eq_tolerates_epsilon() {
        assert!(money_eq(10.00, 10.01));
        assert!(!money_eq(10.00, 9.98));
    }

    #[test]
    fn parses_order_with_string_total() {
        let summary = parse_order_payload(
            r#"{"id": 1001, "total_price": "49.99", "currency": "EUR", "checkout_token": "tok"}"#,
        )
        .unwrap();
        assert_eq!(summary.order_id, "1001");
        assert_eq!(summary.value, 49.99);
        assert_eq!(summary.currency, "EUR");
        assert_eq!(summary.checkout_token.as_deref(), Some("tok"));
    }

    #[test]
    fn rejects_order_without_id() {
        assert!(parse_order_payload(r#"{"total_price": 1.0}"#).is_err());
    }
}
