//! Google (GA4 Measurement Protocol) integration.

use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use crate::error::{AppError, Result};

use super::{ConversionEvent, ParsedEvent, Platform};

const MEASUREMENT_ENDPOINT: &str = "https://www.google-analytics.com/mp/collect";

#[derive(Debug, Deserialize)]
struct GoogleCredentials {
    measurement_id: String,
    api_secret: String,
}

/// gtag pixel payload: `{"name": "...", "event_id"?, "params": {...}}`.
pub fn parse_payload(payload: &serde_json::Value) -> Result<ParsedEvent> {
    let event_name = payload
        .get("name")
        .and_then(|v| v.as_str())
        .ok_or_else(|| AppError::BadRequest("google payload missing event name".into()))?
        .to_string();

    let params = payload.get("params").cloned().unwrap_or_else(|| json!({}));

    Ok(ParsedEvent {
        platform: Platform::Google,
        event_name,
        event_id: payload
            .get("event_id")
            .and_then(|v| v.as_str())
            .map(String::from),
        order_id: params
            .get("transaction_id")
            .and_then(|v| v.as_str())
            .map(String::from),
        value: params.get("value").and_then(|v| v.as_f64()),
        currency: params
            .get("currency")
            .and_then(|v| v.as_str())
            .map(String::from),
    })
}

/// Deliver a purchase event via the Measurement Protocol.
///
/// GA4 returns 204 with no body; the client-generated event id is the
/// dedup handle on the destination side, so it doubles as the ack id.
pub async fn send_conversion(
    client: &Client,
    credentials: &serde_json::Value,
    event: &ConversionEvent,
) -> Result<String> {
    let creds: GoogleCredentials = serde_json::from_value(credentials.clone())
        .map_err(|e| AppError::Delivery(format!("invalid google credentials: {}", e)))?;

    let body = json!({
        "client_id": event.event_id,
        "events": [{
            "name": event.event_type,
            "params": {
                "transaction_id": event.order_id,
                "value": event.value,
                "currency": event.currency,
                "event_id": event.event_id,
            }
        }]
    });

    let response = client
        .post(MEASUREMENT_ENDPOINT)
        .query(&[
            ("measurement_id", creds.measurement_id.as_str()),
            ("api_secret", creds.api_secret.as_str()),
        ])
        .json(&body)
        .send()
        .await
        .map_err(|e| AppError::Delivery(format!("google API error: {}", e)))?;

    if !response.status().is_success() {
        let status = response.status();
        let error_text = response.text().await.unwrap_or_default();
        return Err(AppError::Delivery(format!(
            "google API returned {}: {}",
            status, error_text
        )));
    }

    Ok(event.event_id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_gtag_purchase() {
        let payload = json!({
            "name": "purchase",
            "event_id": "evt_1",
            "params": {"transaction_id": "1001", "value": 49.99, "currency": "USD"}
        });
        let parsed = parse_payload(&payload).unwrap();
        assert_eq!(parsed.event_name, "purchase");
        assert_eq!(parsed.order_id.as_deref(), Some("1001"));
        assert_eq!(parsed.value, Some(49.99));
        assert_eq!(parsed.currency.as_deref(), Some("USD"));
    }

    #[test]
    fn rejects_payload_without_name() {
        let payload = json!({"params": {}});
        assert!(parse_payload(&payload).is_err());
    }
}
