//! TikTok (Events API) integration.

use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use crate::error::{AppError, Result};

use super::{ConversionEvent, ParsedEvent, Platform};

const EVENTS_ENDPOINT: &str = "https://business-api.tiktok.com/open_api/v1.3/event/track/";

#[derive(Debug, Deserialize)]
struct TikTokCredentials {
    pixel_code: String,
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct TikTokResponse {
    code: i64,
    message: Option<String>,
}

/// TikTok pixel payload: `{"event": "...", "event_id"?, "properties": {...}}`.
pub fn parse_payload(payload: &serde_json::Value) -> Result<ParsedEvent> {
    let event_name = payload
        .get("event")
        .and_then(|v| v.as_str())
        .ok_or_else(|| AppError::BadRequest("tiktok payload missing event".into()))?
        .to_string();

    let props = payload.get("properties").cloned().unwrap_or_else(|| json!({}));

    Ok(ParsedEvent {
        platform: Platform::TikTok,
        event_name,
        event_id: payload
            .get("event_id")
            .and_then(|v| v.as_str())
            .map(String::from),
        order_id: props
            .get("order_id")
            .and_then(|v| v.as_str())
            .map(String::from),
        value: props.get("value").and_then(|v| v.as_f64()),
        currency: props
            .get("currency")
            .and_then(|v| v.as_str())
            .map(String::from),
    })
}

pub async fn send_conversion(
    client: &Client,
    credentials: &serde_json::Value,
    event: &ConversionEvent,
) -> Result<String> {
    let creds: TikTokCredentials = serde_json::from_value(credentials.clone())
        .map_err(|e| AppError::Delivery(format!("invalid tiktok credentials: {}", e)))?;

    let body = json!({
        "pixel_code": creds.pixel_code,
        "event": event.event_type,
        "event_id": event.event_id,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "properties": {
            "order_id": event.order_id,
            "value": event.value,
            "currency": event.currency,
        }
    });

    let response = client
        .post(EVENTS_ENDPOINT)
        .header("Access-Token", &creds.access_token)
        .json(&body)
        .send()
        .await
        .map_err(|e| AppError::Delivery(format!("tiktok API error: {}", e)))?;

    if !response.status().is_success() {
        let status = response.status();
        let error_text = response.text().await.unwrap_or_default();
        return Err(AppError::Delivery(format!(
            "tiktok API returned {}: {}",
            status, error_text
        )));
    }

    let ack: TikTokResponse = response
        .json()
        .await
        .map_err(|e| AppError::Delivery(format!("failed to parse tiktok response: {}", e)))?;

    // TikTok signals application-level failure in the body, not the status.
    if ack.code != 0 {
        return Err(AppError::Delivery(format!(
            "tiktok API error code {}: {}",
            ack.code,
            ack.message.unwrap_or_default()
        )));
    }

    Ok(event.event_id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_events_api_payload() {
        let payload = json!({
            "event": "CompletePayment",
            "event_id": "evt_3",
            "properties": {"order_id": "1001", "value": 25.5, "currency": "GBP"}
        });
        let parsed = parse_payload(&payload).unwrap();
        assert_eq!(parsed.event_name, "CompletePayment");
        assert_eq!(parsed.value, Some(25.5));
    }

    #[test]
    fn rejects_payload_without_event() {
        assert!(parse_payload(&json!({"properties": {}})).is_err());
    }
}
