//! Meta (Conversions API) integration.

use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use crate::error::{AppError, Result};

use super::{ConversionEvent, ParsedEvent, Platform};

const GRAPH_API_BASE: &str = "https://graph.facebook.com/v18.0";

#[derive(Debug, Deserialize)]
struct MetaCredentials {
    pixel_id: String,
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct MetaEventResponse {
    #[allow(dead_code)]
    events_received: Option<i64>,
    fbtrace_id: Option<String>,
}

/// Meta pixel payload: `{"event_name": "...", "event_id"?, "custom_data": {...}}`.
pub fn parse_payload(payload: &serde_json::Value) -> Result<ParsedEvent> {
    let event_name = payload
        .get("event_name")
        .and_then(|v| v.as_str())
        .ok_or_else(|| AppError::BadRequest("meta payload missing event_name".into()))?
        .to_string();

    let custom = payload.get("custom_data").cloned().unwrap_or_else(|| json!({}));

    Ok(ParsedEvent {
        platform: Platform::Meta,
        event_name,
        event_id: payload
            .get("event_id")
            .and_then(|v| v.as_str())
            .map(String::from),
        order_id: custom
            .get("order_id")
            .and_then(|v| v.as_str())
            .map(String::from),
        value: custom.get("value").and_then(|v| v.as_f64()),
        currency: custom
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
    let creds: MetaCredentials = serde_json::from_value(credentials.clone())
        .map_err(|e| AppError::Delivery(format!("invalid meta credentials: {}", e)))?;

    let body = json!({
        "data": [{
            "event_name": event.event_type,
            "event_time": chrono::Utc::now().timestamp(),
            "event_id": event.event_id,
            "action_source": "website",
            "custom_data": {
                "order_id": event.order_id,
                "value": event.value,
                "currency": event.currency,
            }
        }]
    });

    let response = client
        .post(format!("{}/{}/events", GRAPH_API_BASE, creds.pixel_id))
        .query(&[("access_token", creds.access_token.as_str())])
        .json(&body)
        .send()
        .await
        .map_err(|e| AppError::Delivery(format!("meta API error: {}", e)))?;

    if !response.status().is_success() {
        let status = response.status();
        let error_text = response.text().await.unwrap_or_default();
        return Err(AppError::Delivery(format!(
            "meta API returned {}: {}",
            status, error_text
        )));
    }

    let ack: MetaEventResponse = response
        .json()
        .await
        .map_err(|e| AppError::Delivery(format!("failed to parse meta response: {}", e)))?;

    // Prefer Meta's trace id; the event id we sent is the dedup key either way.
    Ok(ack.fbtrace_id.unwrap_or_else(|| event.event_id.clone()))
}
