//! Pixel receipt ingestion.
//!
//! A thin, rate-limited public endpoint that records what the browser
//! observed. The core pipeline only ever reads receipts; everything here
//! is a single insert.

use axum::{extract::State, routing::post, Json, Router};
use serde::{Deserialize, Serialize};

use crate::consent::ConsentState;
use crate::db::{queries, AppState};
use crate::error::{AppError, Result};
use crate::models::CreateReceipt;
use crate::platforms::{self, Platform};
use crate::rate_limit;
use crate::util::{checkout_token_hash, order_key};

#[derive(Debug, Deserialize)]
pub struct PixelEventRequest {
    pub tenant_domain: String,
    pub platform: Platform,
    pub event_type: String,
    /// Raw platform-specific pixel payload, retained verbatim.
    pub payload: serde_json::Value,
    pub order_id: Option<String>,
    pub checkout_token: Option<String>,
    #[serde(default)]
    pub consent: ConsentState,
    #[serde(default)]
    pub is_trusted: bool,
    #[serde(default)]
    pub hmac_matched: bool,
    pub pixel_timestamp: Option<i64>,
    pub value: Option<f64>,
    pub currency: Option<String>,
    pub event_id: Option<String>,
    pub event_name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PixelEventResponse {
    pub receipt_id: String,
}

pub fn router(rate_limit_rpm: u32) -> Router<AppState> {
    Router::new()
        .route("/pixel/events", post(ingest_pixel_event))
        .layer(rate_limit::pixel_layer(rate_limit_rpm))
}

async fn ingest_pixel_event(
    State(state): State<AppState>,
    Json(req): Json<PixelEventRequest>,
) -> Result<Json<PixelEventResponse>> {
    let conn = state.db.get()?;

    let tenant = queries::get_tenant_by_domain(&conn, &req.tenant_domain)?
        .ok_or_else(|| AppError::NotFound("unknown tenant".into()))?;

    // The raw payload backfills whatever the envelope left out. A payload
    // the parser cannot read is still recorded verbatim.
    let parsed = platforms::parse(req.platform, &req.payload).ok();

    let order_id = req
        .order_id
        .or_else(|| parsed.as_ref().and_then(|p| p.order_id.clone()));
    let order_key = order_key(order_id.as_deref(), req.checkout_token.as_deref())
        .ok_or_else(|| {
            AppError::BadRequest("event carries neither order_id nor checkout_token".into())
        })?;

    let receipt = queries::create_receipt(
        &conn,
        &tenant.id,
        &CreateReceipt {
            order_key,
            event_type: req.event_type,
            platform: req.platform,
            payload_json: req.payload.to_string(),
            consent: req.consent,
            is_trusted: req.is_trusted,
            hmac_matched: req.hmac_matched,
            pixel_timestamp: req
                .pixel_timestamp
                .unwrap_or_else(|| chrono::Utc::now().timestamp()),
            event_id: req
                .event_id
                .or_else(|| parsed.as_ref().and_then(|p| p.event_id.clone())),
            event_name: req
                .event_name
                .or_else(|| parsed.as_ref().map(|p| p.event_name.clone())),
            value: req.value.or_else(|| parsed.as_ref().and_then(|p| p.value)),
            currency: req
                .currency
                .or_else(|| parsed.as_ref().and_then(|p| p.currency.clone())),
            checkout_token_hash: req.checkout_token.as_deref().map(checkout_token_hash),
        },
    )?;

    tracing::debug!(
        tenant_id = %tenant.id,
        receipt_id = %receipt.id,
        platform = %receipt.platform.as_str(),
        "pixel receipt recorded"
    );

    Ok(Json(PixelEventResponse { receipt_id: receipt.id }))
}
