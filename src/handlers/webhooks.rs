//! Inbound order webhook endpoint.
//!
//! This is the fast-ack path: signature check, idempotency insert, billing
//! gate, one job upsert, respond. Everything else (consent, platform
//! fan-out, destination calls) belongs to the reconciliation worker. The
//! upstream platform retries on non-2xx, so every business-logic failure
//! past authentication is absorbed into a 200.

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::post,
    Router,
};
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::billing;
use crate::db::{queries, AppState};
use crate::models::{CreateConversionLog, DeliveryStatus, Tenant};
use crate::util::{parse_order_payload, OrderSummary};

type HmacSha256 = Hmac<Sha256>;

pub fn router() -> Router<AppState> {
    Router::new().route("/webhook/orders", post(handle_order_webhook))
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok()).filter(|s| !s.is_empty())
}

/// Verify the platform's HMAC-SHA256 signature (base64 over the raw body).
///
/// Constant-time comparison; a length mismatch leaks nothing since the
/// digest length is fixed.
pub fn verify_webhook_signature(secret: &str, body: &[u8], signature_b64: &str) -> bool {
    let Ok(provided) = base64::engine::general_purpose::STANDARD.decode(signature_b64) else {
        return false;
    };

    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(body);
    let expected = mac.finalize().into_bytes();

    if expected.len() != provided.len() {
        return false;
    }

    expected.as_slice().ct_eq(&provided).into()
}

async fn handle_order_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let conn = match state.db.get() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to get DB connection: {}", e);
            // Transport-layer failure: the upstream platform should retry.
            return (StatusCode::INTERNAL_SERVER_ERROR, "Database unavailable");
        }
    };

    let Some(domain) = header(&headers, "x-tenant-domain") else {
        return (StatusCode::BAD_REQUEST, "Missing x-tenant-domain header");
    };
    let Some(topic) = header(&headers, "x-webhook-topic") else {
        return (StatusCode::BAD_REQUEST, "Missing x-webhook-topic header");
    };
    let Some(signature) = header(&headers, "x-webhook-hmac-sha256") else {
        return (StatusCode::UNAUTHORIZED, "Missing signature header");
    };

    let tenant = match queries::get_tenant_by_domain(&conn, domain) {
        Ok(Some(t)) => t,
        Ok(None) => {
            tracing::warn!(domain, "webhook for unknown tenant");
            return (StatusCode::UNAUTHORIZED, "Unknown tenant");
        }
        Err(e) => {
            tracing::error!("DB error: {}", e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "Database error");
        }
    };

    if !verify_webhook_signature(&tenant.webhook_secret, &body, signature) {
        tracing::warn!(domain, topic, "webhook signature verification failed");
        return (StatusCode::UNAUTHORIZED, "Invalid signature");
    }

    // Not every event source guarantees a webhook id; proceed without
    // dedup protection rather than dropping the event.
    let webhook_id = header(&headers, "x-webhook-id");
    if let Some(webhook_id) = webhook_id {
        match queries::record_webhook_if_new(&conn, &tenant.id, webhook_id, topic) {
            Ok(outcome) if !outcome.is_new => {
                tracing::info!(domain, webhook_id, topic, "duplicate webhook suppressed");
                return (StatusCode::OK, "Duplicate");
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!("Failed to record webhook: {}", e);
                return (StatusCode::INTERNAL_SERVER_ERROR, "Database error");
            }
        }
    } else {
        tracing::warn!(domain, topic, "webhook without id, dedup gap");
    }

    if !topic.starts_with("orders/") {
        if let Some(id) = webhook_id {
            let _ = queries::mark_webhook_processed(&conn, &tenant.id, id, topic, None);
        }
        return (StatusCode::OK, "Ignored topic");
    }

    let result = process_order_webhook(&conn, &tenant, &body);

    if let Some(id) = webhook_id {
        let mark = match result {
            Ok(ref order_id) => {
                queries::mark_webhook_processed(&conn, &tenant.id, id, topic, Some(order_id))
            }
            Err(_) => queries::mark_webhook_failed(&conn, &tenant.id, id, topic),
        };
        if let Err(e) = mark {
            tracing::error!("Failed to update webhook status: {}", e);
        }
    }

    match result {
        Ok(_) => (StatusCode::OK, "OK"),
        // Business failures are absorbed: a retry would only duplicate
        // side effects, not fix the payload or the quota.
        Err(msg) => (StatusCode::OK, msg),
    }
}

/// The synchronous slice of order processing: billing gate + job upsert.
///
/// Returns the order id on success, or a static business-failure message
/// (still acknowledged with 200 by the caller).
fn process_order_webhook(
    conn: &rusqlite::Connection,
    tenant: &Tenant,
    body: &Bytes,
) -> std::result::Result<String, &'static str> {
    // Reserve before parsing: the slot is compensated below if the
    // payload turns out to be garbage.
    let decision = match billing::reserve_slot(conn, &tenant.id, tenant.plan) {
        Ok(d) => d,
        Err(e) => {
            tracing::error!("Billing gate error: {}", e);
            return Err("Billing gate unavailable");
        }
    };

    let raw = String::from_utf8_lossy(body);
    let summary = match parse_order_payload(&raw) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(tenant_id = %tenant.id, "malformed order payload: {}", e);
            if decision.allowed {
                if let Err(e) = billing::release_slot(conn, &tenant.id) {
                    tracing::error!("Failed to release billing slot: {}", e);
                }
            }
            return Err("Malformed payload");
        }
    };

    if !decision.allowed {
        let reason = decision
            .reason
            .unwrap_or_else(|| "monthly conversion limit reached".to_string());
        record_billing_denial(conn, tenant, &summary, &reason);
        return Err("Billing limit reached");
    }

    if let Err(e) = queries::upsert_job(
        conn,
        &tenant.id,
        &summary.order_id,
        &raw,
        summary.value,
        &summary.currency,
    ) {
        tracing::error!("Failed to enqueue job: {}", e);
        if let Err(e) = billing::release_slot(conn, &tenant.id) {
            tracing::error!("Failed to release billing slot: {}", e);
        }
        return Err("Enqueue failed");
    }

    tracing::info!(
        tenant_id = %tenant.id,
        order_id = %summary.order_id,
        value = summary.value,
        "order webhook enqueued"
    );

    Ok(summary.order_id)
}

/// A billing denial is recorded as a dead-lettered attempt per enabled
/// destination: terminal, never retried, visible in the delivery log. The
/// record is inserted dead_letter from the start so the delivery scan can
/// never see it as pending.
fn record_billing_denial(
    conn: &rusqlite::Connection,
    tenant: &Tenant,
    summary: &OrderSummary,
    reason: &str,
) {
    for platform in &tenant.platforms {
        let created = queries::create_dead_lettered_log(
            conn,
            &CreateConversionLog {
                tenant_id: tenant.id.clone(),
                order_id: summary.order_id.clone(),
                platform: *platform,
                event_type: "purchase".to_string(),
                status: DeliveryStatus::DeadLetter,
                order_value: summary.value,
                currency: summary.currency.clone(),
                checkout_token_hash: None,
                event_id: None,
            },
            reason,
        );
        if let Err(e) = created {
            tracing::error!("Failed to record billing denial: {}", e);
        }
    }
}
