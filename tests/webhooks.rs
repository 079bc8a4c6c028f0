//! Webhook authentication and idempotency tests

mod common;

use base64::Engine;
use common::*;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use pixelgate::handlers::webhooks::verify_webhook_signature;

fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(body);
    base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
}

#[test]
fn valid_signature_verifies() {
    let body = br#"{"id": 1001, "total_price": "49.99"}"#;
    let signature = sign("test-webhook-secret", body);
    assert!(verify_webhook_signature("test-webhook-secret", body, &signature));
}

#[test]
fn tampered_body_fails_verification() {
    let body = br#"{"id": 1001, "total_price": "49.99"}"#;
    let signature = sign("test-webhook-secret", body);
    let tampered = br#"{"id": 1001, "total_price": "9999.99"}"#;
    assert!(!verify_webhook_signature("test-webhook-secret", tampered, &signature));
}

#[test]
fn wrong_secret_fails_verification() {
    let body = br#"{"id": 1001}"#;
    let signature = sign("other-secret", body);
    assert!(!verify_webhook_signature("test-webhook-secret", body, &signature));
}

#[test]
fn garbage_signature_fails_verification() {
    let body = br#"{"id": 1001}"#;
    assert!(!verify_webhook_signature("test-webhook-secret", body, "not-base64!!!"));
    assert!(!verify_webhook_signature("test-webhook-secret", body, ""));
}

#[test]
fn duplicate_webhook_id_is_detected() {
    let conn = setup_test_db();
    let tenant = create_test_tenant(&conn, "shop.example.com");

    let first = queries::record_webhook_if_new(&conn, &tenant.id, "wh-123", "orders/create")
        .expect("first record");
    assert!(first.is_new);

    let second = queries::record_webhook_if_new(&conn, &tenant.id, "wh-123", "orders/create")
        .expect("second record");
    assert!(!second.is_new);
}

#[test]
fn same_webhook_id_different_topic_is_new() {
    let conn = setup_test_db();
    let tenant = create_test_tenant(&conn, "shop.example.com");

    assert!(queries::record_webhook_if_new(&conn, &tenant.id, "wh-123", "orders/create")
        .unwrap()
        .is_new);
    assert!(queries::record_webhook_if_new(&conn, &tenant.id, "wh-123", "orders/updated")
        .unwrap()
        .is_new);
}

#[test]
fn same_webhook_id_different_tenant_is_new() {
    let conn = setup_test_db();
    let a = create_test_tenant(&conn, "a.example.com");
    let b = create_test_tenant(&conn, "b.example.com");

    assert!(queries::record_webhook_if_new(&conn, &a.id, "wh-123", "orders/create")
        .unwrap()
        .is_new);
    assert!(queries::record_webhook_if_new(&conn, &b.id, "wh-123", "orders/create")
        .unwrap()
        .is_new);
}

#[test]
fn processed_status_is_recorded() {
    let conn = setup_test_db();
    let tenant = create_test_tenant(&conn, "shop.example.com");

    queries::record_webhook_if_new(&conn, &tenant.id, "wh-1", "orders/create").unwrap();
    queries::mark_webhook_processed(&conn, &tenant.id, "wh-1", "orders/create", Some("1001"))
        .unwrap();

    let event = queries::get_webhook_event(&conn, &tenant.id, "wh-1", "orders/create")
        .unwrap()
        .expect("event exists");
    assert_eq!(event.status, WebhookStatus::Processed);
    assert_eq!(event.order_id.as_deref(), Some("1001"));
    assert!(event.processed_at.is_some());
}

#[test]
fn billing_denial_is_born_dead_lettered() {
    let conn = setup_test_db();
    let tenant = create_test_tenant(&conn, "shop.example.com");

    let input = CreateConversionLog {
        tenant_id: tenant.id.clone(),
        order_id: "1001".to_string(),
        platform: Platform::Google,
        event_type: "purchase".to_string(),
        status: DeliveryStatus::DeadLetter,
        order_value: 49.99,
        currency: "EUR".to_string(),
        checkout_token_hash: None,
        event_id: None,
    };
    let reason = "monthly conversion limit reached";
    assert!(queries::create_dead_lettered_log(&conn, &input, reason).unwrap());

    let log = queries::get_conversion_log(&conn, &tenant.id, "1001", Platform::Google, "purchase")
        .unwrap()
        .expect("log exists");
    assert_eq!(log.status, DeliveryStatus::DeadLetter);
    assert!(log.dead_lettered_at.is_some());
    assert_eq!(log.error_message.as_deref(), Some(reason));
    // The denied order's real value and currency are kept for audit
    assert!((log.order_value - 49.99).abs() < 1e-9);
    assert_eq!(log.currency, "EUR");

    // Terminal from the first statement: the delivery scan never sees it
    let now = chrono::Utc::now().timestamp();
    assert!(queries::list_deliverable(&conn, now, 100).unwrap().is_empty());

    // A replayed denial for the same attempt is ignored
    assert!(!queries::create_dead_lettered_log(&conn, &input, reason).unwrap());
}

#[test]
fn failed_status_is_recorded() {
    let conn = setup_test_db();
    let tenant = create_test_tenant(&conn, "shop.example.com");

    queries::record_webhook_if_new(&conn, &tenant.id, "wh-2", "orders/create").unwrap();
    queries::mark_webhook_failed(&conn, &tenant.id, "wh-2", "orders/create").unwrap();

    let event = queries::get_webhook_event(&conn, &tenant.id, "wh-2", "orders/create")
        .unwrap()
        .expect("event exists");
    assert_eq!(event.status, WebhookStatus::Failed);
}
