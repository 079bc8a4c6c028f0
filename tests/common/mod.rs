//! Test utilities and fixtures for Pixelgate integration tests

#![allow(dead_code)]

use rusqlite::Connection;

pub use pixelgate::billing;
pub use pixelgate::consent::{ConsentState, ConsentStrategy};
pub use pixelgate::db::{init_db, queries};
pub use pixelgate::models::*;
pub use pixelgate::platforms::Platform;
pub use pixelgate::util;

/// Create an in-memory test database with schema initialized
pub fn setup_test_db() -> Connection {
    let conn = Connection::open_in_memory().expect("Failed to create in-memory database");
    init_db(&conn).expect("Failed to initialize schema");
    conn
}

/// Test configuration with short, deterministic knobs
pub fn test_config() -> pixelgate::config::Config {
    pixelgate::config::Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        database_path: ":memory:".to_string(),
        base_url: "http://localhost".to_string(),
        dev_mode: true,
        consent_timeout_hours: 24,
        delivery_max_retries: 3,
        retry_backoff_base_secs: 60,
        worker_batch_size: 100,
        worker_concurrency: 2,
        worker_interval_secs: 60,
        cron_lock_ttl_secs: 600,
        tenant_scan_timeout_secs: 5,
        pixel_rate_limit_rpm: 120,
        verification_rate_limit_rpm: 30,
    }
}

/// App state backed by a shared-cache in-memory database, so every pooled
/// connection sees the same data. `name` must be unique per test.
pub fn setup_test_state(name: &str) -> pixelgate::db::AppState {
    let uri = format!("file:{}?mode=memory&cache=shared", name);
    let manager = r2d2_sqlite::SqliteConnectionManager::file(uri);
    let pool = r2d2::Pool::builder()
        .max_size(4)
        .build(manager)
        .expect("Failed to build test pool");
    init_db(&pool.get().expect("Failed to get test connection"))
        .expect("Failed to initialize schema");
    pixelgate::db::AppState { db: pool, config: test_config() }
}

/// Create a test tenant with default values
pub fn create_test_tenant(conn: &Connection, domain: &str) -> Tenant {
    create_test_tenant_with(conn, domain, Plan::Starter, ConsentStrategy::Balanced)
}

pub fn create_test_tenant_with(
    conn: &Connection,
    domain: &str,
    plan: Plan,
    consent_strategy: ConsentStrategy,
) -> Tenant {
    let input = CreateTenant {
        domain: domain.to_string(),
        plan,
        consent_strategy,
        platforms: vec![Platform::Google, Platform::Meta],
        webhook_secret: "test-webhook-secret".to_string(),
        credentials: Some(
            serde_json::json!({
                "google": { "measurement_id": "G-TEST", "api_secret": "s" },
                "meta": { "pixel_id": "123", "access_token": "t" },
            })
            .to_string(),
        ),
    };
    queries::create_tenant(conn, &input).expect("Failed to create test tenant")
}

/// Enqueue a job for the tenant the way the webhook handler does
pub fn enqueue_test_job(conn: &Connection, tenant_id: &str, order_id: &str, value: f64) {
    let payload = serde_json::json!({
        "id": order_id,
        "total_price": value,
        "currency": "USD",
        "checkout_token": format!("tok-{}", order_id),
    })
    .to_string();
    queries::upsert_job(conn, tenant_id, order_id, &payload, value, "USD")
        .expect("Failed to enqueue test job");
}

/// Record a pixel receipt with the given consent signal
pub fn create_test_receipt(
    conn: &Connection,
    tenant_id: &str,
    order_key: &str,
    marketing: Option<bool>,
) -> Receipt {
    let input = CreateReceipt {
        order_key: order_key.to_string(),
        event_type: "purchase".to_string(),
        platform: Platform::Google,
        payload_json: "{}".to_string(),
        consent: ConsentState { marketing, analytics: Some(true) },
        is_trusted: true,
        hmac_matched: true,
        pixel_timestamp: chrono::Utc::now().timestamp(),
        event_id: Some(format!("evt-{}", order_key)),
        event_name: Some("purchase".to_string()),
        value: Some(49.99),
        currency: Some("USD".to_string()),
        checkout_token_hash: None,
    };
    queries::create_receipt(conn, tenant_id, &input).expect("Failed to create test receipt")
}
