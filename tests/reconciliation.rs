//! Reconciliation worker tests: consent resolution, fan-out, delivery,
//! retry scheduling, and the cron singleton lock

mod common;

use std::sync::{Arc, Mutex};

use common::*;
use pixelgate::error::{AppError, Result};
use pixelgate::platforms::{ConversionDelivery, ConversionEvent};
use pixelgate::worker::{self, backoff_delay};

/// Scripted delivery that records every call
#[derive(Clone, Default)]
struct MockDelivery {
    fail: bool,
    calls: Arc<Mutex<Vec<(Platform, String, String)>>>,
}

impl MockDelivery {
    fn succeeding() -> Self {
        Self { fail: false, calls: Arc::new(Mutex::new(Vec::new())) }
    }

    fn failing() -> Self {
        Self { fail: true, calls: Arc::new(Mutex::new(Vec::new())) }
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn event_ids_for(&self, platform: Platform) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, _, _)| *p == platform)
            .map(|(_, _, event_id)| event_id.clone())
            .collect()
    }
}

impl ConversionDelivery for MockDelivery {
    async fn deliver(
        &self,
        platform: Platform,
        _credentials: &serde_json::Value,
        event: &ConversionEvent,
    ) -> Result<String> {
        self.calls
            .lock()
            .unwrap()
            .push((platform, event.order_id.clone(), event.event_id.clone()));
        if self.fail {
            Err(AppError::Delivery("mock destination outage".to_string()))
        } else {
            Ok(format!("dest_{}", event.event_id))
        }
    }
}

fn log_status(state: &pixelgate::db::AppState, tenant_id: &str, order_id: &str, platform: Platform) -> ConversionLog {
    let conn = state.db.get().unwrap();
    queries::get_conversion_log(&conn, tenant_id, order_id, platform, "purchase")
        .unwrap()
        .expect("conversion log exists")
}

#[tokio::test]
async fn weak_strategy_delivers_in_one_cycle() {
    let state = setup_test_state("weak_one_cycle");
    let conn = state.db.get().unwrap();
    let tenant =
        create_test_tenant_with(&conn, "shop.example.com", Plan::Starter, ConsentStrategy::Weak);
    enqueue_test_job(&conn, &tenant.id, "1001", 49.99);
    drop(conn);

    let mock = MockDelivery::succeeding();
    let stats = worker::run_cycle(&state, &mock).await.unwrap();

    assert!(!stats.skipped);
    assert_eq!(stats.jobs_fanned_out, 1);
    assert_eq!(stats.deliveries_sent, 2);
    assert_eq!(mock.call_count(), 2);

    let log = log_status(&state, &tenant.id, "1001", Platform::Google);
    assert_eq!(log.status, DeliveryStatus::Sent);
    assert!(log.event_id.as_deref().unwrap().starts_with("dest_"));
    assert!(log.sent_at.is_some());
}

#[tokio::test]
async fn consent_opt_in_unblocks_delivery() {
    let state = setup_test_state("consent_opt_in");
    let conn = state.db.get().unwrap();
    let tenant = create_test_tenant_with(
        &conn,
        "shop.example.com",
        Plan::Starter,
        ConsentStrategy::Strict,
    );
    enqueue_test_job(&conn, &tenant.id, "1001", 49.99);
    create_test_receipt(&conn, &tenant.id, "1001", Some(true));
    drop(conn);

    let mock = MockDelivery::succeeding();

    // First cycle fans the job out into pending_consent
    let stats = worker::run_cycle(&state, &mock).await.unwrap();
    assert_eq!(stats.jobs_fanned_out, 1);
    assert_eq!(stats.deliveries_sent, 0);
    let log = log_status(&state, &tenant.id, "1001", Platform::Google);
    assert_eq!(log.status, DeliveryStatus::PendingConsent);

    // Second cycle resolves consent from the receipt and delivers
    let stats = worker::run_cycle(&state, &mock).await.unwrap();
    assert_eq!(stats.consent_confirmed, 2);
    assert_eq!(stats.deliveries_sent, 2);

    let log = log_status(&state, &tenant.id, "1001", Platform::Google);
    assert_eq!(log.status, DeliveryStatus::Sent);
    assert_eq!(log.consent_source.as_deref(), Some("client_confirmed"));
}

#[tokio::test]
async fn consent_refusal_dead_letters_without_delivery() {
    let state = setup_test_state("consent_refusal");
    let conn = state.db.get().unwrap();
    let tenant = create_test_tenant(&conn, "shop.example.com");
    enqueue_test_job(&conn, &tenant.id, "1001", 49.99);
    create_test_receipt(&conn, &tenant.id, "1001", Some(false));
    drop(conn);

    let mock = MockDelivery::succeeding();
    worker::run_cycle(&state, &mock).await.unwrap();
    let stats = worker::run_cycle(&state, &mock).await.unwrap();

    assert_eq!(stats.consent_denied, 2);
    assert_eq!(mock.call_count(), 0);

    let log = log_status(&state, &tenant.id, "1001", Platform::Google);
    assert_eq!(log.status, DeliveryStatus::DeadLetter);
    assert!(log.dead_lettered_at.is_some());
    assert!(log.error_message.as_deref().unwrap().contains("withdrawn"));
}

#[tokio::test]
async fn consent_window_expiry_dead_letters_exactly_once() {
    let state = setup_test_state("consent_expiry");
    let conn = state.db.get().unwrap();
    let tenant = create_test_tenant_with(
        &conn,
        "shop.example.com",
        Plan::Starter,
        ConsentStrategy::Strict,
    );
    enqueue_test_job(&conn, &tenant.id, "1001", 49.99);
    drop(conn);

    let mock = MockDelivery::succeeding();
    worker::run_cycle(&state, &mock).await.unwrap();

    // Backdate the attempts past the consent window
    {
        let conn = state.db.get().unwrap();
        conn.execute(
            "UPDATE conversion_logs SET created_at = created_at - 25 * 3600",
            [],
        )
        .unwrap();
    }

    let stats = worker::run_cycle(&state, &mock).await.unwrap();
    assert_eq!(stats.consent_expired, 2);

    let log = log_status(&state, &tenant.id, "1001", Platform::Google);
    assert_eq!(log.status, DeliveryStatus::DeadLetter);
    assert!(log.error_message.as_deref().unwrap().contains("expired"));

    // A further cycle finds nothing to reap
    let stats = worker::run_cycle(&state, &mock).await.unwrap();
    assert_eq!(stats.consent_expired, 0);
    assert_eq!(mock.call_count(), 0);
}

#[tokio::test]
async fn failed_delivery_backs_off_before_retry() {
    let mut state = setup_test_state("delivery_backoff");
    state.config.delivery_max_retries = 3;
    let conn = state.db.get().unwrap();
    let tenant =
        create_test_tenant_with(&conn, "shop.example.com", Plan::Starter, ConsentStrategy::Weak);
    enqueue_test_job(&conn, &tenant.id, "1001", 49.99);
    drop(conn);

    let mock = MockDelivery::failing();
    let stats = worker::run_cycle(&state, &mock).await.unwrap();
    assert_eq!(stats.deliveries_retried, 2);
    assert_eq!(mock.call_count(), 2);

    let now = chrono::Utc::now().timestamp();
    let log = log_status(&state, &tenant.id, "1001", Platform::Google);
    assert_eq!(log.status, DeliveryStatus::Pending);
    assert_eq!(log.attempts, 1);
    assert!(log.next_retry_at.unwrap() > now);

    // Backed-off attempts are not retried before their scheduled time
    let stats = worker::run_cycle(&state, &mock).await.unwrap();
    assert_eq!(stats.deliveries_retried, 0);
    assert_eq!(mock.call_count(), 2);
}

#[tokio::test]
async fn retry_resends_the_same_dedup_event_id() {
    let mut state = setup_test_state("retry_event_id_reuse");
    state.config.delivery_max_retries = 3;
    let conn = state.db.get().unwrap();
    let tenant =
        create_test_tenant_with(&conn, "shop.example.com", Plan::Starter, ConsentStrategy::Weak);
    enqueue_test_job(&conn, &tenant.id, "1001", 49.99);
    drop(conn);

    let mock = MockDelivery::failing();
    worker::run_cycle(&state, &mock).await.unwrap();

    // Bring the scheduled retry due so the next cycle attempts again
    {
        let conn = state.db.get().unwrap();
        conn.execute("UPDATE conversion_logs SET next_retry_at = 0", []).unwrap();
    }
    let stats = worker::run_cycle(&state, &mock).await.unwrap();
    assert_eq!(stats.deliveries_retried, 2);

    // Both attempts carried the id minted at fan-out, so the destination
    // can dedup the retry
    let ids = mock.event_ids_for(Platform::Google);
    assert_eq!(ids.len(), 2);
    assert_eq!(ids[0], ids[1]);

    let log = log_status(&state, &tenant.id, "1001", Platform::Google);
    assert_eq!(log.event_id.as_deref(), Some(ids[0].as_str()));
}

#[tokio::test]
async fn exhausted_retries_dead_letter() {
    let mut state = setup_test_state("retry_exhaustion");
    state.config.delivery_max_retries = 1;
    let conn = state.db.get().unwrap();
    let tenant =
        create_test_tenant_with(&conn, "shop.example.com", Plan::Starter, ConsentStrategy::Weak);
    enqueue_test_job(&conn, &tenant.id, "1001", 49.99);
    drop(conn);

    let mock = MockDelivery::failing();
    let stats = worker::run_cycle(&state, &mock).await.unwrap();
    assert_eq!(stats.deliveries_dead_lettered, 2);

    let log = log_status(&state, &tenant.id, "1001", Platform::Google);
    assert_eq!(log.status, DeliveryStatus::DeadLetter);
    assert!(log.error_message.as_deref().unwrap().contains("retries exhausted"));

    // Dead letters are terminal
    let stats = worker::run_cycle(&state, &mock).await.unwrap();
    assert_eq!(stats.deliveries_retried, 0);
    assert_eq!(stats.deliveries_dead_lettered, 0);
    assert_eq!(mock.call_count(), 2);
}

#[tokio::test]
async fn missing_credentials_dead_letter_instead_of_retrying() {
    let state = setup_test_state("missing_credentials");
    let conn = state.db.get().unwrap();
    let tenant = queries::create_tenant(
        &conn,
        &CreateTenant {
            domain: "shop.example.com".to_string(),
            plan: Plan::Starter,
            consent_strategy: ConsentStrategy::Weak,
            platforms: vec![Platform::Google],
            webhook_secret: "s".to_string(),
            credentials: None,
        },
    )
    .unwrap();
    enqueue_test_job(&conn, &tenant.id, "1001", 49.99);
    drop(conn);

    let mock = MockDelivery::succeeding();
    let stats = worker::run_cycle(&state, &mock).await.unwrap();
    assert_eq!(stats.deliveries_dead_lettered, 1);
    assert_eq!(mock.call_count(), 0);

    let log = log_status(&state, &tenant.id, "1001", Platform::Google);
    assert_eq!(log.status, DeliveryStatus::DeadLetter);
}

#[tokio::test]
async fn unparseable_job_payload_fails_the_job() {
    let state = setup_test_state("bad_job_payload");
    let conn = state.db.get().unwrap();
    let tenant = create_test_tenant(&conn, "shop.example.com");
    queries::upsert_job(&conn, &tenant.id, "1001", "not json", 0.0, "USD").unwrap();
    drop(conn);

    let mock = MockDelivery::succeeding();
    let stats = worker::run_cycle(&state, &mock).await.unwrap();
    assert_eq!(stats.jobs_failed, 1);
    assert_eq!(stats.jobs_fanned_out, 0);

    let conn = state.db.get().unwrap();
    let job = queries::get_job(&conn, &tenant.id, "1001").unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
}

#[tokio::test]
async fn held_lock_skips_the_cycle() {
    let state = setup_test_state("lock_contention");
    {
        let conn = state.db.get().unwrap();
        let tenant = create_test_tenant_with(
            &conn,
            "shop.example.com",
            Plan::Starter,
            ConsentStrategy::Weak,
        );
        enqueue_test_job(&conn, &tenant.id, "1001", 49.99);
        assert!(queries::try_acquire_cron_lock(&conn, "reconciliation").unwrap());
    }

    let mock = MockDelivery::succeeding();
    let stats = worker::run_cycle(&state, &mock).await.unwrap();
    assert!(stats.skipped);
    assert_eq!(mock.call_count(), 0);

    // Released lock lets the next cycle through
    {
        let conn = state.db.get().unwrap();
        queries::release_cron_lock(&conn, "reconciliation").unwrap();
    }
    let stats = worker::run_cycle(&state, &mock).await.unwrap();
    assert!(!stats.skipped);
    assert_eq!(stats.jobs_fanned_out, 1);
}

#[tokio::test]
async fn stale_lock_is_swept_before_acquisition() {
    let state = setup_test_state("stale_lock");
    {
        let conn = state.db.get().unwrap();
        assert!(queries::try_acquire_cron_lock(&conn, "reconciliation").unwrap());
        // Simulate a crashed holder from well past the TTL
        conn.execute(
            "UPDATE webhook_events SET received_at = received_at - 3600
             WHERE tenant_id = '_system'",
            [],
        )
        .unwrap();
    }

    let mock = MockDelivery::succeeding();
    let stats = worker::run_cycle(&state, &mock).await.unwrap();
    assert!(!stats.skipped);
}

#[tokio::test]
async fn redrained_scenario_cannot_duplicate_fan_out() {
    let state = setup_test_state("fan_out_idempotent");
    let conn = state.db.get().unwrap();
    let tenant =
        create_test_tenant_with(&conn, "shop.example.com", Plan::Starter, ConsentStrategy::Weak);
    enqueue_test_job(&conn, &tenant.id, "1001", 49.99);
    drop(conn);

    let mock = MockDelivery::succeeding();
    worker::run_cycle(&state, &mock).await.unwrap();

    // Re-queue the same order, as a replayed webhook would after the job
    // completed and a new upsert landed
    {
        let conn = state.db.get().unwrap();
        conn.execute("UPDATE jobs SET status = 'queued'", []).unwrap();
    }
    let stats = worker::run_cycle(&state, &mock).await.unwrap();

    // Fan-out inserts are ignored as duplicates, deliveries stay sent
    assert_eq!(stats.deliveries_sent, 0);
    assert_eq!(mock.call_count(), 2);
    let conn = state.db.get().unwrap();
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM conversion_logs", [], |row| row.get(0))
        .unwrap();
    assert_eq!(count, 2);
}

#[test]
fn backoff_schedule_is_exponential_and_capped() {
    assert_eq!(backoff_delay(60, 0), 60);
    assert_eq!(backoff_delay(60, 3), 480);
    assert_eq!(backoff_delay(60, 30), 86_400);
}
