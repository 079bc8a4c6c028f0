use rusqlite::Connection;

/// Initialize the database schema.
///
/// Every coordination primitive in the pipeline is expressed here as a
/// uniqueness or CHECK constraint: duplicate webhooks race on the
/// webhook_events unique key, quota reservation is a conditional update on
/// usage_counters, and the job queue upserts on (tenant_id, order_id).
pub fn init_db(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA journal_size_limit = 67108864;

        -- Merchant accounts (unit of billing and data isolation)
        CREATE TABLE IF NOT EXISTS tenants (
            id TEXT PRIMARY KEY,
            domain TEXT NOT NULL UNIQUE,
            plan TEXT NOT NULL CHECK (plan IN ('free', 'starter', 'growth', 'scale')),
            consent_strategy TEXT NOT NULL DEFAULT 'balanced',
            platforms TEXT NOT NULL DEFAULT '[]',
            webhook_secret TEXT NOT NULL,
            credentials TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_tenants_domain ON tenants(domain);

        -- Idempotency ledger: one row per webhook ever seen.
        -- The unique key is the concurrency-safe duplicate detector.
        -- Rows are never deleted in normal operation (audit trail); the
        -- reserved '_system' tenant reuses this table for cron locks.
        CREATE TABLE IF NOT EXISTS webhook_events (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            webhook_id TEXT NOT NULL,
            topic TEXT NOT NULL,
            status TEXT NOT NULL CHECK (status IN ('processing', 'processed', 'failed')),
            order_id TEXT,
            received_at INTEGER NOT NULL,
            processed_at INTEGER,
            UNIQUE(tenant_id, webhook_id, topic)
        );
        CREATE INDEX IF NOT EXISTS idx_webhook_events_sweep ON webhook_events(topic, received_at);

        -- Monthly usage counters. Mutated only via atomic
        -- increment-with-ceiling; never read-then-write.
        CREATE TABLE IF NOT EXISTS usage_counters (
            tenant_id TEXT NOT NULL,
            year_month TEXT NOT NULL,
            current INTEGER NOT NULL DEFAULT 0,
            usage_limit INTEGER NOT NULL,
            PRIMARY KEY (tenant_id, year_month)
        );

        -- Job queue: one upsertable row per (tenant, order) holding the
        -- raw order payload for deferred processing.
        CREATE TABLE IF NOT EXISTS jobs (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            order_id TEXT NOT NULL,
            payload TEXT NOT NULL,
            order_value REAL NOT NULL DEFAULT 0,
            currency TEXT NOT NULL DEFAULT 'USD',
            status TEXT NOT NULL CHECK (status IN ('queued', 'processing', 'completed', 'failed')),
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE(tenant_id, order_id)
        );
        CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status, created_at);

        -- Client-observed pixel receipts. Append-mostly, immutable once
        -- written. NOT unique across platform: each destination pixel
        -- observes the same commerce event independently.
        CREATE TABLE IF NOT EXISTS receipts (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            order_key TEXT NOT NULL,
            event_type TEXT NOT NULL,
            platform TEXT NOT NULL CHECK (platform IN ('google', 'meta', 'tiktok')),
            payload_json TEXT NOT NULL,
            consent_marketing INTEGER,
            consent_analytics INTEGER,
            is_trusted INTEGER NOT NULL DEFAULT 0,
            hmac_matched INTEGER NOT NULL DEFAULT 0,
            pixel_timestamp INTEGER NOT NULL,
            event_id TEXT,
            event_name TEXT,
            value REAL,
            currency TEXT,
            checkout_token_hash TEXT,
            created_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_receipts_order ON receipts(tenant_id, order_key, event_type);
        CREATE INDEX IF NOT EXISTS idx_receipts_token ON receipts(tenant_id, checkout_token_hash);
        CREATE INDEX IF NOT EXISTS idx_receipts_window ON receipts(tenant_id, pixel_timestamp);

        -- Per-destination delivery attempts.
        CREATE TABLE IF NOT EXISTS conversion_logs (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            order_id TEXT NOT NULL,
            platform TEXT NOT NULL CHECK (platform IN ('google', 'meta', 'tiktok')),
            event_type TEXT NOT NULL,
            status TEXT NOT NULL CHECK (status IN ('pending', 'pending_consent', 'sent', 'dead_letter')),
            attempts INTEGER NOT NULL DEFAULT 0,
            next_retry_at INTEGER,
            error_message TEXT,
            event_id TEXT,
            order_value REAL NOT NULL DEFAULT 0,
            currency TEXT NOT NULL DEFAULT 'USD',
            checkout_token_hash TEXT,
            consent_source TEXT,
            created_at INTEGER NOT NULL,
            sent_at INTEGER,
            dead_lettered_at INTEGER,
            UNIQUE(tenant_id, order_id, platform, event_type)
        );
        CREATE INDEX IF NOT EXISTS idx_conversion_logs_consent ON conversion_logs(status, created_at);
        CREATE INDEX IF NOT EXISTS idx_conversion_logs_retry ON conversion_logs(status, next_retry_at);
        CREATE INDEX IF NOT EXISTS idx_conversion_logs_event ON conversion_logs(tenant_id, platform, event_id);

        -- Verification runs; immutable once completed. Result rows are
        -- materialized into the events JSON column.
        CREATE TABLE IF NOT EXISTS verification_runs (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            status TEXT NOT NULL CHECK (status IN ('pending', 'running', 'completed', 'failed')),
            platforms TEXT NOT NULL DEFAULT '[]',
            window_start INTEGER NOT NULL,
            window_end INTEGER NOT NULL,
            total_tests INTEGER NOT NULL DEFAULT 0,
            passed_tests INTEGER NOT NULL DEFAULT 0,
            failed_tests INTEGER NOT NULL DEFAULT 0,
            missing_param_tests INTEGER NOT NULL DEFAULT 0,
            deduplicated_events INTEGER NOT NULL DEFAULT 0,
            parameter_completeness REAL NOT NULL DEFAULT 0,
            value_accuracy REAL NOT NULL DEFAULT 0,
            events TEXT NOT NULL DEFAULT '[]',
            error TEXT,
            created_at INTEGER NOT NULL,
            completed_at INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_verification_runs_tenant ON verification_runs(tenant_id, created_at);
        "#,
    )?;
    Ok(())
}
