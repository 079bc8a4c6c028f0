use std::env;

/// Runtime configuration, read once at startup.
///
/// The consent timeout and retry caps are deliberately knobs rather than
/// constants: upstream documentation only fixes their defaults (24h, 5).
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub database_path: String,
    pub base_url: String,
    pub dev_mode: bool,

    /// Hours a pending_consent delivery may wait for a receipt before
    /// it is dead-lettered as presumed non-consent.
    pub consent_timeout_hours: i64,
    /// Transient delivery failures tolerated before dead-lettering.
    pub delivery_max_retries: i64,
    /// Base of the exponential backoff schedule, in seconds.
    pub retry_backoff_base_secs: i64,
    /// Oldest-first batch cap for each reconciliation pass.
    pub worker_batch_size: i64,
    /// Concurrent outbound deliveries per cycle.
    pub worker_concurrency: usize,
    /// Seconds between reconciliation cycles.
    pub worker_interval_secs: u64,
    /// Staleness TTL for the cron singleton lock, in seconds.
    pub cron_lock_ttl_secs: i64,
    /// Wall-clock guard for a single tenant's scan inside a cycle.
    pub tenant_scan_timeout_secs: u64,

    /// Per-IP requests per minute for the pixel ingestion endpoint.
    pub pixel_rate_limit_rpm: u32,
    /// Per-IP requests per minute for the verification API.
    pub verification_rate_limit_rpm: u32,
}

fn env_i64(key: &str, default: i64) -> i64 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let dev_mode = env::var("PIXELGATE_ENV")
            .map(|v| v == "dev" || v == "development")
            .unwrap_or(false);

        let host = env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port: u16 = env::var("PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(3000);

        let base_url =
            env::var("BASE_URL").unwrap_or_else(|_| format!("http://{}:{}", host, port));

        Self {
            host,
            port,
            database_path: env::var("DATABASE_PATH")
                .unwrap_or_else(|_| "pixelgate.db".to_string()),
            base_url,
            dev_mode,
            consent_timeout_hours: env_i64("PIXELGATE_CONSENT_TIMEOUT_HOURS", 24),
            delivery_max_retries: env_i64("PIXELGATE_DELIVERY_MAX_RETRIES", 5),
            retry_backoff_base_secs: env_i64("PIXELGATE_RETRY_BACKOFF_BASE_SECS", 60),
            worker_batch_size: env_i64("PIXELGATE_WORKER_BATCH_SIZE", 100),
            worker_concurrency: env_i64("PIXELGATE_WORKER_CONCURRENCY", 4) as usize,
            worker_interval_secs: env_i64("PIXELGATE_WORKER_INTERVAL_SECS", 60) as u64,
            cron_lock_ttl_secs: env_i64("PIXELGATE_CRON_LOCK_TTL_SECS", 600),
            tenant_scan_timeout_secs: env_i64("PIXELGATE_TENANT_SCAN_TIMEOUT_SECS", 300) as u64,
            pixel_rate_limit_rpm: env_i64("RATE_LIMIT_PIXEL_RPM", 120) as u32,
            verification_rate_limit_rpm: env_i64("RATE_LIMIT_VERIFICATION_RPM", 30) as u32,
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
