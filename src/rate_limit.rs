//! Rate limiting for the public endpoints.
//!
//! Applied per-IP. The inbound order webhook is deliberately NOT rate
//! limited: throttling it would trigger upstream retries, which is exactly
//! what the fast-ack design exists to avoid.
//!
//! Tiers:
//! - Pixel: /pixel/events - browser-originated, high volume
//! - Verification: /verification/* - report generation, expensive
//!
//! Configure via environment variables:
//! - RATE_LIMIT_PIXEL_RPM (default: 120)
//! - RATE_LIMIT_VERIFICATION_RPM (default: 30)

use std::sync::Arc;
use std::time::Duration;
use tower_governor::governor::GovernorConfigBuilder;
use tower_governor::GovernorLayer;

/// Rate limiter layer type alias using governor types directly
pub type RateLimitLayer = GovernorLayer<
    tower_governor::key_extractor::PeerIpKeyExtractor,
    governor::middleware::NoOpMiddleware<governor::clock::QuantaInstant>,
    axum::body::Body,
>;

/// Creates a rate limiter layer with the specified requests per minute.
fn create_layer(requests_per_minute: u32) -> RateLimitLayer {
    assert!(requests_per_minute > 0, "Rate limit must be greater than 0");

    let period_secs = 60 / requests_per_minute as u64;
    let config = GovernorConfigBuilder::default()
        .period(Duration::from_secs(period_secs.max(1)))
        .burst_size(requests_per_minute)
        .finish()
        .expect("Failed to build rate limiter config");

    GovernorLayer::new(Arc::new(config))
}

/// Layer for the pixel ingestion endpoint.
pub fn pixel_layer(requests_per_minute: u32) -> RateLimitLayer {
    create_layer(requests_per_minute)
}

/// Layer for the verification API.
pub fn verification_layer(requests_per_minute: u32) -> RateLimitLayer {
    create_layer(requests_per_minute)
}
