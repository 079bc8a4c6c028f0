//! Destination platform integrations.
//!
//! Each destination gets its own module with an exhaustive payload parser
//! and an outbound conversion client, surfaced through the closed
//! [`Platform`] enum. Adding a platform means adding a variant and letting
//! the compiler point at every match that needs extending.

pub mod google;
pub mod meta;
pub mod tiktok;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// Closed set of supported destination platforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Google,
    Meta,
    TikTok,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Google => "google",
            Platform::Meta => "meta",
            Platform::TikTok => "tiktok",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "google" => Some(Platform::Google),
            "meta" => Some(Platform::Meta),
            "tiktok" => Some(Platform::TikTok),
            _ => None,
        }
    }

    pub fn all() -> &'static [Platform] {
        &[Platform::Google, Platform::Meta, Platform::TikTok]
    }
}

/// Provider-agnostic view of a pixel event payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedEvent {
    pub platform: Platform,
    pub event_name: String,
    pub event_id: Option<String>,
    pub order_id: Option<String>,
    pub value: Option<f64>,
    pub currency: Option<String>,
}

/// Parse a platform-specific pixel payload into a [`ParsedEvent`].
///
/// Each platform's pixel emits a different JSON shape; the per-variant
/// parsers are exhaustive so malformed payloads surface as errors instead
/// of silently dropping fields.
pub fn parse(platform: Platform, payload: &serde_json::Value) -> Result<ParsedEvent> {
    match platform {
        Platform::Google => google::parse_payload(payload),
        Platform::Meta => meta::parse_payload(payload),
        Platform::TikTok => tiktok::parse_payload(payload),
    }
}

/// A conversion ready for outbound delivery.
#[derive(Debug, Clone)]
pub struct ConversionEvent {
    pub order_id: String,
    pub event_type: String,
    pub value: f64,
    pub currency: String,
    /// Client-generated event id for destination-side dedup.
    pub event_id: String,
}

/// Outbound delivery interface.
///
/// The worker is generic over this so tests can substitute a scripted
/// implementation; production uses [`HttpDelivery`].
pub trait ConversionDelivery: Send + Sync {
    /// Deliver one conversion to the destination, returning the
    /// destination-acknowledged event id.
    fn deliver(
        &self,
        platform: Platform,
        credentials: &serde_json::Value,
        event: &ConversionEvent,
    ) -> impl std::future::Future<Output = Result<String>> + Send;
}

/// Production delivery client: one reqwest client, per-platform wire formats.
#[derive(Debug, Clone, Default)]
pub struct HttpDelivery {
    client: reqwest::Client,
}

impl HttpDelivery {
    pub fn new() -> Self {
        Self { client: reqwest::Client::new() }
    }
}

impl ConversionDelivery for HttpDelivery {
    async fn deliver(
        &self,
        platform: Platform,
        credentials: &serde_json::Value,
        event: &ConversionEvent,
    ) -> Result<String> {
        let creds = credentials.get(platform.as_str()).ok_or_else(|| {
            AppError::Delivery(format!("no credentials configured for {}", platform.as_str()))
        })?;

        match platform {
            Platform::Google => google::send_conversion(&self.client, creds, event).await,
            Platform::Meta => meta::send_conversion(&self.client, creds, event).await,
            Platform::TikTok => tiktok::send_conversion(&self.client, creds, event).await,
        }
    }
}
