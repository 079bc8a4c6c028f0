use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookStatus {
    Processing,
    Processed,
    Failed,
}

impl WebhookStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookStatus::Processing => "processing",
            WebhookStatus::Processed => "processed",
            WebhookStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "processing" => Some(WebhookStatus::Processing),
            "processed" => Some(WebhookStatus::Processed),
            "failed" => Some(WebhookStatus::Failed),
            _ => None,
        }
    }
}

/// One row per webhook ever seen. The UNIQUE(tenant_id, webhook_id, topic)
/// constraint is the concurrency-safe duplicate detector; rows are never
/// deleted in normal operation so the table doubles as an audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub id: String,
    pub tenant_id: String,
    pub webhook_id: String,
    pub topic: String,
    pub status: WebhookStatus,
    pub order_id: Option<String>,
    pub received_at: i64,
    pub processed_at: Option<i64>,
}

/// Result of attempting to record a webhook id.
#[derive(Debug, Clone, Copy)]
pub struct IdempotencyOutcome {
    /// False means this exact webhook was already seen; the caller must
    /// still acknowledge upstream.
    pub is_new: bool,
}
