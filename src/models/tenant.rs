use serde::{Deserialize, Serialize};

use crate::consent::ConsentStrategy;
use crate::platforms::Platform;

/// Subscription plan, the source of the monthly conversion quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Free,
    Starter,
    Growth,
    Scale,
}

impl Plan {
    /// Monthly conversion quota. Scale is effectively unmetered.
    pub fn monthly_limit(&self) -> i64 {
        match self {
            Plan::Free => 50,
            Plan::Starter => 500,
            Plan::Growth => 5000,
            Plan::Scale => i64::MAX,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Plan::Free => "free",
            Plan::Starter => "starter",
            Plan::Growth => "growth",
            Plan::Scale => "scale",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "free" => Some(Plan::Free),
            "starter" => Some(Plan::Starter),
            "growth" => Some(Plan::Growth),
            "scale" => Some(Plan::Scale),
            _ => None,
        }
    }
}

/// A merchant account: the unit of billing, data isolation, and
/// destination configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: String,
    /// Store domain as sent in the webhook `x-tenant-domain` header.
    pub domain: String,
    pub plan: Plan,
    pub consent_strategy: ConsentStrategy,
    /// Destination platforms enabled for this tenant.
    pub platforms: Vec<Platform>,
    /// Shared secret for inbound webhook HMAC verification.
    pub webhook_secret: String,
    /// Opaque per-platform credential blob (JSON keyed by platform name).
    /// Encryption/rotation is handled by an external secret store.
    pub credentials: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateTenant {
    pub domain: String,
    pub plan: Plan,
    pub consent_strategy: ConsentStrategy,
    pub platforms: Vec<Platform>,
    pub webhook_secret: String,
    pub credentials: Option<String>,
}
