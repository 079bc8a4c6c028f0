//! Pure consent evaluation.
//!
//! Maps a tenant's consent strategy plus the consent signal observed on a
//! receipt to an allow/deny decision. Deterministic and side-effect-free;
//! all receipt lookup I/O lives in the reconciliation worker.

use serde::{Deserialize, Serialize};

/// Consent snapshot captured client-side when the pixel fired.
/// `None` means the category was never answered, not a denial.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentState {
    pub marketing: Option<bool>,
    pub analytics: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsentStrategy {
    /// Requires an explicit marketing opt-in; absence denies.
    Strict,
    /// Allowed unless marketing is explicitly false, but the absence of
    /// any signal at all still denies: consent cannot be assumed.
    Balanced,
    /// Always allowed. Only for tenants that explicitly accepted a
    /// reduced compliance posture.
    Weak,
}

impl ConsentStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsentStrategy::Strict => "strict",
            ConsentStrategy::Balanced => "balanced",
            ConsentStrategy::Weak => "weak",
        }
    }

    /// Unknown strategy strings fall back to balanced (allowed unless
    /// explicitly denied), preserving upstream behavior.
    pub fn parse(s: &str) -> Self {
        match s {
            "strict" => ConsentStrategy::Strict,
            "weak" => ConsentStrategy::Weak,
            _ => ConsentStrategy::Balanced,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsentDecision {
    pub allowed: bool,
    pub reason: &'static str,
}

impl ConsentDecision {
    fn allow(reason: &'static str) -> Self {
        Self { allowed: true, reason }
    }

    fn deny(reason: &'static str) -> Self {
        Self { allowed: false, reason }
    }
}

/// Evaluate a consent strategy against an observed signal.
///
/// `state` is `None` when no receipt (and therefore no signal) was
/// observed for the event.
pub fn evaluate(strategy: ConsentStrategy, state: Option<&ConsentState>) -> ConsentDecision {
    match strategy {
        ConsentStrategy::Weak => ConsentDecision::allow("weak strategy always allows"),
        ConsentStrategy::Strict => match state {
            Some(cs) if cs.marketing == Some(true) => {
                ConsentDecision::allow("explicit marketing opt-in")
            }
            Some(_) => ConsentDecision::deny("strict strategy requires explicit marketing opt-in"),
            None => ConsentDecision::deny("strict strategy: no consent signal observed"),
        },
        ConsentStrategy::Balanced => match state {
            Some(cs) if cs.marketing == Some(false) => {
                ConsentDecision::deny("marketing consent explicitly withdrawn")
            }
            Some(_) => ConsentDecision::allow("no explicit denial observed"),
            None => ConsentDecision::deny("no consent signal observed"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(marketing: Option<bool>) -> ConsentState {
        ConsentState { marketing, analytics: None }
    }

    #[test]
    fn strict_denies_absent_signal() {
        assert!(!evaluate(ConsentStrategy::Strict, None).allowed);
    }

    #[test]
    fn strict_denies_unanswered_marketing() {
        let cs = state(None);
        assert!(!evaluate(ConsentStrategy::Strict, Some(&cs)).allowed);
    }

    #[test]
    fn strict_requires_explicit_opt_in() {
        let yes = state(Some(true));
        let no = state(Some(false));
        assert!(evaluate(ConsentStrategy::Strict, Some(&yes)).allowed);
        assert!(!evaluate(ConsentStrategy::Strict, Some(&no)).allowed);
    }

    #[test]
    fn balanced_denies_explicit_refusal() {
        let no = state(Some(false));
        assert!(!evaluate(ConsentStrategy::Balanced, Some(&no)).allowed);
    }

    #[test]
    fn balanced_allows_opt_in_and_unanswered() {
        let yes = state(Some(true));
        let unanswered = state(None);
        assert!(evaluate(ConsentStrategy::Balanced, Some(&yes)).allowed);
        assert!(evaluate(ConsentStrategy::Balanced, Some(&unanswered)).allowed);
    }

    #[test]
    fn balanced_denies_when_no_signal_exists() {
        // Stricter than the name suggests, but this is the observed
        // upstream behavior: absence of any record is not consent.
        assert!(!evaluate(ConsentStrategy::Balanced, None).allowed);
    }

    #[test]
    fn weak_always_allows() {
        let no = state(Some(false));
        assert!(evaluate(ConsentStrategy::Weak, None).allowed);
        assert!(evaluate(ConsentStrategy::Weak, Some(&no)).allowed);
    }

    #[test]
    fn unknown_strategy_parses_to_balanced() {
        assert_eq!(ConsentStrategy::parse("bogus"), ConsentStrategy::Balanced);
        assert_eq!(ConsentStrategy::parse("strict"), ConsentStrategy::Strict);
        assert_eq!(ConsentStrategy::parse("weak"), ConsentStrategy::Weak);
    }
}
