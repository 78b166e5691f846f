use reply_classify::Classification;
use serde::Serialize;

/// Confidence scores, highest first. These are the only values a
/// verdict may carry.
pub mod score {
    /// Passed every stage (or probing was disabled).
    pub const DELIVERABLE: u8 = 100;
    /// Passed everything except the probe, which was unavailable.
    pub const SMTP_UNAVAILABLE: u8 = 80;
    /// The target's mail server rejected or deferred the mailbox.
    pub const SMTP_REJECTED: u8 = 60;
    /// The domain has no mail exchanger.
    pub const NO_MX: u8 = 30;
    /// The domain looks like a typo of a well-known domain.
    pub const TYPO: u8 = 20;
    /// The domain is a disposable-address provider.
    pub const DISPOSABLE: u8 = 10;
    /// Placeholder/example address or spam-keyword dominated.
    pub const PLACEHOLDER: u8 = 5;
    /// Malformed: length, syntax or character failures.
    pub const MALFORMED: u8 = 0;
}

/// Per-stage pass/fail flags. A flag is true when the address passed
/// that check; `smtp` is None when probing did not run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CheckDetails {
    pub format: bool,
    pub mx: bool,
    pub disposable: bool,
    pub role: bool,
    pub typo: bool,
    pub suspicious: bool,
    pub spam_keywords: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub smtp: Option<bool>,
}

/// The engine's structured decision for one address.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Verdict {
    pub valid: bool,
    /// The normalized address actually checked: original-case local
    /// part at a lowercased, punycode-ASCII domain.
    pub email: String,
    pub score: u8,
    pub reason: Vec<String>,
    pub details: CheckDetails,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub smtp_details: Option<Classification>,
    pub processing_time_ms: f64,
    pub from_cache: bool,
}

impl Verdict {
    pub fn rejected(email: impl Into<String>, score: u8, reason: String, details: CheckDetails) -> Self {
        Self {
            valid: false,
            email: email.into(),
            score,
            reason: vec![reason],
            details,
            suggestion: None,
            smtp_details: None,
            processing_time_ms: 0.0,
            from_cache: false,
        }
    }
}
