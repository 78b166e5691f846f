use regex::{Regex, RegexSet, RegexSetBuilder};
use serde::{Deserialize, Serialize};
use smtp_probe::Response;
use std::sync::LazyLock;

/// The label a verifier attaches to the reply it is classifying.
/// An accepted RCPT is labelled `ACCEPTED_LABEL`.
pub const ACCEPTED_LABEL: &str = "Accepted";

#[derive(
    Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Copy, Clone, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ReplyOutcome {
    /// The server committed to delivering to the mailbox.
    Valid,
    /// The server permanently rejected the mailbox.
    Invalid,
    /// Transient condition; nothing definite can be concluded.
    Unknown,
}

#[derive(
    Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Copy, Clone, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ReasonCode {
    Accepted,
    InvalidUser,
    RelayDenied,
    UserReject,
    UserNotLocal,
    MailboxFull,
    InvalidAddressSyntax,
    ServerReject,
    PermanentFailure,
    ServiceUnavailable,
    MailboxBusy,
    Greylisted,
    TemporaryFailure,
}

impl ReasonCode {
    /// Human-readable form suitable for a verdict reason list.
    pub fn describe(&self) -> &'static str {
        match self {
            Self::Accepted => "Recipient accepted by the mail server",
            Self::InvalidUser => "Mailbox does not exist",
            Self::RelayDenied => "Mail server refused to relay for this recipient",
            Self::UserReject => "Mail server rejected the recipient",
            Self::UserNotLocal => "Recipient is not local to the mail server",
            Self::MailboxFull => "Recipient mailbox is full",
            Self::InvalidAddressSyntax => "Mail server rejected the address syntax",
            Self::ServerReject => "Mail server rejected the transaction",
            Self::PermanentFailure => "Permanent failure from the mail server",
            Self::ServiceUnavailable => "Mail service unavailable",
            Self::MailboxBusy => "Recipient mailbox temporarily unavailable",
            Self::Greylisted => "Greylisted; the server wants a retry later",
            Self::TemporaryFailure => "Temporary failure from the mail server",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, PartialOrd, Ord, Copy, Clone, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum HintSeverity {
    Low,
    Medium,
    High,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Copy, Clone, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum HintAction {
    IpRotation,
    DelayAndRetry,
    ExponentialBackoff,
    TryNextMx,
    RetryLater,
    CheckCredentials,
}

/// A non-authoritative observation about the reply text: what kind of
/// server-side condition it resembles and what a sender could do about
/// it.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct ServerHint {
    pub group: String,
    pub severity: HintSeverity,
    pub action: HintAction,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct Classification {
    pub result: ReplyOutcome,
    pub reason_code: ReasonCode,
    pub smtp_code: u16,
    pub detail: String,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub message_analysis: Vec<ServerHint>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub server_hint: Option<ServerHint>,
}

static INVALID_USER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)user.*unknown|recipient.*unknown|no.*mailbox|does.*not.*exist").unwrap()
});
static RELAY_DENIED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)relay.*denied|relaying.*denied").unwrap());
static GREYLISTED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)grey.*list|gray.*list|try.*later").unwrap());

struct HintGroup {
    name: &'static str,
    severity: HintSeverity,
    action: HintAction,
    patterns: &'static [&'static str],
}

const HINT_GROUPS: &[HintGroup] = &[
    HintGroup {
        name: "blocked",
        severity: HintSeverity::High,
        action: HintAction::IpRotation,
        patterns: &[
            r"spamhaus",
            r"blacklist",
            r"block.*list",
            r"blocked.*using",
            r"banned",
            r"poor.*reputation",
            r"\brbl\b",
            r"\bdnsbl\b",
            r"spamcop",
            r"barracuda",
        ],
    },
    HintGroup {
        name: "rate_limited",
        severity: HintSeverity::Medium,
        action: HintAction::DelayAndRetry,
        patterns: &[
            r"rate.*limit",
            r"too.*many.*(connections|messages|recipients)",
            r"throttl",
            r"exceeded.*limit",
            r"slow.*down",
        ],
    },
    HintGroup {
        name: "greylisted",
        severity: HintSeverity::Low,
        action: HintAction::ExponentialBackoff,
        patterns: &[
            r"grey.*list",
            r"gray.*list",
            r"try.*(again.*)?later",
            r"temporarily.*deferred",
        ],
    },
    HintGroup {
        name: "connection_issues",
        severity: HintSeverity::Medium,
        action: HintAction::TryNextMx,
        patterns: &[
            r"connection.*(refused|reset|dropped)",
            r"timed?.*out",
            r"no.*route",
            r"network.*unreachable",
        ],
    },
    HintGroup {
        name: "server_busy",
        severity: HintSeverity::Low,
        action: HintAction::RetryLater,
        patterns: &[
            r"\bbusy\b",
            r"overload",
            r"too.*much.*load",
            r"resources.*unavailable",
            r"insufficient.*storage",
        ],
    },
    HintGroup {
        name: "authentication_issues",
        severity: HintSeverity::Medium,
        action: HintAction::CheckCredentials,
        patterns: &[
            r"\bspf\b",
            r"\bdkim\b",
            r"\bdmarc\b",
            r"not.*authenticated",
            r"not.*authorized",
            r"authentication.*required",
            r"access.*denied",
        ],
    },
];

static HINT_SETS: LazyLock<Vec<RegexSet>> = LazyLock::new(|| {
    HINT_GROUPS
        .iter()
        .map(|group| {
            RegexSetBuilder::new(group.patterns)
                .case_insensitive(true)
                .build()
                .expect("hint patterns compile")
        })
        .collect()
});

/// Scan the reply text for known server-side condition fingerprints.
/// Returns every matching group, most severe first.
pub fn analyze_message(message: &str) -> Vec<ServerHint> {
    let mut hints: Vec<ServerHint> = HINT_GROUPS
        .iter()
        .zip(HINT_SETS.iter())
        .filter(|(_, set)| set.is_match(message))
        .map(|(group, _)| ServerHint {
            group: group.name.to_string(),
            severity: group.severity,
            action: group.action,
        })
        .collect();
    hints.sort_by(|a, b| b.severity.cmp(&a.severity));
    hints
}

/// Map a reply to a verdict, a machine-readable reason code, and an
/// optional remediation hint. Total over every code in 100..=599.
pub fn classify(code: u16, message: &str, label: &str) -> Classification {
    let (result, reason_code) = primary_rule(code, message, label);

    let message_analysis = analyze_message(message);
    let server_hint = message_analysis.first().cloned();

    Classification {
        result,
        reason_code,
        smtp_code: code,
        detail: message.to_string(),
        message_analysis,
        server_hint,
    }
}

pub fn classify_response(response: &Response, label: &str) -> Classification {
    classify(response.code, &response.content, label)
}

fn primary_rule(code: u16, message: &str, label: &str) -> (ReplyOutcome, ReasonCode) {
    if label == ACCEPTED_LABEL && (200..300).contains(&code) {
        return (ReplyOutcome::Valid, ReasonCode::Accepted);
    }

    match code {
        550 if INVALID_USER.is_match(message) => (ReplyOutcome::Invalid, ReasonCode::InvalidUser),
        550 if RELAY_DENIED.is_match(message) => (ReplyOutcome::Invalid, ReasonCode::RelayDenied),
        550 => (ReplyOutcome::Invalid, ReasonCode::UserReject),
        551 => (ReplyOutcome::Invalid, ReasonCode::UserNotLocal),
        552 => (ReplyOutcome::Invalid, ReasonCode::MailboxFull),
        553 => (ReplyOutcome::Invalid, ReasonCode::InvalidAddressSyntax),
        554 | 571 => (ReplyOutcome::Invalid, ReasonCode::ServerReject),
        code if (500..600).contains(&code) => {
            (ReplyOutcome::Invalid, ReasonCode::PermanentFailure)
        }
        421 => (ReplyOutcome::Unknown, ReasonCode::ServiceUnavailable),
        450 => (ReplyOutcome::Unknown, ReasonCode::MailboxBusy),
        451 if GREYLISTED.is_match(message) => (ReplyOutcome::Unknown, ReasonCode::Greylisted),
        451 => (ReplyOutcome::Unknown, ReasonCode::TemporaryFailure),
        452 => (ReplyOutcome::Unknown, ReasonCode::MailboxFull),
        454 => (ReplyOutcome::Unknown, ReasonCode::TemporaryFailure),
        code if (400..500).contains(&code) => {
            (ReplyOutcome::Unknown, ReasonCode::TemporaryFailure)
        }
        code if (200..400).contains(&code) => (ReplyOutcome::Valid, ReasonCode::Accepted),
        _ => (ReplyOutcome::Unknown, ReasonCode::TemporaryFailure),
    }
}
