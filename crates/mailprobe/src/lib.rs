//! Email address verification engine.
//!
//! Feed an address in, get a structured [`Verdict`] back: a deliverable
//! / not-deliverable decision, a confidence score, and machine-readable
//! reasons. The pipeline runs a lexical classifier, an MX lookup with
//! A/AAAA fallback, and a single-RCPT SMTP probe, with TTL+LRU caches
//! in front of DNS and final verdicts.
//!
//! The engine is a library: it never sends mail, never issues
//! VRFY/EXPN, and mutates nothing beyond its own caches.

pub mod config;
pub mod pipeline;
pub mod rotator;
pub mod verify;

pub use addr_classify::{score, CheckDetails, PatternStore, Verdict};
pub use config::{EngineConfig, StartTlsPolicy};
pub use pipeline::{BatchObserver, EmailValidator};
pub use reply_classify::{Classification, ReasonCode, ReplyOutcome, ServerHint};
pub use rotator::{IdentityRotator, RotatorStats};
pub use smtp_probe::PoolStats;
pub use ttl_lru::CacheStats;
pub use verify::{ProbeOptions, SmtpVerification, SmtpVerifier};
