use crate::config::EngineConfig;
use crate::rotator::{IdentityRotator, RotatorStats};
use crate::verify::{ProbeOptions, SmtpVerifier};
use addr_classify::{classify, is_well_formed, score, Outcome, PatternStore, Verdict};
use data_encoding::HEXLOWER;
use futures::stream::StreamExt;
use mx_resolver::{HickoryResolver, MxResolver, Resolver};
use rand::RngCore;
use reply_classify::ReplyOutcome;
use sha2::{Digest, Sha256};
use smtp_probe::{PoolStats, SessionPool, TlsOptions};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use ttl_lru::{CacheStats, TtlLruCache};

/// Progress hook for batch validation. Called after each address
/// completes, in completion order.
pub trait BatchObserver: Send + Sync {
    fn on_progress(&self, completed: usize, total: usize) {
        let _ = (completed, total);
    }
}

struct NoopObserver;
impl BatchObserver for NoopObserver {}

/// The full verification pipeline: lexical classification, MX
/// resolution, SMTP probing, and a salted verdict cache in front of it
/// all.
pub struct EmailValidator {
    config: EngineConfig,
    patterns: Arc<PatternStore>,
    mx: Arc<MxResolver>,
    rotator: Arc<IdentityRotator>,
    verifier: SmtpVerifier,
    verdict_cache: TtlLruCache<String, Verdict>,
    salt: String,
}

impl EmailValidator {
    /// Build against the system resolver.
    pub fn new(config: EngineConfig) -> anyhow::Result<Self> {
        let resolver = HickoryResolver::new()?;
        Self::with_resolver(config, Arc::new(resolver))
    }

    /// Build with an injected resolver; the seam tests use.
    pub fn with_resolver(
        config: EngineConfig,
        resolver: Arc<dyn Resolver>,
    ) -> anyhow::Result<Self> {
        let patterns = Arc::new(match &config.pattern_data_dir {
            Some(dir) => PatternStore::load(dir),
            None => PatternStore::default(),
        });

        let rotator = Arc::new(IdentityRotator::new(
            config.helo_domains.clone(),
            config.from_addresses.clone(),
        )?);

        let mx = Arc::new(MxResolver::new(resolver, config.mx_resolver_config()));

        let pool = SessionPool::new(config.pool_config());
        // The reaper needs a runtime; embedders constructing the
        // validator outside of one get it started lazily instead.
        if tokio::runtime::Handle::try_current().is_ok() {
            pool.start_reaper();
        }

        let verifier = SmtpVerifier::new(
            mx.clone(),
            rotator.clone(),
            pool,
            config.session_timeouts(),
            TlsOptions {
                insecure: config.tls_insecure,
            },
            config.starttls,
            config.max_retries,
            config.smtp_port,
        );

        let salt = match &config.cache_salt {
            Some(salt) => salt.clone(),
            None => {
                let mut bytes = [0u8; 16];
                rand::thread_rng().fill_bytes(&mut bytes);
                HEXLOWER.encode(&bytes)
            }
        };

        let verdict_cache = TtlLruCache::new(config.verdict_cache_max_size);

        Ok(Self {
            config,
            patterns,
            mx,
            rotator,
            verifier,
            verdict_cache,
            salt,
        })
    }

    pub async fn validate_single(&self, email: &str) -> Verdict {
        self.validate_with_options(email, &ProbeOptions::default())
            .await
    }

    pub async fn validate_with_options(&self, email: &str, opts: &ProbeOptions) -> Verdict {
        let started = Instant::now();
        let trimmed = email.trim();

        // Patently malformed input is settled without touching the
        // cache. International addresses always take the full path so
        // the domain gets normalized first.
        if trimmed.is_ascii() && !is_well_formed(trimmed) {
            if let Outcome::Verdict(mut verdict) = classify(trimmed, self.patterns.as_ref()) {
                verdict.processing_time_ms = elapsed_ms(started);
                return verdict;
            }
        }

        let key = self.cache_key(&trimmed.to_lowercase());
        if let Some(mut cached) = self.verdict_cache.get(&key) {
            cached.from_cache = true;
            cached.processing_time_ms = elapsed_ms(started);
            return cached;
        }

        let mut verdict = self.decide(trimmed, opts).await;
        verdict.processing_time_ms = elapsed_ms(started);
        self.verdict_cache
            .insert(key, verdict.clone(), self.config.verdict_cache_ttl());
        verdict
    }

    async fn decide(&self, trimmed: &str, opts: &ProbeOptions) -> Verdict {
        let (email, domain, mut details) = match classify(trimmed, self.patterns.as_ref()) {
            Outcome::Verdict(verdict) => return verdict,
            Outcome::Probe {
                email,
                domain,
                details,
            } => (email, domain, details),
        };

        let mx = self.mx.lookup(&domain).await;
        if !mx.has_hosts() {
            tracing::debug!("{email}: no mail exchangers ({:?})", mx.error);
            return Verdict::rejected(
                email,
                score::NO_MX,
                "No MX record found".to_string(),
                details,
            );
        }
        details.mx = true;

        let enable_smtp = opts
            .enable_smtp
            .unwrap_or(self.config.enable_smtp_validation);
        if !enable_smtp {
            return Verdict {
                valid: true,
                email,
                score: score::DELIVERABLE,
                reason: vec![],
                details,
                suggestion: None,
                smtp_details: None,
                processing_time_ms: 0.0,
                from_cache: false,
            };
        }

        let verification = self.verifier.verify(&email, opts).await;

        match verification.classification {
            Some(classification) => {
                let valid = classification.result == ReplyOutcome::Valid;
                details.smtp = Some(valid);
                let reason = if valid {
                    vec![]
                } else {
                    vec![classification.reason_code.describe().to_string()]
                };
                Verdict {
                    valid,
                    email,
                    score: if valid {
                        score::DELIVERABLE
                    } else {
                        score::SMTP_REJECTED
                    },
                    reason,
                    details,
                    suggestion: None,
                    smtp_details: Some(classification),
                    processing_time_ms: 0.0,
                    from_cache: false,
                }
            }
            None => {
                // Nothing answered. Historically this degrades to an
                // accept on the theory that an unreachable server says
                // nothing about the mailbox.
                details.smtp = Some(false);
                let accept = self.config.accept_on_smtp_unavailable;
                tracing::warn!(
                    "{email}: SMTP verification unavailable ({:?})",
                    verification.error
                );
                Verdict {
                    valid: accept,
                    email,
                    score: if accept {
                        score::SMTP_UNAVAILABLE
                    } else {
                        score::SMTP_REJECTED
                    },
                    reason: vec!["SMTP verification unavailable".to_string()],
                    details,
                    suggestion: None,
                    smtp_details: None,
                    processing_time_ms: 0.0,
                    from_cache: false,
                }
            }
        }
    }

    pub async fn validate_batch(
        &self,
        emails: &[String],
        request_id: Option<&str>,
    ) -> Vec<Verdict> {
        self.validate_batch_observed(emails, request_id, &NoopObserver)
            .await
    }

    /// Deduplicates case-insensitively (first occurrence wins), then
    /// validates with a bounded fan-out. The result order matches the
    /// deduplicated input order regardless of completion order.
    pub async fn validate_batch_observed(
        &self,
        emails: &[String],
        request_id: Option<&str>,
        observer: &dyn BatchObserver,
    ) -> Vec<Verdict> {
        let mut seen = HashSet::new();
        let unique: Vec<String> = emails
            .iter()
            .filter(|email| seen.insert(email.trim().to_lowercase()))
            .cloned()
            .collect();

        let total = unique.len();
        tracing::debug!(
            "validate_batch request_id={} {} addresses ({} after dedup)",
            request_id.unwrap_or("-"),
            emails.len(),
            total
        );

        let mut stream = futures::stream::iter(
            unique
                .into_iter()
                .map(|email| async move { self.validate_single(&email).await }),
        )
        .buffered(self.config.batch_size.max(1));

        let mut verdicts = Vec::with_capacity(total);
        while let Some(verdict) = stream.next().await {
            verdicts.push(verdict);
            observer.on_progress(verdicts.len(), total);
        }
        verdicts
    }

    pub fn verdict_cache_stats(&self) -> CacheStats {
        self.verdict_cache.stats()
    }

    pub fn mx_cache_stats(&self) -> CacheStats {
        self.mx.cache_stats()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.verifier.pool().stats()
    }

    pub fn rotator_stats(&self) -> RotatorStats {
        self.rotator.stats()
    }

    pub fn flush_verdict_cache(&self) -> usize {
        self.verdict_cache.flush()
    }

    /// Stop background work and drop pooled sessions and caches.
    pub fn shutdown(&self) {
        self.verifier.pool().shutdown();
        self.verdict_cache.flush();
        self.mx.flush_cache();
    }

    fn cache_key(&self, lowered: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.salt.as_bytes());
        hasher.update(lowered.as_bytes());
        HEXLOWER.encode(&hasher.finalize())
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cache_keys_are_salted_and_case_insensitive() {
        let a = EmailValidator::with_resolver(
            EngineConfig::default(),
            Arc::new(mx_resolver::TestResolver::new()),
        )
        .unwrap();
        let b = EmailValidator::with_resolver(
            EngineConfig {
                cache_salt: Some("fixed".to_string()),
                ..EngineConfig::default()
            },
            Arc::new(mx_resolver::TestResolver::new()),
        )
        .unwrap();

        assert_eq!(a.cache_key("user@example.com"), a.cache_key("user@example.com"));
        assert_ne!(a.cache_key("user@example.com"), b.cache_key("user@example.com"));
        assert_eq!(b.cache_key("user@example.com").len(), 64);
    }
}
