use crate::config::StartTlsPolicy;
use crate::rotator::IdentityRotator;
use mx_resolver::MxResolver;
use reply_classify::{classify_response, Classification, ReplyOutcome, ACCEPTED_LABEL};
use serde::Serialize;
use smtp_probe::{
    Checkout, Command, EnhancedStatusCode, SessionError, SessionPool, SessionTimeouts,
    SmtpSession, TlsOptions,
};
use std::sync::Arc;
use std::time::Duration;

const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Per-call overrides for a single verification.
#[derive(Debug, Clone, Default)]
pub struct ProbeOptions {
    pub enable_smtp: Option<bool>,
    pub starttls: Option<StartTlsPolicy>,
    pub max_retries: Option<u32>,
    pub helo_domain: Option<String>,
    pub from: Option<String>,
    pub port: Option<u16>,
    pub verbose: bool,
}

/// What came back from walking the target's mail exchangers.
/// `classification` is present whenever some server actually answered
/// the RCPT (or permanently refused the envelope); it is absent when
/// every host was unreachable.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SmtpVerification {
    pub result: ReplyOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classification: Option<Classification>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enhanced_code: Option<EnhancedStatusCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SmtpVerification {
    fn unreachable(error: String) -> Self {
        Self {
            result: ReplyOutcome::Unknown,
            classification: None,
            enhanced_code: None,
            host: None,
            error: Some(error),
        }
    }
}

enum AttemptOutcome {
    /// Definitive answer; stop walking hosts.
    Final(SmtpVerification),
    /// Transient; retry, or skip to the next host on a timeout.
    Retry {
        verification: SmtpVerification,
        skip_host: bool,
    },
}

/// Walks a domain's mail exchangers in priority order and probes one
/// recipient per conversation, reusing pooled sessions where possible.
pub struct SmtpVerifier {
    resolver: Arc<MxResolver>,
    rotator: Arc<IdentityRotator>,
    pool: SessionPool,
    timeouts: SessionTimeouts,
    tls: TlsOptions,
    starttls: StartTlsPolicy,
    max_retries: u32,
    port: u16,
}

impl SmtpVerifier {
    pub fn new(
        resolver: Arc<MxResolver>,
        rotator: Arc<IdentityRotator>,
        pool: SessionPool,
        timeouts: SessionTimeouts,
        tls: TlsOptions,
        starttls: StartTlsPolicy,
        max_retries: u32,
        port: u16,
    ) -> Self {
        Self {
            resolver,
            rotator,
            pool,
            timeouts,
            tls,
            starttls,
            max_retries,
            port,
        }
    }

    pub fn pool(&self) -> &SessionPool {
        &self.pool
    }

    pub async fn verify(&self, email: &str, opts: &ProbeOptions) -> SmtpVerification {
        let Some((_, domain)) = email.rsplit_once('@') else {
            return SmtpVerification::unreachable(format!("{email} has no domain part"));
        };

        let mx = self.resolver.lookup(domain).await;
        if !mx.has_hosts() {
            return SmtpVerification::unreachable(
                mx.error
                    .clone()
                    .unwrap_or_else(|| format!("no mail exchangers for {domain}")),
            );
        }

        let max_retries = opts.max_retries.unwrap_or(self.max_retries);
        let starttls = opts.starttls.unwrap_or(self.starttls);
        let port = opts.port.unwrap_or(self.port);

        let mut last: Option<SmtpVerification> = None;

        'hosts: for mx_host in &mx.hosts {
            for attempt in 0..=max_retries {
                match self
                    .attempt(&mx_host.host, port, email, domain, opts, starttls)
                    .await
                {
                    AttemptOutcome::Final(verification) => return verification,
                    AttemptOutcome::Retry {
                        verification,
                        skip_host,
                    } => {
                        if opts.verbose {
                            tracing::info!(
                                "attempt {attempt} against {} for {email}: {:?}",
                                mx_host.host,
                                verification.error
                            );
                        }
                        last = Some(verification);
                        if skip_host {
                            continue 'hosts;
                        }
                        if attempt < max_retries {
                            tokio::time::sleep(RETRY_DELAY).await;
                        }
                    }
                }
            }
        }

        let mut verification = last
            .unwrap_or_else(|| SmtpVerification::unreachable("no probe attempts ran".to_string()));
        verification.result = ReplyOutcome::Unknown;
        verification
    }

    async fn attempt(
        &self,
        host: &str,
        port: u16,
        email: &str,
        target_domain: &str,
        opts: &ProbeOptions,
        starttls: StartTlsPolicy,
    ) -> AttemptOutcome {
        let (mut helo, mut from) = self.rotator.credentials(Some(target_domain));
        if let Some(over) = &opts.helo_domain {
            helo = over.clone();
        }
        if let Some(over) = &opts.from {
            from = over.clone();
        }

        let mut session = match self.pool.acquire(host, port).await {
            Checkout::Reused(session) => session,
            Checkout::Fresh { pooled, key } => {
                match self
                    .open_session(host, port, &helo, starttls, pooled, key)
                    .await
                {
                    Ok(session) => session,
                    Err(outcome) => return outcome,
                }
            }
        };

        // MAIL FROM. 5xx settles the verdict; 4xx is worth retrying.
        let mail_resp = match session
            .send_command(&Command::MailFrom {
                address: from.clone(),
            })
            .await
        {
            Ok(resp) => resp,
            Err(err) => {
                self.pool.release(session);
                return self.transport_failure(host, err);
            }
        };

        if mail_resp.code >= 400 {
            let classification = classify_response(&mail_resp, "MAIL FROM");
            let verification = SmtpVerification {
                result: classification.result,
                enhanced_code: mail_resp.enhanced_code,
                classification: Some(classification),
                host: Some(host.to_string()),
                error: None,
            };
            self.finish_conversation(session).await;
            return if mail_resp.code >= 500 {
                AttemptOutcome::Final(verification)
            } else {
                AttemptOutcome::Retry {
                    verification,
                    skip_host: false,
                }
            };
        }

        let rcpt_resp = match session
            .send_command(&Command::RcptTo {
                address: email.to_string(),
            })
            .await
        {
            Ok(resp) => resp,
            Err(err) => {
                self.pool.release(session);
                return self.transport_failure(host, err);
            }
        };

        let label = if (200..300).contains(&rcpt_resp.code) {
            ACCEPTED_LABEL
        } else {
            "RCPT TO"
        };
        let classification = classify_response(&rcpt_resp, label);

        self.finish_conversation(session).await;

        let verification = SmtpVerification {
            result: classification.result,
            enhanced_code: rcpt_resp.enhanced_code,
            classification: Some(classification),
            host: Some(host.to_string()),
            error: None,
        };

        match verification.result {
            ReplyOutcome::Valid | ReplyOutcome::Invalid => AttemptOutcome::Final(verification),
            ReplyOutcome::Unknown => AttemptOutcome::Retry {
                verification,
                skip_host: false,
            },
        }
    }

    /// Connect, read the banner, EHLO, and upgrade to TLS as the policy
    /// demands. Failures come back as the AttemptOutcome to return.
    async fn open_session(
        &self,
        host: &str,
        port: u16,
        helo: &str,
        starttls: StartTlsPolicy,
        pooled: bool,
        key: String,
    ) -> Result<SmtpSession, AttemptOutcome> {
        let mut session = match SmtpSession::connect(host, port, self.timeouts).await {
            Ok(session) => session,
            Err(err) => {
                if pooled {
                    self.pool.abandon(&key);
                }
                return Err(self.transport_failure(host, err));
            }
        };
        if pooled {
            session.set_pool_key(key);
        }

        let banner = match session.read_banner().await {
            Ok(banner) => banner,
            Err(err) => {
                self.pool.release(session);
                return Err(self.transport_failure(host, err));
            }
        };
        if !(200..300).contains(&banner.code) {
            session.quit().await;
            self.pool.release(session);
            return Err(AttemptOutcome::Retry {
                verification: SmtpVerification::unreachable(format!(
                    "{host} greeted with {}",
                    banner.to_single_line()
                )),
                skip_host: false,
            });
        }

        if let Err(err) = session.ehlo(helo).await {
            session.quit().await;
            self.pool.release(session);
            return Err(self.transport_failure(host, err));
        }

        let upgrade = match starttls {
            StartTlsPolicy::Off => false,
            StartTlsPolicy::Auto => session.has_capability("STARTTLS"),
            StartTlsPolicy::On => {
                if !session.has_capability("STARTTLS") {
                    session.quit().await;
                    self.pool.release(session);
                    return Err(AttemptOutcome::Retry {
                        verification: SmtpVerification::unreachable(format!(
                            "{host} does not offer STARTTLS but policy requires it"
                        )),
                        skip_host: false,
                    });
                }
                true
            }
        };

        if upgrade {
            if let Err(err) = session.starttls(&self.tls).await {
                session.quit().await;
                self.pool.release(session);
                return Err(self.transport_failure(host, err));
            }
            // The capability set is only valid for the cleartext
            // session; refresh it over TLS.
            if let Err(err) = session.ehlo(helo).await {
                session.quit().await;
                self.pool.release(session);
                return Err(self.transport_failure(host, err));
            }
        }

        Ok(session)
    }

    /// RSET for the next conversation, QUIT for ephemeral sessions,
    /// then hand the session back to the pool.
    async fn finish_conversation(&self, mut session: SmtpSession) {
        session.rset().await.ok();
        if session.pool_key().is_none() {
            session.quit().await;
        }
        self.pool.release(session);
    }

    fn transport_failure(&self, host: &str, err: SessionError) -> AttemptOutcome {
        let skip_host = err.is_timeout();
        tracing::debug!("probe transport failure against {host}: {err:#}");
        AttemptOutcome::Retry {
            verification: SmtpVerification::unreachable(format!("{host}: {err}")),
            skip_host,
        }
    }
}
