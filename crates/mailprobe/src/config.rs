use mx_resolver::MxResolverConfig;
use serde::{Deserialize, Serialize};
use smtp_probe::{PoolConfig, SessionTimeouts};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// When to upgrade a probe session to TLS.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartTlsPolicy {
    /// Require STARTTLS; fail the host if it is not offered.
    On,
    /// Never upgrade.
    Off,
    /// Upgrade when the server advertises it.
    #[default]
    Auto,
}

impl FromStr for StartTlsPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "on" => Ok(Self::On),
            "off" => Ok(Self::Off),
            "auto" => Ok(Self::Auto),
            wat => Err(format!("invalid starttls policy {wat:?}")),
        }
    }
}

/// Everything the engine can be told from the outside. Every field has
/// a usable default; `from_env` overlays `MAILPROBE_*` environment
/// variables on top of those.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub enable_smtp_validation: bool,
    /// Identities presented in EHLO, rotated per target domain.
    pub helo_domains: Vec<String>,
    /// Envelope senders for MAIL FROM, rotated per target domain.
    pub from_addresses: Vec<String>,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    /// Per-host probe attempts beyond the first.
    pub max_retries: u32,
    pub max_connections_per_pool: usize,
    pub max_idle_time_ms: u64,
    pub enable_connection_pooling: bool,
    pub starttls: StartTlsPolicy,
    /// Addresses in flight at once during batch validation.
    pub batch_size: usize,
    pub mx_cache_max_size: usize,
    pub mx_cache_default_ttl_ms: u64,
    pub verdict_cache_max_size: usize,
    pub verdict_cache_ttl_seconds: u64,
    /// Where the pattern files live; None runs with empty rulesets.
    pub pattern_data_dir: Option<PathBuf>,
    /// Whether an unreachable SMTP target still yields a (degraded)
    /// accept. Off turns those into rejects.
    pub accept_on_smtp_unavailable: bool,
    pub smtp_port: u16,
    /// Salt mixed into verdict cache keys; randomized per process when
    /// unset.
    pub cache_salt: Option<String>,
    /// Accept invalid certificates during STARTTLS.
    pub tls_insecure: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enable_smtp_validation: true,
            helo_domains: vec!["verifier.localdomain".to_string()],
            from_addresses: vec!["postmaster@verifier.localdomain".to_string()],
            connect_timeout_ms: 15_000,
            read_timeout_ms: 15_000,
            max_retries: 2,
            max_connections_per_pool: 3,
            max_idle_time_ms: 60_000,
            enable_connection_pooling: true,
            starttls: StartTlsPolicy::Auto,
            batch_size: 10,
            mx_cache_max_size: 1000,
            mx_cache_default_ttl_ms: 300_000,
            verdict_cache_max_size: 1000,
            verdict_cache_ttl_seconds: 86_400,
            pattern_data_dir: None,
            accept_on_smtp_unavailable: true,
            smtp_port: 25,
            cache_salt: None,
            tls_insecure: false,
        }
    }
}

const ENV_PREFIX: &str = "MAILPROBE_";

impl EngineConfig {
    /// Defaults overlaid with any `MAILPROBE_*` environment variables.
    /// List values are comma-separated.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        overlay_env(&mut config);
        config
    }

    pub fn session_timeouts(&self) -> SessionTimeouts {
        SessionTimeouts {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            read_timeout: Duration::from_millis(self.read_timeout_ms),
            starttls_timeout: Duration::from_millis(self.read_timeout_ms),
            ..SessionTimeouts::default()
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            enabled: self.enable_connection_pooling,
            max_per_target: self.max_connections_per_pool,
            idle_timeout: Duration::from_millis(self.max_idle_time_ms),
            ..PoolConfig::default()
        }
    }

    pub fn mx_resolver_config(&self) -> MxResolverConfig {
        MxResolverConfig {
            cache_max_size: self.mx_cache_max_size,
            positive_ttl: Duration::from_millis(self.mx_cache_default_ttl_ms),
            ..MxResolverConfig::default()
        }
    }

    pub fn verdict_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.verdict_cache_ttl_seconds)
    }
}

fn overlay_env(config: &mut EngineConfig) {
    env_parse(&mut config.enable_smtp_validation, "ENABLE_SMTP_VALIDATION");
    env_list(&mut config.helo_domains, "HELO_DOMAINS");
    env_list(&mut config.from_addresses, "FROM_ADDRESSES");
    env_parse(&mut config.connect_timeout_ms, "CONNECT_TIMEOUT_MS");
    env_parse(&mut config.read_timeout_ms, "READ_TIMEOUT_MS");
    env_parse(&mut config.max_retries, "MAX_RETRIES");
    env_parse(
        &mut config.max_connections_per_pool,
        "MAX_CONNECTIONS_PER_POOL",
    );
    env_parse(&mut config.max_idle_time_ms, "MAX_IDLE_TIME_MS");
    env_parse(
        &mut config.enable_connection_pooling,
        "ENABLE_CONNECTION_POOLING",
    );
    env_parse(&mut config.starttls, "STARTTLS");
    env_parse(&mut config.batch_size, "BATCH_SIZE");
    env_parse(&mut config.mx_cache_max_size, "MX_CACHE_MAX_SIZE");
    env_parse(&mut config.mx_cache_default_ttl_ms, "MX_CACHE_DEFAULT_TTL_MS");
    env_parse(&mut config.verdict_cache_max_size, "VERDICT_CACHE_MAX_SIZE");
    env_parse(
        &mut config.verdict_cache_ttl_seconds,
        "VERDICT_CACHE_TTL_SECONDS",
    );
    if let Some(dir) = env_var("PATTERN_DATA_DIR") {
        config.pattern_data_dir = Some(PathBuf::from(dir));
    }
    env_parse(
        &mut config.accept_on_smtp_unavailable,
        "ACCEPT_ON_SMTP_UNAVAILABLE",
    );
    env_parse(&mut config.smtp_port, "SMTP_PORT");
    if let Some(salt) = env_var("CACHE_SALT") {
        config.cache_salt = Some(salt);
    }
    env_parse(&mut config.tls_insecure, "TLS_INSECURE");
}

fn env_var(suffix: &str) -> Option<String> {
    std::env::var(format!("{ENV_PREFIX}{suffix}")).ok()
}

fn env_parse<T: FromStr>(target: &mut T, suffix: &str) {
    if let Some(value) = env_var(suffix) {
        match value.parse() {
            Ok(parsed) => *target = parsed,
            Err(_) => {
                tracing::warn!("ignoring unparseable {ENV_PREFIX}{suffix}={value:?}");
            }
        }
    }
}

fn env_list(target: &mut Vec<String>, suffix: &str) {
    if let Some(value) = env_var(suffix) {
        let items: Vec<String> = value
            .split(',')
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect();
        if items.is_empty() {
            tracing::warn!("ignoring empty {ENV_PREFIX}{suffix}");
        } else {
            *target = items;
        }
    }
}
