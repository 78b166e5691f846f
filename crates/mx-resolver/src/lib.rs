use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use ttl_lru::{CacheStats, TtlLruCache};

mod resolver;
pub use resolver::{DnsError, HickoryResolver, Resolver, TestResolver};

/// One mail exchanger candidate for a domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MxHost {
    pub priority: u16,
    pub host: String,
}

/// The cached outcome of resolving the mail exchangers for a domain.
/// `hosts` is ordered by ascending priority; an empty list means the
/// domain cannot receive mail, with `error` explaining why.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MxAnswer {
    pub domain: String,
    pub hosts: Vec<MxHost>,
    /// True when real MX records exist; false for the synthesized
    /// fallback host derived from an A/AAAA answer.
    pub is_mx: bool,
    pub error: Option<String>,
}

impl MxAnswer {
    pub fn has_hosts(&self) -> bool {
        !self.hosts.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct MxResolverConfig {
    pub cache_max_size: usize,
    pub positive_ttl: Duration,
    pub negative_ttl: Duration,
}

impl Default for MxResolverConfig {
    fn default() -> Self {
        Self {
            cache_max_size: 1000,
            positive_ttl: Duration::from_secs(300),
            negative_ttl: Duration::from_secs(60),
        }
    }
}

/// MX lookup with A/AAAA fallback, fronted by a TTL+LRU cache.
pub struct MxResolver {
    resolver: Arc<dyn Resolver>,
    cache: TtlLruCache<String, Arc<MxAnswer>>,
    config: MxResolverConfig,
}

impl MxResolver {
    pub fn new(resolver: Arc<dyn Resolver>, config: MxResolverConfig) -> Self {
        Self {
            cache: TtlLruCache::new(config.cache_max_size),
            resolver,
            config,
        }
    }

    /// Resolve the ordered mail exchanger set for `domain`.
    ///
    /// A domain with no MX records falls back to an A/AAAA query and,
    /// when that answers, is treated as its own zero-priority exchanger.
    /// A null MX (single `.` exchange) means the domain has opted out of
    /// receiving mail entirely; no fallback is attempted.
    pub async fn lookup(&self, domain: &str) -> Arc<MxAnswer> {
        let key = domain.to_ascii_lowercase();
        if let Some(answer) = self.cache.get(&key) {
            return answer;
        }

        let (answer, ttl) = self.lookup_uncached(&key).await;
        let answer = Arc::new(answer);
        self.cache.insert(key, answer.clone(), ttl);
        answer
    }

    async fn lookup_uncached(&self, domain: &str) -> (MxAnswer, Duration) {
        let mx_error = match self.resolver.resolve_mx(domain).await {
            Ok(records) if is_null_mx(&records) => {
                tracing::debug!("{domain} has a null MX");
                return (
                    MxAnswer {
                        domain: domain.to_string(),
                        hosts: vec![],
                        is_mx: true,
                        error: Some("domain declines mail (null MX)".to_string()),
                    },
                    self.config.positive_ttl,
                );
            }
            Ok(records) if !records.is_empty() => {
                let mut hosts = records;
                // Stable: equal priorities keep resolver order
                hosts.sort_by_key(|mx| mx.priority);
                return (
                    MxAnswer {
                        domain: domain.to_string(),
                        hosts,
                        is_mx: true,
                        error: None,
                    },
                    self.config.positive_ttl,
                );
            }
            Ok(_) => None,
            Err(err) => Some(err.to_string()),
        };

        // No MX: fall back to the domain's own address records
        match self.resolver.resolve_ip(domain).await {
            Ok(addrs) if !addrs.is_empty() => (
                MxAnswer {
                    domain: domain.to_string(),
                    hosts: vec![MxHost {
                        priority: 0,
                        host: domain.to_string(),
                    }],
                    is_mx: false,
                    error: None,
                },
                self.config.positive_ttl,
            ),
            Ok(_) => (
                MxAnswer {
                    domain: domain.to_string(),
                    hosts: vec![],
                    is_mx: false,
                    error: Some(
                        mx_error.unwrap_or_else(|| "no MX or address records".to_string()),
                    ),
                },
                self.config.negative_ttl,
            ),
            Err(err) => (
                MxAnswer {
                    domain: domain.to_string(),
                    hosts: vec![],
                    is_mx: false,
                    error: Some(mx_error.unwrap_or_else(|| err.to_string())),
                },
                self.config.negative_ttl,
            ),
        }
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn flush_cache(&self) -> usize {
        self.cache.flush()
    }
}

fn is_null_mx(records: &[MxHost]) -> bool {
    records.len() == 1 && matches!(records[0].host.as_str(), "." | "")
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn v4(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(a, b, c, d))
    }

    #[tokio::test]
    async fn sorted_by_priority() {
        let resolver = Arc::new(TestResolver::new().with_mx(
            "example.com",
            vec![
                (20, "alt.mx.example.com"),
                (5, "mx.example.com"),
                (20, "alt2.mx.example.com"),
            ],
        ));
        let mx = MxResolver::new(resolver, MxResolverConfig::default());
        let answer = mx.lookup("example.com").await;
        assert!(answer.has_hosts());
        assert!(answer.is_mx);
        assert_eq!(
            answer
                .hosts
                .iter()
                .map(|h| (h.priority, h.host.as_str()))
                .collect::<Vec<_>>(),
            vec![
                (5, "mx.example.com"),
                (20, "alt.mx.example.com"),
                (20, "alt2.mx.example.com"),
            ]
        );
    }

    #[tokio::test]
    async fn cached_within_ttl_issues_one_query() {
        let resolver = Arc::new(
            TestResolver::new().with_mx("example.com", vec![(10, "mx.example.com")]),
        );
        let mx = MxResolver::new(resolver.clone(), MxResolverConfig::default());

        let first = mx.lookup("example.com").await;
        let second = mx.lookup("EXAMPLE.com").await;
        assert_eq!(first, second);
        assert_eq!(resolver.mx_queries(), 1);

        let stats = mx.cache_stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn a_record_fallback() {
        let resolver = Arc::new(
            TestResolver::new().with_ip("bare.example.com", vec![v4(192, 0, 2, 1)]),
        );
        let mx = MxResolver::new(resolver, MxResolverConfig::default());
        let answer = mx.lookup("bare.example.com").await;
        assert!(answer.has_hosts());
        assert!(!answer.is_mx);
        assert_eq!(
            answer.hosts,
            vec![MxHost {
                priority: 0,
                host: "bare.example.com".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn total_failure_is_negative_with_error() {
        let resolver = Arc::new(TestResolver::new().with_mx_error("broken.example.com", "SERVFAIL"));
        let mx = MxResolver::new(resolver, MxResolverConfig::default());
        let answer = mx.lookup("broken.example.com").await;
        assert!(!answer.has_hosts());
        assert_eq!(answer.error.as_deref(), Some("DNS: SERVFAIL"));
    }

    #[tokio::test]
    async fn null_mx_means_no_mail() {
        let resolver = Arc::new(
            TestResolver::new()
                .with_mx("nomail.example.com", vec![(0, ".")])
                .with_ip("nomail.example.com", vec![v4(192, 0, 2, 2)]),
        );
        let mx = MxResolver::new(resolver.clone(), MxResolverConfig::default());
        let answer = mx.lookup("nomail.example.com").await;
        assert!(!answer.has_hosts());
        assert!(answer.error.is_some());
        // The null MX is authoritative: no address fallback
        assert_eq!(resolver.ip_queries(), 0);
    }
}
