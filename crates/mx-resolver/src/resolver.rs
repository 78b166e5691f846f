use crate::MxHost;
use async_trait::async_trait;
use hickory_proto::ProtoErrorKind;
use hickory_resolver::{Name, ResolveError, TokioResolver};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq)]
pub enum DnsError {
    #[error("invalid DNS name: {0}")]
    InvalidName(String),
    #[error("DNS: {0}")]
    ResolveFailed(String),
}

impl DnsError {
    pub(crate) fn from_resolve(name: &impl fmt::Display, err: ResolveError) -> Self {
        DnsError::ResolveFailed(format!("failed to query DNS for {name}: {err}"))
    }
}

/// The raw lookups the engine needs. An empty Ok result means the
/// record type does not exist for the name; Err means the query itself
/// failed.
#[async_trait]
pub trait Resolver: Send + Sync + 'static {
    async fn resolve_mx(&self, domain: &str) -> Result<Vec<MxHost>, DnsError>;

    async fn resolve_ip(&self, host: &str) -> Result<Vec<IpAddr>, DnsError>;
}

pub struct HickoryResolver {
    inner: TokioResolver,
}

impl HickoryResolver {
    pub fn new() -> Result<Self, ResolveError> {
        Ok(Self {
            inner: TokioResolver::builder_tokio()?.build(),
        })
    }
}

impl From<TokioResolver> for HickoryResolver {
    fn from(inner: TokioResolver) -> Self {
        Self { inner }
    }
}

/// Distinguish "no such records" from a failed query; hickory reports
/// the former through a NoRecordsFound error kind.
fn is_no_records(err: &ResolveError) -> bool {
    matches!(
        err.proto().map(|err| err.kind()),
        Some(ProtoErrorKind::NoRecordsFound { .. })
    )
}

#[async_trait]
impl Resolver for HickoryResolver {
    async fn resolve_mx(&self, domain: &str) -> Result<Vec<MxHost>, DnsError> {
        let name = Name::from_utf8(domain)
            .map_err(|err| DnsError::InvalidName(format!("invalid name {domain}: {err}")))?;

        match self.inner.mx_lookup(name).await {
            Ok(lookup) => Ok(lookup
                .into_iter()
                .map(|mx| MxHost {
                    priority: mx.preference(),
                    host: normalize_host(&mx.exchange().to_lowercase().to_ascii()),
                })
                .collect()),
            Err(err) if is_no_records(&err) => Ok(vec![]),
            Err(err) => Err(DnsError::from_resolve(&domain, err)),
        }
    }

    async fn resolve_ip(&self, host: &str) -> Result<Vec<IpAddr>, DnsError> {
        let name = Name::from_utf8(host)
            .map_err(|err| DnsError::InvalidName(format!("invalid name {host}: {err}")))?;

        match self.inner.lookup_ip(name).await {
            Ok(lookup) => Ok(lookup.into_iter().collect()),
            Err(err) if is_no_records(&err) => Ok(vec![]),
            Err(err) => Err(DnsError::from_resolve(&host, err)),
        }
    }
}

fn normalize_host(host: &str) -> String {
    host.strip_suffix('.').unwrap_or(host).to_string()
}

/// In-memory resolver for tests: a map of canned answers plus a query
/// counter so cache behaviour can be asserted.
#[derive(Default)]
pub struct TestResolver {
    mx: Mutex<HashMap<String, Result<Vec<MxHost>, DnsError>>>,
    ips: Mutex<HashMap<String, Vec<IpAddr>>>,
    mx_queries: AtomicUsize,
    ip_queries: AtomicUsize,
}

impl TestResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mx(self, domain: &str, records: Vec<(u16, &str)>) -> Self {
        self.mx.lock().insert(
            domain.to_ascii_lowercase(),
            Ok(records
                .into_iter()
                .map(|(priority, host)| MxHost {
                    priority,
                    host: host.to_string(),
                })
                .collect()),
        );
        self
    }

    pub fn with_mx_error(self, domain: &str, error: &str) -> Self {
        self.mx.lock().insert(
            domain.to_ascii_lowercase(),
            Err(DnsError::ResolveFailed(error.to_string())),
        );
        self
    }

    pub fn with_ip(self, host: &str, addrs: Vec<IpAddr>) -> Self {
        self.ips.lock().insert(host.to_ascii_lowercase(), addrs);
        self
    }

    pub fn mx_queries(&self) -> usize {
        self.mx_queries.load(Ordering::SeqCst)
    }

    pub fn ip_queries(&self) -> usize {
        self.ip_queries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Resolver for TestResolver {
    async fn resolve_mx(&self, domain: &str) -> Result<Vec<MxHost>, DnsError> {
        self.mx_queries.fetch_add(1, Ordering::SeqCst);
        match self.mx.lock().get(&domain.to_ascii_lowercase()) {
            Some(answer) => answer.clone(),
            None => Ok(vec![]),
        }
    }

    async fn resolve_ip(&self, host: &str) -> Result<Vec<IpAddr>, DnsError> {
        self.ip_queries.fetch_add(1, Ordering::SeqCst);
        match self.ips.lock().get(&host.to_ascii_lowercase()) {
            Some(addrs) => Ok(addrs.clone()),
            None => Ok(vec![]),
        }
    }
}
