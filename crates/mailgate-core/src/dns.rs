//! DNS resolution seam for the authentication engines
//!
//! SPF and DMARC evaluation run against the [`DnsResolver`] trait rather
//! than a concrete resolver, so tests inject a fake resolver and
//! production code uses [`SystemResolver`]. No lookup results are cached
//! here; every check re-resolves.

use async_trait::async_trait;
use std::net::IpAddr;
use thiserror::Error;
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::error::{ResolveError, ResolveErrorKind};
use trust_dns_resolver::TokioAsyncResolver;

/// DNS lookup error
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DnsError {
    /// The name exists but has no records of the requested type, or the
    /// name does not exist at all
    #[error("no records found")]
    NotFound,

    /// The lookup did not complete in time
    #[error("DNS lookup timed out")]
    Timeout,

    /// The resolver or an upstream server failed
    #[error("resolver error: {0}")]
    Resolver(String),

    /// Transport-level failure
    #[error("DNS I/O error: {0}")]
    Io(String),
}

impl DnsError {
    /// Whether the failure is transient. Transient failures map to SPF
    /// `temperror`; a missing record maps to `none`.
    pub fn is_temporary(&self) -> bool {
        !matches!(self, DnsError::NotFound)
    }
}

impl From<ResolveError> for DnsError {
    fn from(err: ResolveError) -> Self {
        match err.kind() {
            ResolveErrorKind::NoRecordsFound { .. } => DnsError::NotFound,
            ResolveErrorKind::Timeout => DnsError::Timeout,
            ResolveErrorKind::Io(e) => DnsError::Io(e.to_string()),
            _ => DnsError::Resolver(err.to_string()),
        }
    }
}

/// Context-free DNS operations used by SPF and DMARC evaluation
#[async_trait]
pub trait DnsResolver: Send + Sync {
    /// Look up TXT records, one concatenated string per record
    async fn lookup_txt(&self, domain: &str) -> Result<Vec<String>, DnsError>;

    /// Look up A/AAAA records
    async fn lookup_ip(&self, host: &str) -> Result<Vec<IpAddr>, DnsError>;

    /// Look up MX exchange hostnames in preference order
    async fn lookup_mx(&self, domain: &str) -> Result<Vec<String>, DnsError>;

    /// Reverse-resolve an IP to PTR hostnames (no trailing dot)
    async fn lookup_ptr(&self, ip: IpAddr) -> Result<Vec<String>, DnsError>;
}

/// The system resolver, backed by trust-dns
pub struct SystemResolver {
    resolver: TokioAsyncResolver,
}

impl SystemResolver {
    /// Create a resolver using the default upstream configuration
    pub fn new() -> Self {
        let resolver =
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default());
        Self { resolver }
    }

    /// Wrap an already-configured trust-dns resolver
    pub fn with_resolver(resolver: TokioAsyncResolver) -> Self {
        Self { resolver }
    }
}

impl Default for SystemResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DnsResolver for SystemResolver {
    async fn lookup_txt(&self, domain: &str) -> Result<Vec<String>, DnsError> {
        let lookup = self.resolver.txt_lookup(domain).await?;

        Ok(lookup
            .iter()
            .map(|record| {
                record
                    .txt_data()
                    .iter()
                    .map(|d| String::from_utf8_lossy(d))
                    .collect::<String>()
            })
            .collect())
    }

    async fn lookup_ip(&self, host: &str) -> Result<Vec<IpAddr>, DnsError> {
        let lookup = self.resolver.lookup_ip(host).await?;
        Ok(lookup.iter().collect())
    }

    async fn lookup_mx(&self, domain: &str) -> Result<Vec<String>, DnsError> {
        let lookup = self.resolver.mx_lookup(domain).await?;

        let mut records: Vec<(u16, String)> = lookup
            .iter()
            .map(|mx| {
                let host = mx.exchange().to_utf8();
                (mx.preference(), host.trim_end_matches('.').to_string())
            })
            .collect();
        records.sort_by_key(|(pref, _)| *pref);

        Ok(records.into_iter().map(|(_, host)| host).collect())
    }

    async fn lookup_ptr(&self, ip: IpAddr) -> Result<Vec<String>, DnsError> {
        let lookup = self.resolver.reverse_lookup(ip).await?;

        Ok(lookup
            .iter()
            .map(|ptr| ptr.0.to_utf8().trim_end_matches('.').to_string())
            .collect())
    }
}
