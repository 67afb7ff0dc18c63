//! SPF (Sender Policy Framework) validation
//!
//! Implements RFC 7208 check_host evaluation: the sender domain's policy
//! record is fetched, parsed, and evaluated left to right against the
//! connecting IP. The first matching mechanism decides the result; DNS
//! usage is bounded by the RFC lookup budget.

use anyhow::{anyhow, bail, Result};
use ipnet::{Ipv4Net, Ipv6Net};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::dns::{DnsError, DnsResolver, SystemResolver};
use crate::matcher::ip_matches_with_prefix;
use mailgate_common::config::AuthConfig;

/// SPF check result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpfResult {
    /// The sending IP is authorized
    Pass,
    /// The sending IP is explicitly not authorized
    Fail,
    /// The sending IP is probably not authorized (soft fail)
    SoftFail,
    /// The domain owner has no opinion
    Neutral,
    /// No SPF record found
    None,
    /// Temporary error (DNS timeout, etc.)
    TempError,
    /// Permanent error (invalid SPF record, lookup budget exceeded)
    PermError,
}

impl SpfResult {
    /// Convert to header value for Received-SPF / Authentication-Results
    pub fn as_header_value(&self) -> &'static str {
        match self {
            SpfResult::Pass => "pass",
            SpfResult::Fail => "fail",
            SpfResult::SoftFail => "softfail",
            SpfResult::Neutral => "neutral",
            SpfResult::None => "none",
            SpfResult::TempError => "temperror",
            SpfResult::PermError => "permerror",
        }
    }
}

/// Complete result of an SPF check
#[derive(Debug, Clone)]
pub struct SpfCheckResult {
    /// Evaluation outcome
    pub result: SpfResult,
    /// The domain whose policy was evaluated
    pub domain: String,
    /// Text of the mechanism that matched, if any
    pub mechanism: Option<String>,
    /// Failure detail for temperror/permerror results
    pub error: Option<String>,
}

impl SpfCheckResult {
    fn new(result: SpfResult, domain: &str) -> Self {
        Self {
            result,
            domain: domain.to_string(),
            mechanism: None,
            error: None,
        }
    }
}

/// SPF qualifier (mechanism prefix)
#[derive(Debug, Clone, Copy, PartialEq)]
enum Qualifier {
    Pass,     // + (default)
    Fail,     // -
    SoftFail, // ~
    Neutral,  // ?
}

impl Qualifier {
    fn to_result(self) -> SpfResult {
        match self {
            Qualifier::Pass => SpfResult::Pass,
            Qualifier::Fail => SpfResult::Fail,
            Qualifier::SoftFail => SpfResult::SoftFail,
            Qualifier::Neutral => SpfResult::Neutral,
        }
    }
}

/// SPF mechanism types
#[derive(Debug, Clone)]
enum Mechanism {
    All,
    A {
        domain: Option<String>,
        prefix: Option<u8>,
    },
    Mx {
        domain: Option<String>,
        prefix: Option<u8>,
    },
    Ip4(Ipv4Net),
    Ip6(Ipv6Net),
    Include(String),
    Exists(String),
    Ptr(Option<String>),
}

impl Mechanism {
    /// Whether evaluating this mechanism consumes the DNS lookup budget
    fn requires_lookup(&self) -> bool {
        matches!(
            self,
            Mechanism::A { .. }
                | Mechanism::Mx { .. }
                | Mechanism::Include(_)
                | Mechanism::Exists(_)
                | Mechanism::Ptr(_)
        )
    }
}

/// Parsed SPF directive (qualifier + mechanism)
#[derive(Debug, Clone)]
struct Directive {
    qualifier: Qualifier,
    mechanism: Mechanism,
    text: String,
}

/// Parsed SPF record: ordered directives plus an optional redirect target
#[derive(Debug, Clone)]
struct SpfRecord {
    directives: Vec<Directive>,
    redirect: Option<String>,
}

#[derive(Debug)]
struct EvalOutcome {
    result: SpfResult,
    mechanism: Option<String>,
}

impl EvalOutcome {
    fn of(result: SpfResult) -> Self {
        Self {
            result,
            mechanism: None,
        }
    }
}

/// SPF validator
pub struct SpfValidator {
    resolver: Arc<dyn DnsResolver>,
    timeout: Duration,
    max_lookups: usize,
}

impl SpfValidator {
    /// Create a validator using the system DNS resolver
    pub fn new() -> Self {
        Self::with_resolver(Arc::new(SystemResolver::new()))
    }

    /// Create a validator with an injected resolver
    pub fn with_resolver(resolver: Arc<dyn DnsResolver>) -> Self {
        Self {
            resolver,
            timeout: Duration::from_secs(10),
            max_lookups: 10, // RFC 7208 limit
        }
    }

    /// Create a validator from configuration, using the system resolver
    pub fn from_config(config: &AuthConfig) -> Self {
        let mut validator = Self::new();
        validator.timeout = Duration::from_secs(config.dns_timeout_secs);
        validator.max_lookups = config.max_dns_lookups;
        validator
    }

    /// Check whether `ip` may send mail for `sender_domain`.
    ///
    /// When the envelope sender is empty (bounce messages), the HELO
    /// domain is checked instead. The whole check runs under the
    /// configured DNS timeout; an elapsed timeout yields `temperror`.
    pub async fn check(
        &self,
        ip: IpAddr,
        sender_domain: &str,
        helo_domain: &str,
    ) -> SpfCheckResult {
        let domain = if sender_domain.is_empty() {
            helo_domain
        } else {
            sender_domain
        };

        let result = match tokio::time::timeout(self.timeout, self.check_host(ip, domain)).await {
            Ok(result) => result,
            Err(_) => {
                let mut result = SpfCheckResult::new(SpfResult::TempError, domain);
                result.error = Some("SPF evaluation timed out".to_string());
                result
            }
        };

        debug!(
            "SPF check completed for {} from {}: {} ({})",
            domain,
            ip,
            result.result.as_header_value(),
            result.mechanism.as_deref().unwrap_or("no mechanism")
        );

        result
    }

    async fn check_host(&self, ip: IpAddr, domain: &str) -> SpfCheckResult {
        let record = match self.lookup_spf(domain).await {
            Ok(Some(record)) => record,
            Ok(None) => return SpfCheckResult::new(SpfResult::None, domain),
            Err(e) => {
                warn!("SPF record lookup failed for {}: {}", domain, e);
                let result = if e.is_temporary() {
                    SpfResult::TempError
                } else {
                    SpfResult::None
                };
                let mut check = SpfCheckResult::new(result, domain);
                check.error = Some(e.to_string());
                return check;
            }
        };

        debug!("Found SPF record for {}: {}", domain, record);

        let mut lookups = 0usize;
        let outcome = self.evaluate(&record, ip, domain, &mut lookups).await;

        let mut check = SpfCheckResult::new(outcome.result, domain);
        check.mechanism = outcome.mechanism;

        // Recursion through include can exceed the budget in a frame whose
        // own verdict was already decided; the total still governs.
        if lookups > self.max_lookups {
            check.result = SpfResult::PermError;
            check.error = Some(format!(
                "exceeded maximum DNS lookups ({})",
                self.max_lookups
            ));
        }

        check
    }

    /// Fetch the SPF TXT record for a domain, if any
    async fn lookup_spf(&self, domain: &str) -> Result<Option<String>, DnsError> {
        let records = match self.resolver.lookup_txt(domain).await {
            Ok(records) => records,
            Err(DnsError::NotFound) => return Ok(None),
            Err(e) => return Err(e),
        };

        for record in records {
            if record.starts_with("v=spf1 ") || record == "v=spf1" {
                return Ok(Some(record));
            }
        }

        Ok(None)
    }

    /// Evaluate a record's terms left to right; first match wins.
    ///
    /// The lookup counter is shared across include/redirect recursion.
    fn evaluate<'a>(
        &'a self,
        record: &'a str,
        ip: IpAddr,
        domain: &'a str,
        lookups: &'a mut usize,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = EvalOutcome> + Send + 'a>> {
        Box::pin(async move {
            let parsed = match parse_record(record) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!("Failed to parse SPF record for {}: {}", domain, e);
                    return EvalOutcome::of(SpfResult::PermError);
                }
            };

            for directive in &parsed.directives {
                if directive.mechanism.requires_lookup() {
                    *lookups += 1;
                    if *lookups > self.max_lookups {
                        return EvalOutcome::of(SpfResult::PermError);
                    }
                }

                if self
                    .mechanism_matches(&directive.mechanism, ip, domain, lookups)
                    .await
                {
                    return EvalOutcome {
                        result: directive.qualifier.to_result(),
                        mechanism: Some(directive.text.clone()),
                    };
                }
            }

            // redirect applies only when no mechanism matched
            if let Some(redirect) = &parsed.redirect {
                *lookups += 1;
                if *lookups > self.max_lookups {
                    return EvalOutcome::of(SpfResult::PermError);
                }

                let record = match self.lookup_spf(redirect).await {
                    Ok(Some(record)) => record,
                    _ => return EvalOutcome::of(SpfResult::PermError),
                };
                return self.evaluate(&record, ip, redirect, lookups).await;
            }

            EvalOutcome::of(SpfResult::Neutral)
        })
    }

    async fn mechanism_matches(
        &self,
        mechanism: &Mechanism,
        ip: IpAddr,
        domain: &str,
        lookups: &mut usize,
    ) -> bool {
        match mechanism {
            Mechanism::All => true,

            Mechanism::Ip4(network) => {
                if let IpAddr::V4(ip) = ip {
                    network.contains(&ip)
                } else {
                    false
                }
            }

            Mechanism::Ip6(network) => {
                if let IpAddr::V6(ip) = ip {
                    network.contains(&ip)
                } else {
                    false
                }
            }

            Mechanism::A {
                domain: target,
                prefix,
            } => {
                let target = target.as_deref().unwrap_or(domain);
                match self.resolver.lookup_ip(target).await {
                    Ok(addrs) => addrs
                        .iter()
                        .any(|&candidate| ip_matches_with_prefix(ip, candidate, *prefix)),
                    Err(_) => false,
                }
            }

            Mechanism::Mx {
                domain: target,
                prefix,
            } => {
                let target = target.as_deref().unwrap_or(domain);
                let hosts = match self.resolver.lookup_mx(target).await {
                    Ok(hosts) => hosts,
                    Err(_) => return false,
                };
                for host in hosts {
                    if let Ok(addrs) = self.resolver.lookup_ip(&host).await {
                        if addrs
                            .iter()
                            .any(|&candidate| ip_matches_with_prefix(ip, candidate, *prefix))
                        {
                            return true;
                        }
                    }
                }
                false
            }

            Mechanism::Include(included) => {
                let record = match self.lookup_spf(included).await {
                    Ok(Some(record)) => record,
                    _ => return false,
                };
                let outcome = self.evaluate(&record, ip, included, lookups).await;
                outcome.result == SpfResult::Pass
            }

            Mechanism::Exists(target) => match self.resolver.lookup_ip(target).await {
                Ok(addrs) => addrs.iter().any(|a| a.is_ipv4()),
                Err(_) => false,
            },

            Mechanism::Ptr(target) => {
                let target = target.as_deref().unwrap_or(domain);
                let names = match self.resolver.lookup_ptr(ip).await {
                    Ok(names) => names,
                    Err(_) => return false,
                };
                for name in names {
                    let name = name.trim_end_matches('.');
                    if name != target && !name.ends_with(&format!(".{}", target)) {
                        continue;
                    }
                    // Forward-confirmed reverse DNS: the PTR name must
                    // resolve back to the sending IP
                    if let Ok(addrs) = self.resolver.lookup_ip(name).await {
                        if addrs.contains(&ip) {
                            return true;
                        }
                    }
                }
                false
            }
        }
    }
}

impl Default for SpfValidator {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse an SPF record into directives and modifiers
fn parse_record(record: &str) -> Result<SpfRecord> {
    let mut terms = record.split_whitespace();

    if terms.next() != Some("v=spf1") {
        bail!("invalid SPF record: missing v=spf1");
    }

    let mut directives = Vec::new();
    let mut redirect = None;

    for term in terms {
        if term.contains('=') {
            if let Some(domain) = term.strip_prefix("redirect=") {
                redirect = Some(domain.to_string());
            }
            // exp= and unknown modifiers are parsed but not evaluated
            continue;
        }

        let (qualifier, mechanism_str) = match term.chars().next() {
            Some('+') => (Qualifier::Pass, &term[1..]),
            Some('-') => (Qualifier::Fail, &term[1..]),
            Some('~') => (Qualifier::SoftFail, &term[1..]),
            Some('?') => (Qualifier::Neutral, &term[1..]),
            _ => (Qualifier::Pass, term),
        };

        let mechanism = parse_mechanism(mechanism_str)?;

        directives.push(Directive {
            qualifier,
            mechanism,
            text: mechanism_str.to_string(),
        });
    }

    Ok(SpfRecord {
        directives,
        redirect,
    })
}

/// Parse a single SPF mechanism
fn parse_mechanism(s: &str) -> Result<Mechanism> {
    if s == "all" {
        return Ok(Mechanism::All);
    }

    if s == "a" || s.starts_with("a:") || s.starts_with("a/") {
        let (domain, prefix) = parse_domain_spec(&s[1..])?;
        return Ok(Mechanism::A { domain, prefix });
    }

    if s == "mx" || s.starts_with("mx:") || s.starts_with("mx/") {
        let (domain, prefix) = parse_domain_spec(&s[2..])?;
        return Ok(Mechanism::Mx { domain, prefix });
    }

    if let Some(network) = s.strip_prefix("ip4:") {
        let net: Ipv4Net = if network.contains('/') {
            network
                .parse()
                .map_err(|_| anyhow!("invalid ip4 network: {}", network))?
        } else {
            format!("{}/32", network)
                .parse()
                .map_err(|_| anyhow!("invalid ip4 address: {}", network))?
        };
        return Ok(Mechanism::Ip4(net));
    }

    if let Some(network) = s.strip_prefix("ip6:") {
        let net: Ipv6Net = if network.contains('/') {
            network
                .parse()
                .map_err(|_| anyhow!("invalid ip6 network: {}", network))?
        } else {
            format!("{}/128", network)
                .parse()
                .map_err(|_| anyhow!("invalid ip6 address: {}", network))?
        };
        return Ok(Mechanism::Ip6(net));
    }

    if let Some(domain) = s.strip_prefix("include:") {
        return Ok(Mechanism::Include(domain.to_string()));
    }

    if let Some(domain) = s.strip_prefix("exists:") {
        return Ok(Mechanism::Exists(domain.to_string()));
    }

    if s == "ptr" {
        return Ok(Mechanism::Ptr(None));
    }

    if let Some(domain) = s.strip_prefix("ptr:") {
        return Ok(Mechanism::Ptr(Some(domain.to_string())));
    }

    Err(anyhow!("unknown SPF mechanism: {}", s))
}

/// Parse the `[:domain][/prefix]` tail of an `a`/`mx` mechanism
fn parse_domain_spec(s: &str) -> Result<(Option<String>, Option<u8>)> {
    if s.is_empty() {
        return Ok((None, None));
    }

    if let Some(rest) = s.strip_prefix(':') {
        if let Some((domain, prefix)) = rest.split_once('/') {
            let prefix = prefix
                .parse()
                .map_err(|_| anyhow!("invalid CIDR prefix: {}", prefix))?;
            return Ok((Some(domain.to_string()), Some(prefix)));
        }
        return Ok((Some(rest.to_string()), None));
    }

    if let Some(prefix) = s.strip_prefix('/') {
        let prefix = prefix
            .parse()
            .map_err(|_| anyhow!("invalid CIDR prefix: {}", prefix))?;
        return Ok((None, Some(prefix)));
    }

    Err(anyhow!("malformed mechanism tail: {}", s))
}

/// Generate an SPF record for a domain being provisioned
pub fn generate_spf_record(
    includes: &[String],
    ip4s: &[String],
    ip6s: &[String],
    mx: bool,
    policy: &str,
) -> String {
    let mut parts = vec!["v=spf1".to_string()];

    for include in includes {
        parts.push(format!("include:{}", include));
    }

    if mx {
        parts.push("mx".to_string());
    }

    for ip in ip4s {
        parts.push(format!("ip4:{}", ip));
    }

    for ip in ip6s {
        parts.push(format!("ip6:{}", ip));
    }

    let all = match policy {
        "softfail" => "~all",
        "neutral" => "?all",
        _ => "-all",
    };
    parts.push(all.to_string());

    parts.join(" ")
}
