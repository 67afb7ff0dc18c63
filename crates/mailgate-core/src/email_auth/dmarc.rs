//! DMARC (Domain-based Message Authentication, Reporting, and Conformance)
//!
//! Implements RFC 7489 policy discovery and alignment checking. DMARC
//! passes when SPF or DKIM authenticated a domain aligned with the
//! RFC5322.From domain. DKIM signature verification itself lives outside
//! this crate; callers pass in the set of domains whose signatures
//! already verified.

use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::spf::SpfResult;
use crate::dns::{DnsError, DnsResolver, SystemResolver};
use mailgate_common::config::AuthConfig;

/// DMARC policy action requested by the domain owner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DmarcPolicy {
    /// Monitor mode, no action requested
    #[default]
    None,
    /// Treat failing messages with suspicion
    Quarantine,
    /// Reject failing messages
    Reject,
}

impl DmarcPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            DmarcPolicy::None => "none",
            DmarcPolicy::Quarantine => "quarantine",
            DmarcPolicy::Reject => "reject",
        }
    }
}

/// Alignment mode for the SPF/DKIM identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AlignmentMode {
    /// Organizational domains must match
    #[default]
    Relaxed,
    /// Domains must match exactly
    Strict,
}

/// DMARC verification result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmarcResult {
    /// An aligned identifier authenticated
    Pass,
    /// No aligned identifier authenticated; carries the applicable policy
    Fail(DmarcPolicy),
    /// No DMARC record published
    None,
    /// Temporary DNS failure
    TempError,
    /// Malformed DMARC record
    PermError,
}

impl DmarcResult {
    /// Convert to header value for Authentication-Results
    pub fn as_header_value(&self) -> &'static str {
        match self {
            DmarcResult::Pass => "pass",
            DmarcResult::Fail(_) => "fail",
            DmarcResult::None => "none",
            DmarcResult::TempError => "temperror",
            DmarcResult::PermError => "permerror",
        }
    }

    /// The policy requested for a failing message
    pub fn policy(&self) -> Option<DmarcPolicy> {
        match self {
            DmarcResult::Fail(policy) => Some(*policy),
            _ => None,
        }
    }
}

/// Parsed DMARC record
#[derive(Debug, Clone)]
pub struct DmarcRecord {
    /// Policy for the domain (p=)
    pub policy: DmarcPolicy,
    /// Policy for subdomains (sp=)
    pub subdomain_policy: Option<DmarcPolicy>,
    /// Percentage of messages the policy applies to (pct=)
    pub percentage: u8,
    /// DKIM alignment mode (adkim=)
    pub dkim_alignment: AlignmentMode,
    /// SPF alignment mode (aspf=)
    pub spf_alignment: AlignmentMode,
    /// Aggregate report URIs (rua=)
    pub aggregate_report_uri: Option<String>,
    /// Forensic report URIs (ruf=)
    pub forensic_report_uri: Option<String>,
}

impl Default for DmarcRecord {
    fn default() -> Self {
        Self {
            policy: DmarcPolicy::None,
            subdomain_policy: None,
            percentage: 100,
            dkim_alignment: AlignmentMode::Relaxed,
            spf_alignment: AlignmentMode::Relaxed,
            aggregate_report_uri: None,
            forensic_report_uri: None,
        }
    }
}

/// Complete result of a DMARC check
#[derive(Debug, Clone)]
pub struct DmarcCheckResult {
    /// The RFC5322.From domain that was evaluated
    pub domain: String,
    /// Evaluation outcome
    pub result: DmarcResult,
    /// Whether the SPF identifier was aligned and passing
    pub spf_aligned: bool,
    /// Whether a DKIM identifier was aligned
    pub dkim_aligned: bool,
    /// The record that was applied, if one was found
    pub record: Option<DmarcRecord>,
}

/// DMARC validator
pub struct DmarcValidator {
    resolver: Arc<dyn DnsResolver>,
    timeout: Duration,
}

impl DmarcValidator {
    /// Create a validator using the system DNS resolver
    pub fn new() -> Self {
        Self::with_resolver(Arc::new(SystemResolver::new()))
    }

    /// Create a validator with an injected resolver
    pub fn with_resolver(resolver: Arc<dyn DnsResolver>) -> Self {
        Self {
            resolver,
            timeout: Duration::from_secs(10),
        }
    }

    /// Create a validator from configuration, using the system resolver
    pub fn from_config(config: &AuthConfig) -> Self {
        let mut validator = Self::new();
        validator.timeout = Duration::from_secs(config.dns_timeout_secs);
        validator
    }

    /// Evaluate DMARC for a message.
    ///
    /// `dkim_domains` holds the `d=` domains of signatures an external
    /// DKIM verifier accepted; pass an empty slice when none verified.
    pub async fn check(
        &self,
        from_domain: &str,
        mail_from_domain: Option<&str>,
        spf_result: &SpfResult,
        dkim_domains: &[String],
    ) -> DmarcCheckResult {
        let mut check = DmarcCheckResult {
            domain: from_domain.to_string(),
            result: DmarcResult::None,
            spf_aligned: false,
            dkim_aligned: false,
            record: None,
        };

        let fetched = tokio::time::timeout(self.timeout, self.fetch_record(from_domain)).await;
        let (record, from_org_fallback) = match fetched {
            Ok(Ok(Some(found))) => found,
            Ok(Ok(None)) => {
                debug!("No DMARC record found for {}", from_domain);
                return check;
            }
            Ok(Err(e)) => {
                warn!("DMARC record lookup failed for {}: {}", from_domain, e);
                check.result = if e.is_temporary() {
                    DmarcResult::TempError
                } else {
                    DmarcResult::None
                };
                return check;
            }
            Err(_) => {
                check.result = DmarcResult::TempError;
                return check;
            }
        };

        let record = match record {
            Ok(record) => record,
            Err(e) => {
                warn!("Malformed DMARC record for {}: {}", from_domain, e);
                check.result = DmarcResult::PermError;
                return check;
            }
        };

        check.spf_aligned = *spf_result == SpfResult::Pass
            && mail_from_domain
                .map(|d| domains_aligned(from_domain, d, record.spf_alignment))
                .unwrap_or(false);

        check.dkim_aligned = dkim_domains
            .iter()
            .any(|d| domains_aligned(from_domain, d, record.dkim_alignment));

        check.result = if check.spf_aligned || check.dkim_aligned {
            DmarcResult::Pass
        } else {
            // Subdomains fall under sp= when the record came from the
            // organizational domain
            let policy = if from_org_fallback {
                record.subdomain_policy.unwrap_or(record.policy)
            } else {
                record.policy
            };
            DmarcResult::Fail(policy)
        };

        debug!(
            "DMARC check for {}: {} (spf_aligned={}, dkim_aligned={})",
            from_domain,
            check.result.as_header_value(),
            check.spf_aligned,
            check.dkim_aligned
        );

        check.record = Some(record);
        check
    }

    /// Fetch the DMARC record for a domain, falling back to the
    /// organizational domain. The inner result distinguishes "found but
    /// malformed" from DNS-level failures; the bool reports whether the
    /// organizational fallback was used.
    async fn fetch_record(
        &self,
        domain: &str,
    ) -> Result<Option<(Result<DmarcRecord>, bool)>, DnsError> {
        if let Some(txt) = self.lookup_dmarc_txt(domain).await? {
            return Ok(Some((parse_dmarc_record(&txt), false)));
        }

        if let Some(org_domain) = organizational_domain(domain) {
            if org_domain != domain {
                if let Some(txt) = self.lookup_dmarc_txt(&org_domain).await? {
                    return Ok(Some((parse_dmarc_record(&txt), true)));
                }
            }
        }

        Ok(None)
    }

    async fn lookup_dmarc_txt(&self, domain: &str) -> Result<Option<String>, DnsError> {
        let name = format!("_dmarc.{}", domain);
        let records = match self.resolver.lookup_txt(&name).await {
            Ok(records) => records,
            Err(DnsError::NotFound) => return Ok(None),
            Err(e) => return Err(e),
        };

        Ok(records.into_iter().find(|r| r.starts_with("v=DMARC1")))
    }
}

impl Default for DmarcValidator {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse a DMARC record from its TXT value
fn parse_dmarc_record(txt: &str) -> Result<DmarcRecord> {
    let tags = parse_tags(txt);

    if tags.get("v").map(String::as_str) != Some("DMARC1") {
        return Err(anyhow!("invalid DMARC version"));
    }

    let mut record = DmarcRecord::default();

    match tags.get("p") {
        Some(p) => record.policy = parse_policy(p)?,
        None => return Err(anyhow!("missing required p= tag")),
    }

    if let Some(sp) = tags.get("sp") {
        record.subdomain_policy = Some(parse_policy(sp)?);
    }

    if let Some(pct) = tags.get("pct") {
        record.percentage = pct
            .parse()
            .map_err(|_| anyhow!("invalid pct value: {}", pct))?;
    }

    if let Some(adkim) = tags.get("adkim") {
        record.dkim_alignment = parse_alignment(adkim)?;
    }

    if let Some(aspf) = tags.get("aspf") {
        record.spf_alignment = parse_alignment(aspf)?;
    }

    record.aggregate_report_uri = tags.get("rua").cloned();
    record.forensic_report_uri = tags.get("ruf").cloned();

    Ok(record)
}

fn parse_tags(txt: &str) -> HashMap<String, String> {
    let mut tags = HashMap::new();

    for part in txt.split(';') {
        let part = part.trim();
        if let Some(eq_pos) = part.find('=') {
            let name = part[..eq_pos].trim().to_lowercase();
            let value = part[eq_pos + 1..].trim().to_string();
            tags.insert(name, value);
        }
    }

    tags
}

fn parse_policy(s: &str) -> Result<DmarcPolicy> {
    match s.to_lowercase().as_str() {
        "none" => Ok(DmarcPolicy::None),
        "quarantine" => Ok(DmarcPolicy::Quarantine),
        "reject" => Ok(DmarcPolicy::Reject),
        _ => Err(anyhow!("invalid policy: {}", s)),
    }
}

fn parse_alignment(s: &str) -> Result<AlignmentMode> {
    match s.to_lowercase().as_str() {
        "r" => Ok(AlignmentMode::Relaxed),
        "s" => Ok(AlignmentMode::Strict),
        _ => Err(anyhow!("invalid alignment mode: {}", s)),
    }
}

/// Check identifier alignment between the From domain and an
/// authenticated domain
fn domains_aligned(from_domain: &str, auth_domain: &str, mode: AlignmentMode) -> bool {
    let from_domain = from_domain.to_lowercase();
    let auth_domain = auth_domain.to_lowercase();

    match mode {
        AlignmentMode::Strict => from_domain == auth_domain,
        AlignmentMode::Relaxed => {
            let from_org = organizational_domain(&from_domain).unwrap_or(from_domain);
            let auth_org = organizational_domain(&auth_domain).unwrap_or(auth_domain);
            from_org == auth_org
        }
    }
}

/// Organizational domain by the last-two-labels heuristic.
///
/// A Public Suffix List lookup would be more precise; the heuristic
/// matches what the rest of the pipeline assumes.
fn organizational_domain(domain: &str) -> Option<String> {
    let parts: Vec<&str> = domain.split('.').collect();
    if parts.len() >= 2 {
        Some(parts[parts.len() - 2..].join("."))
    } else {
        None
    }
}
