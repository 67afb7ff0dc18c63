//! Email Authentication Module
//!
//! Provides SPF and DMARC evaluation for incoming mail. DKIM signature
//! verification is an external concern; its outcome feeds into DMARC
//! alignment as a list of authenticated domains.

pub mod dmarc;
pub mod spf;

pub use dmarc::{AlignmentMode, DmarcCheckResult, DmarcPolicy, DmarcRecord, DmarcResult, DmarcValidator};
pub use spf::{generate_spf_record, SpfCheckResult, SpfResult, SpfValidator};

use std::net::IpAddr;

/// Combined email authentication result
#[derive(Debug, Clone)]
pub struct AuthenticationResult {
    pub spf: SpfCheckResult,
    pub dmarc: DmarcCheckResult,
}

impl AuthenticationResult {
    /// Create a new authentication result
    pub fn new(spf: SpfCheckResult, dmarc: DmarcCheckResult) -> Self {
        Self { spf, dmarc }
    }

    /// Check whether the message should be accepted based on
    /// authentication results alone. SPF soft failures and missing
    /// policies are accepted; an explicit DMARC reject is not.
    pub fn should_accept(&self) -> bool {
        let spf_ok = matches!(
            self.spf.result,
            SpfResult::Pass | SpfResult::SoftFail | SpfResult::Neutral | SpfResult::None
        );

        let dmarc_ok = !matches!(self.dmarc.result, DmarcResult::Fail(DmarcPolicy::Reject));

        spf_ok && dmarc_ok
    }

    /// Generate an Authentication-Results header value
    pub fn to_header(&self, hostname: &str) -> String {
        format!(
            "{}; spf={} dmarc={}",
            hostname,
            self.spf.result.as_header_value(),
            self.dmarc.result.as_header_value()
        )
    }
}

/// Render the Received-SPF header recorded on messages that continue
/// through the pipeline after the SPF check
pub fn received_spf_header(
    check: &SpfCheckResult,
    client_ip: IpAddr,
    envelope_from: &str,
    helo: &str,
) -> String {
    format!(
        "{} (domain of {}) client-ip={}; envelope-from={}; helo={};",
        check.result.as_header_value(),
        check.domain,
        client_ip,
        envelope_from,
        helo
    )
}
