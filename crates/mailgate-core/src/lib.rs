//! Mailgate Core - Inbound message admission engines
//!
//! This crate provides the decision engines a mail server runs for every
//! accepted message: SPF/DMARC sender authentication, ClamAV virus
//! scanning, and rule-based routing. Each engine returns a structured,
//! side-effect-free verdict; the SMTP session handler combines them.

pub mod dns;
pub mod email_auth;
pub mod matcher;
pub mod routing;
pub mod scanner;

pub use dns::{DnsError, DnsResolver, SystemResolver};
pub use email_auth::{
    generate_spf_record, received_spf_header, AuthenticationResult, DmarcCheckResult, DmarcPolicy,
    DmarcResult, DmarcValidator, SpfCheckResult, SpfResult, SpfValidator,
};
pub use matcher::{glob_match, ip_matches_with_prefix};
pub use routing::{DomainProvider, MessageContext, RouteResult, Router};
pub use scanner::{ScanResult, Scanner};
