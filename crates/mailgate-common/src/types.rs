//! Common types for Mailgate

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Unique identifier for domains
pub type DomainId = Uuid;

/// Unique identifier for organizations
pub type OrgId = Uuid;

/// Unique identifier for routing rules
pub type RuleId = Uuid;

/// Email address
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EmailAddress {
    pub local: String,
    pub domain: String,
}

impl EmailAddress {
    /// Create a new email address
    pub fn new(local: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            domain: domain.into(),
        }
    }

    /// Parse an email address from a string
    pub fn parse(s: &str) -> Option<Self> {
        let parts: Vec<&str> = s.splitn(2, '@').collect();
        if parts.len() == 2 && !parts[0].is_empty() && !parts[1].is_empty() {
            Some(Self::new(parts[0], parts[1]))
        } else {
            None
        }
    }
}

impl std::fmt::Display for EmailAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.local, self.domain)
    }
}

impl std::str::FromStr for EmailAddress {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| crate::Error::Validation("Invalid email address".to_string()))
    }
}

/// Domain status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainStatus {
    Pending,
    Verified,
    Failed,
    Suspended,
    Deleted,
}

/// A mail domain, as seen by the admission pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Domain {
    pub id: DomainId,
    pub organization_id: OrgId,
    pub name: String,
    pub status: DomainStatus,
    #[serde(default)]
    pub is_primary: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Routing action kinds
///
/// Reject, discard, and quarantine are terminal: once one of them is
/// chosen for a recipient, no further processing happens for the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteAction {
    Deliver,
    Forward,
    Redirect,
    Reject,
    Quarantine,
    Discard,
}

impl RouteAction {
    /// Whether this action ends all processing for the message
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RouteAction::Reject | RouteAction::Quarantine | RouteAction::Discard
        )
    }
}

impl std::fmt::Display for RouteAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RouteAction::Deliver => "deliver",
            RouteAction::Forward => "forward",
            RouteAction::Redirect => "redirect",
            RouteAction::Reject => "reject",
            RouteAction::Quarantine => "quarantine",
            RouteAction::Discard => "discard",
        };
        write!(f, "{}", s)
    }
}

/// A per-domain routing rule
///
/// Rules are operator-authored configuration. Lower priority values are
/// evaluated first; the first matching rule wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingRule {
    pub id: RuleId,
    pub domain_id: DomainId,
    pub organization_id: OrgId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub priority: i32,
    #[serde(default)]
    pub conditions: RuleConditions,
    pub actions: RuleActions,
    #[serde(default = "default_active")]
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_active() -> bool {
    true
}

/// Conditions under which a routing rule applies
///
/// Every field is optional; an unset field always matches.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleConditions {
    /// Glob pattern matched against the envelope sender
    #[serde(default)]
    pub sender_pattern: Option<String>,

    /// Glob pattern matched against the recipient being routed
    #[serde(default)]
    pub recipient_pattern: Option<String>,

    /// Glob pattern matched against the message subject
    #[serde(default)]
    pub subject_pattern: Option<String>,

    /// Header to inspect, together with `header_pattern`
    #[serde(default)]
    pub header_name: Option<String>,

    /// Glob pattern matched against the named header's value
    #[serde(default)]
    pub header_pattern: Option<String>,

    /// Minimum message size in bytes (inclusive)
    #[serde(default)]
    pub size_min: Option<i64>,

    /// Maximum message size in bytes (inclusive)
    #[serde(default)]
    pub size_max: Option<i64>,

    /// Required attachment presence
    #[serde(default)]
    pub has_attachment: Option<bool>,
}

/// What to do when a routing rule matches
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleActions {
    /// Action kind
    pub action: RouteAction,

    /// Single forward/redirect target
    #[serde(default)]
    pub target: Option<String>,

    /// Additional forward targets
    #[serde(default)]
    pub forward_to: Vec<String>,

    /// Rewrite the envelope sender
    #[serde(default)]
    pub rewrite_from: Option<String>,

    /// Rewrite the recipient
    #[serde(default)]
    pub rewrite_to: Option<String>,

    /// Headers to add to the message
    #[serde(default)]
    pub add_headers: HashMap<String, String>,

    /// Human-readable reason returned in the SMTP response on reject
    #[serde(default)]
    pub reject_message: Option<String>,

    /// Human-readable reason recorded on quarantine
    #[serde(default)]
    pub quarantine_reason: Option<String>,
}

impl RuleActions {
    /// Build actions for a plain action kind with no targets or rewrites
    pub fn for_action(action: RouteAction) -> Self {
        Self {
            action,
            target: None,
            forward_to: Vec::new(),
            rewrite_from: None,
            rewrite_to: None,
            add_headers: HashMap::new(),
            reject_message: None,
            quarantine_reason: None,
        }
    }
}
