//! Message routing
//!
//! Evaluates per-domain routing rules against an accepted message and
//! decides, per recipient, whether to deliver locally, hand off
//! externally, or apply an operator-authored action. Rules are evaluated
//! in ascending priority order and the first match wins; recipients with
//! no matching rule fall back to internal/external classification.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::matcher::glob_match;
use mailgate_common::types::{Domain, DomainId, OrgId, RouteAction, RoutingRule, RuleActions};
use mailgate_common::Result;

/// Provides domain and routing rule information to the router.
///
/// The router only reads; all domain mutation happens elsewhere.
#[async_trait]
pub trait DomainProvider: Send + Sync {
    /// Look up a domain by name
    fn get_domain(&self, name: &str) -> Option<Domain>;

    /// Look up a domain by ID
    fn get_domain_by_id(&self, id: DomainId) -> Option<Domain>;

    /// Fetch the routing rules configured for a domain
    async fn get_routing_rules(&self, domain_id: DomainId) -> Result<Vec<RoutingRule>>;

    /// Whether a domain name is internal to an organization
    fn is_domain_internal(&self, org_id: OrgId, domain_name: &str) -> bool;
}

/// Message information for routing decisions
///
/// An immutable envelope snapshot, built once per message by the caller.
#[derive(Debug, Clone)]
pub struct MessageContext {
    /// Envelope sender
    pub from: String,
    /// Envelope recipients, in submission order
    pub to: Vec<String>,
    /// Message subject
    pub subject: String,
    /// Message headers
    pub headers: HashMap<String, String>,
    /// Message size in bytes
    pub size: i64,
    /// Whether the message carries attachments
    pub has_attachment: bool,
    /// Domain the message was accepted for
    pub domain_id: DomainId,
    /// Owning organization
    pub org_id: OrgId,
}

/// The routing decision for one recipient
#[derive(Debug, Clone)]
pub struct RouteResult {
    /// Action to take
    pub action: RouteAction,
    /// Target addresses for forward/redirect actions
    pub targets: Vec<String>,
    /// Rewritten envelope sender
    pub rewrite_from: Option<String>,
    /// Rewritten recipient
    pub rewrite_to: Option<String>,
    /// Headers to add to the message
    pub add_headers: HashMap<String, String>,
    /// Reason returned in the SMTP response on reject
    pub reject_message: Option<String>,
    /// Reason recorded on quarantine
    pub quarantine_reason: Option<String>,
    /// The rule that matched, if any
    pub matched_rule: Option<RoutingRule>,
}

impl RouteResult {
    fn for_action(action: RouteAction) -> Self {
        Self {
            action,
            targets: Vec::new(),
            rewrite_from: None,
            rewrite_to: None,
            add_headers: HashMap::new(),
            reject_message: None,
            quarantine_reason: None,
            matched_rule: None,
        }
    }

    /// Whether this result ends all processing for the message
    pub fn is_terminal(&self) -> bool {
        self.action.is_terminal()
    }
}

/// Message router
pub struct Router {
    provider: Arc<dyn DomainProvider>,
}

impl Router {
    /// Create a new message router
    pub fn new(provider: Arc<dyn DomainProvider>) -> Self {
        Self { provider }
    }

    /// Determine how to route a message, one result per recipient in
    /// input order.
    ///
    /// A rule-fetch failure degrades to default internal/external
    /// classification rather than failing the route.
    pub async fn route(&self, msg: &MessageContext) -> Vec<RouteResult> {
        let mut rules = match self.provider.get_routing_rules(msg.domain_id).await {
            Ok(rules) => rules,
            Err(e) => {
                warn!(
                    "Failed to get routing rules for domain {}: {}",
                    msg.domain_id, e
                );
                Vec::new()
            }
        };

        rules.retain(|rule| rule.is_active);
        // Lower priority value wins; precedence must not depend on the
        // order rules were stored in
        rules.sort_by_key(|rule| rule.priority);

        msg.to
            .iter()
            .map(|recipient| self.route_recipient(msg, recipient, &rules))
            .collect()
    }

    fn route_recipient(
        &self,
        msg: &MessageContext,
        recipient: &str,
        rules: &[RoutingRule],
    ) -> RouteResult {
        for rule in rules {
            if !rule_matches(msg, recipient, rule) {
                continue;
            }

            let mut result = apply_rule(&rule.actions);
            result.matched_rule = Some(rule.clone());

            debug!(
                "Routing rule '{}' matched for {}: {}",
                rule.name, recipient, result.action
            );

            return result;
        }

        let recipient_domain = extract_domain(recipient);
        if self
            .provider
            .is_domain_internal(msg.org_id, &recipient_domain)
        {
            debug!("Internal delivery for {}", recipient);
            RouteResult::for_action(RouteAction::Deliver)
        } else {
            debug!("External delivery for {}", recipient);
            let mut result = RouteResult::for_action(RouteAction::Forward);
            result.targets = vec![recipient.to_string()];
            result
        }
    }
}

/// Check whether every specified condition of a rule holds.
///
/// An unset condition always matches.
fn rule_matches(msg: &MessageContext, recipient: &str, rule: &RoutingRule) -> bool {
    let cond = &rule.conditions;

    if let Some(pattern) = &cond.sender_pattern {
        if !glob_match(pattern, &msg.from) {
            return false;
        }
    }

    if let Some(pattern) = &cond.recipient_pattern {
        if !glob_match(pattern, recipient) {
            return false;
        }
    }

    if let Some(pattern) = &cond.subject_pattern {
        if !glob_match(pattern, &msg.subject) {
            return false;
        }
    }

    if let (Some(name), Some(pattern)) = (&cond.header_name, &cond.header_pattern) {
        let value = msg.headers.get(name).map(String::as_str).unwrap_or("");
        if !glob_match(pattern, value) {
            return false;
        }
    }

    if let Some(min) = cond.size_min {
        if msg.size < min {
            return false;
        }
    }

    if let Some(max) = cond.size_max {
        if msg.size > max {
            return false;
        }
    }

    if let Some(required) = cond.has_attachment {
        if required != msg.has_attachment {
            return false;
        }
    }

    true
}

/// Convert a matched rule's actions into a routing result
fn apply_rule(actions: &RuleActions) -> RouteResult {
    let mut result = RouteResult::for_action(actions.action);

    match actions.action {
        RouteAction::Forward | RouteAction::Redirect => {
            if let Some(target) = &actions.target {
                result.targets.push(target.clone());
            }
            result
                .targets
                .extend(actions.forward_to.iter().cloned());
        }
        RouteAction::Reject => {
            result.reject_message = actions.reject_message.clone();
        }
        RouteAction::Quarantine => {
            result.quarantine_reason = actions.quarantine_reason.clone();
        }
        RouteAction::Deliver | RouteAction::Discard => {}
    }

    result.rewrite_from = actions.rewrite_from.clone();
    result.rewrite_to = actions.rewrite_to.clone();
    result.add_headers = actions.add_headers.clone();

    result
}

/// Extract the lowercased domain part of an email address
fn extract_domain(email: &str) -> String {
    let parts: Vec<&str> = email.split('@').collect();
    if parts.len() != 2 {
        return String::new();
    }
    parts[1].to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use mailgate_common::types::{DomainStatus, RuleConditions};
    use mailgate_common::Error;
    use uuid::Uuid;

    struct MockDomainProvider {
        domains: HashMap<String, Domain>,
        rules: HashMap<DomainId, Vec<RoutingRule>>,
        internal: HashMap<OrgId, Vec<String>>,
        fail_rules: bool,
    }

    impl MockDomainProvider {
        fn new() -> Self {
            Self {
                domains: HashMap::new(),
                rules: HashMap::new(),
                internal: HashMap::new(),
                fail_rules: false,
            }
        }

        fn add_domain(&mut self, domain: Domain) {
            self.domains.insert(domain.name.clone(), domain);
        }

        fn add_routing_rule(&mut self, rule: RoutingRule) {
            self.rules.entry(rule.domain_id).or_default().push(rule);
        }

        fn set_internal_domains(&mut self, org_id: OrgId, domains: &[&str]) {
            self.internal
                .insert(org_id, domains.iter().map(|d| d.to_string()).collect());
        }
    }

    #[async_trait]
    impl DomainProvider for MockDomainProvider {
        fn get_domain(&self, name: &str) -> Option<Domain> {
            self.domains.get(name).cloned()
        }

        fn get_domain_by_id(&self, id: DomainId) -> Option<Domain> {
            self.domains.values().find(|d| d.id == id).cloned()
        }

        async fn get_routing_rules(&self, domain_id: DomainId) -> Result<Vec<RoutingRule>> {
            if self.fail_rules {
                return Err(Error::Routing("rule store unavailable".to_string()));
            }
            Ok(self.rules.get(&domain_id).cloned().unwrap_or_default())
        }

        fn is_domain_internal(&self, org_id: OrgId, domain_name: &str) -> bool {
            self.internal
                .get(&org_id)
                .map(|domains| domains.iter().any(|d| d == domain_name))
                .unwrap_or(false)
        }
    }

    fn domain_id() -> DomainId {
        Uuid::from_u128(1)
    }

    fn org_id() -> OrgId {
        Uuid::from_u128(2)
    }

    fn test_domain() -> Domain {
        Domain {
            id: domain_id(),
            organization_id: org_id(),
            name: "example.com".to_string(),
            status: DomainStatus::Verified,
            is_primary: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn rule(name: &str, priority: i32, conditions: RuleConditions, actions: RuleActions) -> RoutingRule {
        RoutingRule {
            id: Uuid::new_v4(),
            domain_id: domain_id(),
            organization_id: org_id(),
            name: name.to_string(),
            description: None,
            priority,
            conditions,
            actions,
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn message(to: &[&str]) -> MessageContext {
        MessageContext {
            from: "sender@external.com".to_string(),
            to: to.iter().map(|r| r.to_string()).collect(),
            subject: "Test Message".to_string(),
            headers: HashMap::new(),
            size: 0,
            has_attachment: false,
            domain_id: domain_id(),
            org_id: org_id(),
        }
    }

    #[tokio::test]
    async fn test_internal_delivery() {
        let mut provider = MockDomainProvider::new();
        provider.add_domain(test_domain());
        provider.set_internal_domains(org_id(), &["example.com"]);

        let router = Router::new(Arc::new(provider));
        let results = router.route(&message(&["user@example.com"])).await;

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].action, RouteAction::Deliver);
        assert!(results[0].matched_rule.is_none());
    }

    #[tokio::test]
    async fn test_external_delivery() {
        let mut provider = MockDomainProvider::new();
        provider.add_domain(test_domain());
        provider.set_internal_domains(org_id(), &["example.com"]);

        let router = Router::new(Arc::new(provider));
        let results = router.route(&message(&["external@other.com"])).await;

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].action, RouteAction::Forward);
        assert_eq!(results[0].targets, vec!["external@other.com"]);
    }

    #[tokio::test]
    async fn test_multiple_recipients_in_order() {
        let mut provider = MockDomainProvider::new();
        provider.add_domain(test_domain());
        provider.set_internal_domains(org_id(), &["example.com"]);

        let router = Router::new(Arc::new(provider));
        let results = router
            .route(&message(&[
                "user1@example.com",
                "user2@example.com",
                "external@other.com",
            ]))
            .await;

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].action, RouteAction::Deliver);
        assert_eq!(results[1].action, RouteAction::Deliver);
        assert_eq!(results[2].action, RouteAction::Forward);
        assert_eq!(results[2].targets, vec!["external@other.com"]);
    }

    #[tokio::test]
    async fn test_forwarding_rule() {
        let mut provider = MockDomainProvider::new();
        provider.add_domain(test_domain());
        // The recipient's domain is internal, but the rule still wins
        provider.set_internal_domains(org_id(), &["example.com"]);

        let mut actions = RuleActions::for_action(RouteAction::Forward);
        actions.target = Some("admin@example.com".to_string());
        provider.add_routing_rule(rule(
            "Forward all to admin",
            1,
            RuleConditions {
                recipient_pattern: Some("forward@example.com".to_string()),
                ..Default::default()
            },
            actions,
        ));

        let router = Router::new(Arc::new(provider));
        let results = router.route(&message(&["forward@example.com"])).await;

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].action, RouteAction::Forward);
        assert_eq!(results[0].targets, vec!["admin@example.com"]);
        assert_eq!(
            results[0].matched_rule.as_ref().map(|r| r.name.as_str()),
            Some("Forward all to admin")
        );
    }

    #[tokio::test]
    async fn test_reject_rule() {
        let mut provider = MockDomainProvider::new();
        provider.add_domain(test_domain());

        let mut actions = RuleActions::for_action(RouteAction::Reject);
        actions.reject_message = Some("Messages from this domain are not accepted".to_string());
        provider.add_routing_rule(rule(
            "Reject spam senders",
            1,
            RuleConditions {
                sender_pattern: Some("*@spam.com".to_string()),
                ..Default::default()
            },
            actions,
        ));

        let router = Router::new(Arc::new(provider));
        let mut msg = message(&["user@example.com"]);
        msg.from = "spammer@spam.com".to_string();

        let results = router.route(&msg).await;

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].action, RouteAction::Reject);
        assert!(results[0].is_terminal());
        assert!(!results[0]
            .reject_message
            .as_deref()
            .unwrap_or("")
            .is_empty());
    }

    #[tokio::test]
    async fn test_quarantine_rule() {
        let mut provider = MockDomainProvider::new();
        provider.add_domain(test_domain());

        let mut actions = RuleActions::for_action(RouteAction::Quarantine);
        actions.quarantine_reason = Some("Large attachment requires review".to_string());
        provider.add_routing_rule(rule(
            "Quarantine large attachments",
            1,
            RuleConditions {
                has_attachment: Some(true),
                size_min: Some(5 * 1024 * 1024),
                ..Default::default()
            },
            actions,
        ));

        let router = Router::new(Arc::new(provider));
        let mut msg = message(&["user@example.com"]);
        msg.has_attachment = true;
        msg.size = 10 * 1024 * 1024;

        let results = router.route(&msg).await;

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].action, RouteAction::Quarantine);
        assert!(results[0].is_terminal());
        assert!(!results[0]
            .quarantine_reason
            .as_deref()
            .unwrap_or("")
            .is_empty());
    }

    #[tokio::test]
    async fn test_rule_priority_precedence() {
        let mut provider = MockDomainProvider::new();
        provider.add_domain(test_domain());

        // Lower-precedence rule inserted first
        let mut forward = RuleActions::for_action(RouteAction::Forward);
        forward.target = Some("backup@example.com".to_string());
        provider.add_routing_rule(rule(
            "Forward to backup",
            10,
            RuleConditions {
                recipient_pattern: Some("test@example.com".to_string()),
                ..Default::default()
            },
            forward,
        ));

        let mut reject = RuleActions::for_action(RouteAction::Reject);
        reject.reject_message = Some("Testing".to_string());
        provider.add_routing_rule(rule(
            "Reject test",
            1,
            RuleConditions {
                recipient_pattern: Some("test@example.com".to_string()),
                ..Default::default()
            },
            reject,
        ));

        let router = Router::new(Arc::new(provider));
        let results = router.route(&message(&["test@example.com"])).await;

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].action, RouteAction::Reject);
        assert_eq!(
            results[0].matched_rule.as_ref().map(|r| r.name.as_str()),
            Some("Reject test")
        );
    }

    #[tokio::test]
    async fn test_priority_precedence_independent_of_insertion_order() {
        let mut provider = MockDomainProvider::new();
        provider.add_domain(test_domain());

        // Same two rules, higher-precedence rule inserted first this time
        let mut reject = RuleActions::for_action(RouteAction::Reject);
        reject.reject_message = Some("Testing".to_string());
        provider.add_routing_rule(rule(
            "Reject test",
            1,
            RuleConditions {
                recipient_pattern: Some("test@example.com".to_string()),
                ..Default::default()
            },
            reject,
        ));

        let mut forward = RuleActions::for_action(RouteAction::Forward);
        forward.target = Some("backup@example.com".to_string());
        provider.add_routing_rule(rule(
            "Forward to backup",
            10,
            RuleConditions {
                recipient_pattern: Some("test@example.com".to_string()),
                ..Default::default()
            },
            forward,
        ));

        let router = Router::new(Arc::new(provider));
        let results = router.route(&message(&["test@example.com"])).await;

        assert_eq!(results[0].action, RouteAction::Reject);
    }

    #[tokio::test]
    async fn test_inactive_rules_are_skipped() {
        let mut provider = MockDomainProvider::new();
        provider.add_domain(test_domain());
        provider.set_internal_domains(org_id(), &["example.com"]);

        let mut reject = RuleActions::for_action(RouteAction::Reject);
        reject.reject_message = Some("disabled".to_string());
        let mut disabled = rule(
            "Disabled reject",
            1,
            RuleConditions::default(),
            reject,
        );
        disabled.is_active = false;
        provider.add_routing_rule(disabled);

        let router = Router::new(Arc::new(provider));
        let results = router.route(&message(&["user@example.com"])).await;

        assert_eq!(results[0].action, RouteAction::Deliver);
    }

    #[tokio::test]
    async fn test_rule_fetch_failure_degrades_to_defaults() {
        let mut provider = MockDomainProvider::new();
        provider.add_domain(test_domain());
        provider.set_internal_domains(org_id(), &["example.com"]);
        provider.fail_rules = true;

        let router = Router::new(Arc::new(provider));
        let results = router
            .route(&message(&["user@example.com", "external@other.com"]))
            .await;

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].action, RouteAction::Deliver);
        assert_eq!(results[1].action, RouteAction::Forward);
    }

    #[tokio::test]
    async fn test_rule_merges_rewrites_and_headers() {
        let mut provider = MockDomainProvider::new();
        provider.add_domain(test_domain());

        let mut actions = RuleActions::for_action(RouteAction::Forward);
        actions.target = Some("archive@example.com".to_string());
        actions.rewrite_from = Some("archive-bot@example.com".to_string());
        actions
            .add_headers
            .insert("X-Archived".to_string(), "yes".to_string());
        provider.add_routing_rule(rule(
            "Archive copies",
            1,
            RuleConditions::default(),
            actions,
        ));

        let router = Router::new(Arc::new(provider));
        let results = router.route(&message(&["user@example.com"])).await;

        assert_eq!(
            results[0].rewrite_from.as_deref(),
            Some("archive-bot@example.com")
        );
        assert_eq!(results[0].add_headers.get("X-Archived").unwrap(), "yes");
    }

    #[tokio::test]
    async fn test_header_condition() {
        let mut provider = MockDomainProvider::new();
        provider.add_domain(test_domain());
        provider.set_internal_domains(org_id(), &["example.com"]);

        provider.add_routing_rule(rule(
            "Drop list mail",
            1,
            RuleConditions {
                header_name: Some("List-Id".to_string()),
                header_pattern: Some("*announce*".to_string()),
                ..Default::default()
            },
            RuleActions::for_action(RouteAction::Discard),
        ));

        let router = Router::new(Arc::new(provider));

        let mut msg = message(&["user@example.com"]);
        msg.headers
            .insert("List-Id".to_string(), "dev-announce.example.com".to_string());
        let results = router.route(&msg).await;
        assert_eq!(results[0].action, RouteAction::Discard);

        // Header absent: the condition fails and the default applies
        let results = router.route(&message(&["user@example.com"])).await;
        assert_eq!(results[0].action, RouteAction::Deliver);
    }

    #[test]
    fn test_extract_domain() {
        assert_eq!(extract_domain("user@example.com"), "example.com");
        assert_eq!(extract_domain("user@sub.example.com"), "sub.example.com");
        assert_eq!(extract_domain("user@EXAMPLE.COM"), "example.com");
        assert_eq!(extract_domain("user"), "");
        assert_eq!(extract_domain(""), "");
    }
}
