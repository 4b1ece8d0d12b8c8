//! Ordered rule evaluation with most-restrictive-wins resolution

use crate::models::{Action, Environment, PolicySettings, RemediationRequest, Severity};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, warn};

use super::rules::{
    HighImpactActionRule, NewActionTypeRule, NonProductionRule, PrivateRangeProductionRule,
    ReservedTargetRule,
};

/// Policy decision. Variants are declared from least to most restrictive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    Allow,
    RequireApproval,
    DryRunOnly,
    Deny,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Decision::Allow => "ALLOW",
            Decision::RequireApproval => "REQUIRE_APPROVAL",
            Decision::DryRunOnly => "DRY_RUN_ONLY",
            Decision::Deny => "DENY",
        };
        f.write_str(name)
    }
}

/// Everything a rule may look at
#[derive(Debug, Clone)]
pub struct PolicyContext {
    pub action: Action,
    pub environment: Environment,
    pub severity: Severity,
    pub requested_by: String,
}

impl PolicyContext {
    pub fn new(action: Action, environment: Environment) -> Self {
        Self {
            action,
            environment,
            severity: Severity::Medium,
            requested_by: String::new(),
        }
    }

    pub fn from_request(request: &RemediationRequest) -> Self {
        Self {
            action: request.to_action(),
            environment: request.environment,
            severity: request.severity,
            requested_by: request.requested_by.clone(),
        }
    }
}

/// A single rule's verdict
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleMatch {
    pub decision: Decision,
    pub reason: String,
}

impl RuleMatch {
    pub fn new(decision: Decision, reason: impl Into<String>) -> Self {
        Self {
            decision,
            reason: reason.into(),
        }
    }
}

/// A predicate over the policy context.
///
/// `Ok(None)` means the rule does not apply. An `Err` fails closed: the engine
/// turns it into a DENY carrying the error text.
pub trait PolicyRule: Send + Sync {
    /// Stable identifier reported in verdicts
    fn id(&self) -> &str;

    /// Lower values run first
    fn priority(&self) -> u32;

    fn evaluate(&self, context: &PolicyContext) -> anyhow::Result<Option<RuleMatch>>;
}

/// Resolved outcome of a policy evaluation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyVerdict {
    pub decision: Decision,
    pub reasons: Vec<String>,
    pub matched_rule_ids: Vec<String>,
}

impl PolicyVerdict {
    fn deny(rule_id: &str, reason: String) -> Self {
        Self {
            decision: Decision::Deny,
            reasons: vec![reason],
            matched_rule_ids: vec![rule_id.to_string()],
        }
    }
}

/// Evaluates rules in priority order. Holds no mutable state, so one engine
/// can be shared across any number of workers.
pub struct PolicyEngine {
    rules: Vec<Box<dyn PolicyRule>>,
}

impl Default for PolicyEngine {
    fn default() -> Self {
        Self::with_builtin_rules(&PolicySettings::default())
    }
}

impl PolicyEngine {
    /// Engine without any rules; everything is allowed
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Engine with the shipped rule set
    pub fn with_builtin_rules(settings: &PolicySettings) -> Self {
        let mut engine = Self::empty();
        engine.register(Box::new(ReservedTargetRule));
        engine.register(Box::new(PrivateRangeProductionRule));
        engine.register(Box::new(NonProductionRule));
        engine.register(Box::new(NewActionTypeRule::new(
            settings.known_action_types.iter().cloned(),
        )));
        engine.register(Box::new(HighImpactActionRule::new(
            settings.approval_required_actions.iter().cloned(),
        )));
        engine
    }

    /// Add a rule, keeping the list ordered by priority (stable for ties)
    pub fn register(&mut self, rule: Box<dyn PolicyRule>) {
        let position = self
            .rules
            .iter()
            .position(|existing| existing.priority() > rule.priority())
            .unwrap_or(self.rules.len());
        self.rules.insert(position, rule);
    }

    /// Identifiers of the registered rules, in evaluation order
    pub fn rule_ids(&self) -> Vec<String> {
        self.rules.iter().map(|rule| rule.id().to_string()).collect()
    }

    pub fn evaluate(&self, context: &PolicyContext) -> PolicyVerdict {
        let mut decision = Decision::Allow;
        let mut reasons = Vec::new();
        let mut matched_rule_ids = Vec::new();

        for rule in &self.rules {
            match rule.evaluate(context) {
                Ok(None) => {}
                Ok(Some(RuleMatch {
                    decision: Decision::Deny,
                    reason,
                })) => {
                    debug!(rule = rule.id(), action = %context.action, "Policy denied action");
                    return PolicyVerdict::deny(rule.id(), reason);
                }
                Ok(Some(matched)) => {
                    decision = decision.max(matched.decision);
                    reasons.push(matched.reason);
                    matched_rule_ids.push(rule.id().to_string());
                }
                Err(e) => {
                    warn!(rule = rule.id(), action = %context.action, error = %e, "Policy rule failed; denying");
                    return PolicyVerdict::deny(
                        rule.id(),
                        format!("rule '{}' failed to evaluate: {}", rule.id(), e),
                    );
                }
            }
        }

        if matched_rule_ids.is_empty() {
            reasons.push("no policy rule matched; action allowed".to_string());
        }

        PolicyVerdict {
            decision,
            reasons,
            matched_rule_ids,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BLOCK_IP, SUSPEND_SESSION, SUSPEND_USER};

    struct FixedRule {
        id: &'static str,
        priority: u32,
        decision: Option<Decision>,
    }

    impl PolicyRule for FixedRule {
        fn id(&self) -> &str {
            self.id
        }

        fn priority(&self) -> u32 {
            self.priority
        }

        fn evaluate(&self, _context: &PolicyContext) -> anyhow::Result<Option<RuleMatch>> {
            Ok(self
                .decision
                .map(|decision| RuleMatch::new(decision, format!("{} matched", self.id))))
        }
    }

    struct BrokenRule;

    impl PolicyRule for BrokenRule {
        fn id(&self) -> &str {
            "broken"
        }

        fn priority(&self) -> u32 {
            5
        }

        fn evaluate(&self, _context: &PolicyContext) -> anyhow::Result<Option<RuleMatch>> {
            anyhow::bail!("lookup table unavailable")
        }
    }

    fn context(action: &str, target: &str, environment: Environment) -> PolicyContext {
        PolicyContext::new(Action::new(action, target), environment)
    }

    #[test]
    fn test_loopback_is_denied() {
        let verdict =
            PolicyEngine::default().evaluate(&context(BLOCK_IP, "127.0.0.1", Environment::Production));

        assert_eq!(verdict.decision, Decision::Deny);
        assert!(verdict.reasons.iter().any(|r| r.contains("reserved/loopback")));
        assert_eq!(verdict.matched_rule_ids, vec!["reserved-target".to_string()]);
    }

    #[test]
    fn test_public_target_in_production_is_allowed() {
        let verdict = PolicyEngine::default().evaluate(&context(
            BLOCK_IP,
            "93.184.216.34",
            Environment::Production,
        ));

        assert_eq!(verdict.decision, Decision::Allow);
        assert!(verdict.matched_rule_ids.is_empty());
        assert_eq!(verdict.reasons.len(), 1);
    }

    #[test]
    fn test_private_target_in_production_requires_approval() {
        let verdict =
            PolicyEngine::default().evaluate(&context(BLOCK_IP, "10.1.2.3", Environment::Production));

        assert_eq!(verdict.decision, Decision::RequireApproval);
        assert_eq!(
            verdict.matched_rule_ids,
            vec!["private-range-production".to_string()]
        );
    }

    #[test]
    fn test_dry_run_outranks_approval_and_reasons_concatenate() {
        let verdict = PolicyEngine::default().evaluate(&context(
            "quarantine_host",
            "10.1.2.3",
            Environment::Production,
        ));

        assert_eq!(verdict.decision, Decision::DryRunOnly);
        assert_eq!(
            verdict.matched_rule_ids,
            vec![
                "private-range-production".to_string(),
                "new-action-type".to_string()
            ]
        );
        assert_eq!(verdict.reasons.len(), 2);
    }

    #[test]
    fn test_new_action_type_does_not_override_deny() {
        let verdict = PolicyEngine::default().evaluate(&context(
            "quarantine_host",
            "localhost",
            Environment::Production,
        ));

        assert_eq!(verdict.decision, Decision::Deny);
    }

    #[test]
    fn test_staging_is_dry_run_only() {
        let verdict =
            PolicyEngine::default().evaluate(&context(SUSPEND_SESSION, "sess-42", Environment::Staging));

        assert_eq!(verdict.decision, Decision::DryRunOnly);
        assert_eq!(
            verdict.matched_rule_ids,
            vec!["non-production-environment".to_string()]
        );
    }

    #[test]
    fn test_high_impact_action_requires_approval() {
        let verdict =
            PolicyEngine::default().evaluate(&context(SUSPEND_USER, "mallory", Environment::Production));

        assert_eq!(verdict.decision, Decision::RequireApproval);
    }

    #[test]
    fn test_rule_error_fails_closed() {
        let mut engine = PolicyEngine::empty();
        engine.register(Box::new(BrokenRule));

        let verdict = engine.evaluate(&context(SUSPEND_SESSION, "sess-1", Environment::Production));

        assert_eq!(verdict.decision, Decision::Deny);
        assert!(verdict.reasons[0].contains("lookup table unavailable"));
        assert_eq!(verdict.matched_rule_ids, vec!["broken".to_string()]);
    }

    #[test]
    fn test_unparsable_network_target_fails_closed() {
        let verdict = PolicyEngine::default().evaluate(&context(
            BLOCK_IP,
            "not-an-address",
            Environment::Production,
        ));

        assert_eq!(verdict.decision, Decision::Deny);
        assert!(verdict.reasons[0].contains("not-an-address"));
    }

    #[test]
    fn test_rules_run_in_priority_order_and_deny_short_circuits() {
        let mut engine = PolicyEngine::empty();
        engine.register(Box::new(FixedRule {
            id: "late",
            priority: 50,
            decision: Some(Decision::Deny),
        }));
        engine.register(Box::new(FixedRule {
            id: "early",
            priority: 1,
            decision: Some(Decision::RequireApproval),
        }));
        engine.register(Box::new(FixedRule {
            id: "never",
            priority: 99,
            decision: Some(Decision::DryRunOnly),
        }));

        assert_eq!(engine.rule_ids(), vec!["early", "late", "never"]);

        let verdict = engine.evaluate(&context(SUSPEND_SESSION, "s", Environment::Production));
        assert_eq!(verdict.decision, Decision::Deny);
        assert_eq!(verdict.reasons, vec!["late matched".to_string()]);
    }

    #[test]
    fn test_decision_ordering() {
        assert!(Decision::Deny > Decision::DryRunOnly);
        assert!(Decision::DryRunOnly > Decision::RequireApproval);
        assert!(Decision::RequireApproval > Decision::Allow);
    }
}
