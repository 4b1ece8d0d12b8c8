//! Built-in policy rules

use super::engine::{Decision, PolicyContext, PolicyRule, RuleMatch};
use anyhow::anyhow;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Whether an address must never be the target of a remediation
pub fn is_reserved_address(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_reserved_v4(v4),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => is_reserved_v4(&v4),
            None => is_reserved_v6(v6),
        },
    }
}

fn is_reserved_v4(ip: &Ipv4Addr) -> bool {
    let octets = ip.octets();
    ip.is_loopback()
        || ip.is_unspecified()
        || ip.is_link_local()
        || ip.is_multicast()
        || ip.is_broadcast()
        || ip.is_documentation()
        // 0.0.0.0/8 "this network" and 240.0.0.0/4 future use
        || octets[0] == 0
        || octets[0] >= 240
}

fn is_reserved_v6(ip: &Ipv6Addr) -> bool {
    let segments = ip.segments();
    ip.is_loopback()
        || ip.is_unspecified()
        || ip.is_multicast()
        // fe80::/10
        || (segments[0] & 0xffc0) == 0xfe80
        // 2001:db8::/32
        || (segments[0] == 0x2001 && segments[1] == 0x0db8)
}

/// RFC1918 and IPv6 unique-local addresses
pub fn is_private_address(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private(),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => v4.is_private(),
            // fc00::/7
            None => (v6.segments()[0] & 0xfe00) == 0xfc00,
        },
    }
}

/// Reserved, loopback and other non-routable targets are never acted upon
pub struct ReservedTargetRule;

impl PolicyRule for ReservedTargetRule {
    fn id(&self) -> &str {
        "reserved-target"
    }

    fn priority(&self) -> u32 {
        10
    }

    fn evaluate(&self, context: &PolicyContext) -> anyhow::Result<Option<RuleMatch>> {
        let action = &context.action;
        let target = action.target.trim();

        if target.eq_ignore_ascii_case("localhost") {
            return Ok(Some(RuleMatch::new(
                Decision::Deny,
                format!("target '{}' is a reserved/loopback name", target),
            )));
        }

        match action.target_ip() {
            Some(ip) if is_reserved_address(&ip) => Ok(Some(RuleMatch::new(
                Decision::Deny,
                format!("target {} is a reserved/loopback address", ip),
            ))),
            Some(_) => Ok(None),
            None if action.targets_network() => Err(anyhow!(
                "target '{}' of {} is not an IP address",
                target,
                action.name
            )),
            None => Ok(None),
        }
    }
}

/// Acting on internal addresses in production needs a human decision
pub struct PrivateRangeProductionRule;

impl PolicyRule for PrivateRangeProductionRule {
    fn id(&self) -> &str {
        "private-range-production"
    }

    fn priority(&self) -> u32 {
        20
    }

    fn evaluate(&self, context: &PolicyContext) -> anyhow::Result<Option<RuleMatch>> {
        if !context.environment.is_production() {
            return Ok(None);
        }

        Ok(context
            .action
            .target_ip()
            .filter(is_private_address)
            .map(|ip| {
                RuleMatch::new(
                    Decision::RequireApproval,
                    format!("target {} is in a private range in production", ip),
                )
            }))
    }
}

/// Outside production nothing runs for real
pub struct NonProductionRule;

impl PolicyRule for NonProductionRule {
    fn id(&self) -> &str {
        "non-production-environment"
    }

    fn priority(&self) -> u32 {
        30
    }

    fn evaluate(&self, context: &PolicyContext) -> anyhow::Result<Option<RuleMatch>> {
        if context.environment.is_production() {
            return Ok(None);
        }

        Ok(Some(RuleMatch::new(
            Decision::DryRunOnly,
            format!("environment '{}' is not production", context.environment),
        )))
    }
}

/// Action types without a track record only run as dry runs
pub struct NewActionTypeRule {
    known: HashSet<String>,
}

impl NewActionTypeRule {
    pub fn new(known: impl IntoIterator<Item = String>) -> Self {
        Self {
            known: known.into_iter().map(|name| name.to_lowercase()).collect(),
        }
    }
}

impl PolicyRule for NewActionTypeRule {
    fn id(&self) -> &str {
        "new-action-type"
    }

    fn priority(&self) -> u32 {
        40
    }

    fn evaluate(&self, context: &PolicyContext) -> anyhow::Result<Option<RuleMatch>> {
        let name = context.action.name.to_lowercase();
        if self.known.contains(&name) {
            return Ok(None);
        }

        Ok(Some(RuleMatch::new(
            Decision::DryRunOnly,
            format!("action type '{}' has not been seen before", name),
        )))
    }
}

/// Configured high-impact actions always need approval
pub struct HighImpactActionRule {
    actions: HashSet<String>,
}

impl HighImpactActionRule {
    pub fn new(actions: impl IntoIterator<Item = String>) -> Self {
        Self {
            actions: actions.into_iter().map(|name| name.to_lowercase()).collect(),
        }
    }
}

impl PolicyRule for HighImpactActionRule {
    fn id(&self) -> &str {
        "high-impact-action"
    }

    fn priority(&self) -> u32 {
        50
    }

    fn evaluate(&self, context: &PolicyContext) -> anyhow::Result<Option<RuleMatch>> {
        let name = context.action.name.to_lowercase();
        if !self.actions.contains(&name) {
            return Ok(None);
        }

        Ok(Some(RuleMatch::new(
            Decision::RequireApproval,
            format!("action type '{}' is high impact", name),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Action, Environment, BLOCK_IP, SUSPEND_USER};

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_reserved_addresses() {
        for reserved in [
            "127.0.0.1",
            "0.0.0.0",
            "169.254.10.1",
            "224.0.0.5",
            "255.255.255.255",
            "192.0.2.7",
            "::1",
            "::",
            "fe80::1",
            "ff02::1",
            "2001:db8::5",
            "::ffff:127.0.0.1",
        ] {
            assert!(is_reserved_address(&ip(reserved)), "{} should be reserved", reserved);
        }

        for public in ["93.184.216.34", "8.8.8.8", "2606:4700::1111", "10.0.0.1"] {
            assert!(!is_reserved_address(&ip(public)), "{} should not be reserved", public);
        }
    }

    #[test]
    fn test_private_addresses() {
        for private in ["10.0.0.1", "172.16.5.4", "192.168.1.1", "fd12:3456::1", "::ffff:10.0.0.1"] {
            assert!(is_private_address(&ip(private)), "{} should be private", private);
        }
        for public in ["93.184.216.34", "172.32.0.1", "2606:4700::1111"] {
            assert!(!is_private_address(&ip(public)), "{} should not be private", public);
        }
    }

    #[test]
    fn test_reserved_rule_ignores_non_network_names() {
        let context = PolicyContext::new(Action::new(SUSPEND_USER, "alice"), Environment::Production);
        assert_eq!(ReservedTargetRule.evaluate(&context).unwrap(), None);
    }

    #[test]
    fn test_reserved_rule_denies_localhost_name() {
        let context = PolicyContext::new(Action::new(BLOCK_IP, "LocalHost"), Environment::Production);
        let matched = ReservedTargetRule.evaluate(&context).unwrap().unwrap();
        assert_eq!(matched.decision, Decision::Deny);
        assert!(matched.reason.contains("reserved/loopback"));
    }

    #[test]
    fn test_private_rule_only_applies_in_production() {
        let staging = PolicyContext::new(Action::new(BLOCK_IP, "10.0.0.8"), Environment::Staging);
        assert_eq!(PrivateRangeProductionRule.evaluate(&staging).unwrap(), None);
    }

    #[test]
    fn test_known_action_types_are_case_insensitive() {
        let rule = NewActionTypeRule::new(vec!["Block_IP".to_string()]);
        let context = PolicyContext::new(Action::new(BLOCK_IP, "8.8.8.8"), Environment::Production);
        assert_eq!(rule.evaluate(&context).unwrap(), None);
    }
}
