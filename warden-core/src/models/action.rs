//! Remediation action data models

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

/// Action types understood out of the box
pub const BLOCK_IP: &str = "block_ip";
pub const UNBLOCK_IP: &str = "unblock_ip";
pub const SUSPEND_SESSION: &str = "suspend_session";
pub const SUSPEND_USER: &str = "suspend_user";

/// A corrective action against a single target. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    /// Action type, e.g. `block_ip`
    pub name: String,
    /// Address, session id or user id the action applies to
    pub target: String,
    /// Extra executor parameters
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, serde_json::Value>,
}

impl Action {
    /// Create an action without parameters
    pub fn new(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            parameters: BTreeMap::new(),
        }
    }

    /// Attach a parameter, builder style
    pub fn with_parameter(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    /// Whether the target of this action is a network address
    pub fn targets_network(&self) -> bool {
        matches!(self.name.as_str(), BLOCK_IP | UNBLOCK_IP)
    }

    /// Target parsed as an IP address, if it is one
    pub fn target_ip(&self) -> Option<IpAddr> {
        self.target.trim().parse().ok()
    }

    /// Canonical form of the target used for fingerprinting
    pub fn normalized_target(&self) -> String {
        normalize_target(&self.target)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.target)
    }
}

/// Trim, lowercase and canonicalize IP literals so `::0001` and `::1` collide.
pub fn normalize_target(target: &str) -> String {
    let trimmed = target.trim();
    match trimmed.parse::<IpAddr>() {
        Ok(ip) => ip.to_string(),
        Err(_) => trimmed.to_lowercase(),
    }
}

/// Deployment environment the alert originated from. There is no default:
/// callers must say which environment an alert came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Production,
    Staging,
    Development,
    Test,
}

impl Environment {
    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Environment::Production => "production",
            Environment::Staging => "staging",
            Environment::Development => "development",
            Environment::Test => "test",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "production" | "prod" => Ok(Environment::Production),
            "staging" | "stage" => Ok(Environment::Staging),
            "development" | "dev" => Ok(Environment::Development),
            "test" => Ok(Environment::Test),
            other => Err(format!("unknown environment '{}'", other)),
        }
    }
}

/// Alert severity as reported by the detection pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(format!("unknown severity '{}'", other)),
        }
    }
}

/// Raw proposal handed over by the detection pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemediationRequest {
    /// Identifier of the alert that triggered the proposal
    pub alert_id: String,
    /// Requested action type
    pub action_type: String,
    /// Target of the action
    pub target: String,
    /// Alert severity
    pub severity: Severity,
    /// Environment the alert came from; required
    pub environment: Environment,
    /// Who (or which detector) asked for the action
    pub requested_by: String,
    /// Free-form justification recorded on the playbook
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub justification: Option<String>,
    /// Executor parameters
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, serde_json::Value>,
}

impl RemediationRequest {
    /// Build the immutable action value carried by the playbook
    pub fn to_action(&self) -> Action {
        Action {
            name: self.action_type.trim().to_lowercase(),
            target: self.target.trim().to_string(),
            parameters: self.parameters.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_target_canonicalizes_ips() {
        assert_eq!(normalize_target(" ::0001 "), "::1");
        assert_eq!(normalize_target("10.0.0.1"), "10.0.0.1");
        assert_eq!(normalize_target("  Alice@Example.COM "), "alice@example.com");
    }

    #[test]
    fn test_environment_parsing() {
        assert_eq!("prod".parse::<Environment>().unwrap(), Environment::Production);
        assert_eq!("Staging".parse::<Environment>().unwrap(), Environment::Staging);
        assert!("moon".parse::<Environment>().is_err());
    }

    #[test]
    fn test_request_serialization_defaults() {
        let json = r#"{
            "alert_id": "a-1",
            "action_type": "BLOCK_IP",
            "target": " 203.0.113.9 ",
            "severity": "high",
            "environment": "staging",
            "requested_by": "detector"
        }"#;
        let request: RemediationRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.environment, Environment::Staging);
        assert!(request.justification.is_none());
        assert!(request.parameters.is_empty());

        let action = request.to_action();
        assert_eq!(action.name, BLOCK_IP);
        assert_eq!(action.target, "203.0.113.9");
        assert!(action.targets_network());
    }

    #[test]
    fn test_request_without_environment_is_refused() {
        let json = r#"{
            "alert_id": "a-1",
            "action_type": "block_ip",
            "target": "203.0.113.9",
            "severity": "high",
            "requested_by": "detector"
        }"#;
        let err = serde_json::from_str::<RemediationRequest>(json).unwrap_err();
        assert!(err.to_string().contains("environment"));
    }
}
