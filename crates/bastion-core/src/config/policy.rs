//! Access policy rules.

use serde::{Deserialize, Serialize};

/// Outcome of an access check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// Access granted without further checks.
    Allow,
    /// Access refused.
    Deny,
    /// Access granted once an MFA ceremony succeeds.
    RequireMfa,
}

/// Static policy configuration: ordered rules, first match wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Decision when no rule matches.
    #[serde(default = "default_decision")]
    pub default_decision: Decision,

    /// Ordered rules.
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            default_decision: default_decision(),
            rules: Vec::new(),
        }
    }
}

/// A single policy rule. `*` matches any value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    /// Database users this rule applies to.
    #[serde(default = "wildcard")]
    pub users: Vec<String>,

    /// Target databases this rule applies to.
    #[serde(default = "wildcard")]
    pub databases: Vec<String>,

    /// Decision when the rule matches.
    pub decision: Decision,
}

impl PolicyRule {
    /// Check whether the rule covers the given user and database.
    pub fn matches(&self, user: &str, database: &str) -> bool {
        matches_any(&self.users, user) && matches_any(&self.databases, database)
    }
}

fn matches_any(patterns: &[String], value: &str) -> bool {
    patterns.iter().any(|p| p == "*" || p == value)
}

fn default_decision() -> Decision {
    Decision::Allow
}

fn wildcard() -> Vec<String> {
    vec!["*".to_string()]
}
