//! Bastion access policy
//!
//! The gateway consults a [`PolicyEvaluator`] before it starts relaying a
//! session and again before an elevation ceremony. The evaluator answers
//! allow, deny or require-MFA; how it reaches that answer is its own business.

use async_trait::async_trait;
use bastion_core::{PolicyConfig, PolicyRule};
use serde::{Deserialize, Serialize};
use std::fmt;

pub use bastion_core::Decision;

/// The action a session is about to take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessAction {
    /// Open a relayed session to the database.
    Connect,
    /// Perform an elevated action inside an active session.
    Elevate,
}

impl fmt::Display for AccessAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect => write!(f, "connect"),
            Self::Elevate => write!(f, "elevate"),
        }
    }
}

/// Input for a policy check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessRequest {
    pub user: String,
    pub database: String,
    pub action: AccessAction,
}

impl AccessRequest {
    pub fn new(user: impl Into<String>, database: impl Into<String>, action: AccessAction) -> Self {
        Self {
            user: user.into(),
            database: database.into(),
            action,
        }
    }
}

/// Policy evaluator trait for checking access.
#[async_trait]
pub trait PolicyEvaluator: Send + Sync {
    async fn evaluate(&self, request: &AccessRequest) -> anyhow::Result<Decision>;
}

/// Evaluates the ordered rules from the gateway configuration.
///
/// The first rule matching the user and database wins. Elevation always
/// requires MFA unless the matching rule denies outright.
pub struct StaticPolicy {
    default_decision: Decision,
    rules: Vec<PolicyRule>,
}

impl StaticPolicy {
    pub fn new(config: &PolicyConfig) -> Self {
        Self {
            default_decision: config.default_decision,
            rules: config.rules.clone(),
        }
    }

    fn decide(&self, request: &AccessRequest) -> (Decision, Option<usize>) {
        let matched = self
            .rules
            .iter()
            .position(|rule| rule.matches(&request.user, &request.database));
        let decision = matched
            .map(|i| self.rules[i].decision)
            .unwrap_or(self.default_decision);

        match (request.action, decision) {
            (AccessAction::Elevate, Decision::Allow) => (Decision::RequireMfa, matched),
            _ => (decision, matched),
        }
    }
}

#[async_trait]
impl PolicyEvaluator for StaticPolicy {
    async fn evaluate(&self, request: &AccessRequest) -> anyhow::Result<Decision> {
        let (decision, rule) = self.decide(request);
        tracing::debug!(
            user = %request.user,
            database = %request.database,
            action = %request.action,
            rule = ?rule,
            decision = ?decision,
            "Policy evaluated"
        );
        Ok(decision)
    }
}

/// Allow-all evaluator for development and tests.
pub struct AllowAll;

#[async_trait]
impl PolicyEvaluator for AllowAll {
    async fn evaluate(&self, _request: &AccessRequest) -> anyhow::Result<Decision> {
        Ok(Decision::Allow)
    }
}
