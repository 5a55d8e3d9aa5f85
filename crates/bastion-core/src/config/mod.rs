//! Configuration types for the Bastion gateway.
//!
//! All settings live in a single YAML file (`bastion.yaml`) deserialized into
//! [`GatewayConfig`]. Every section and field has a default, so an empty file
//! is a valid configuration.

pub mod audit;
pub mod mfa;
pub mod policy;
pub mod proxy;
pub mod relay;

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub use audit::{AuditConfig, AuditOutput};
pub use mfa::{MethodKind, MfaConfig};
pub use policy::{Decision, PolicyConfig, PolicyRule};
pub use proxy::{ListenerConfig, UpstreamConfig};
pub use relay::RelayConfig;

/// Complete gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Client-facing listener.
    #[serde(default)]
    pub listener: ListenerConfig,

    /// Backend database.
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Relay limits.
    #[serde(default)]
    pub relay: RelayConfig,

    /// MFA ceremony settings.
    #[serde(default)]
    pub mfa: MfaConfig,

    /// Audit pipeline.
    #[serde(default)]
    pub audit: AuditConfig,

    /// Static access policy.
    #[serde(default)]
    pub policy: PolicyConfig,
}

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl GatewayConfig {
    /// Load and validate configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&content)
    }

    /// Parse and validate configuration from YAML content.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = if content.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(content)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Serialize the effective configuration back to YAML.
    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        serde_yaml::to_string(self).map_err(ConfigError::from)
    }

    /// Reject settings the gateway cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listener.max_connections == 0 {
            return Err(ConfigError::Config(
                "listener.max_connections must be greater than zero".to_string(),
            ));
        }
        // A frame must at least hold its own length field.
        if self.relay.max_frame_size < 4 {
            return Err(ConfigError::Config(
                "relay.max_frame_size must be at least 4 bytes".to_string(),
            ));
        }
        if self.relay.chunk_size == 0 {
            return Err(ConfigError::Config(
                "relay.chunk_size must be greater than zero".to_string(),
            ));
        }
        if self.relay.chunk_size > self.relay.max_frame_size as usize {
            return Err(ConfigError::Config(format!(
                "relay.chunk_size ({}) exceeds relay.max_frame_size ({})",
                self.relay.chunk_size, self.relay.max_frame_size
            )));
        }
        if self.relay.frame_timeout_ms == 0 {
            return Err(ConfigError::Config(
                "relay.frame_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.audit.enabled && self.audit.queue_capacity == 0 {
            return Err(ConfigError::Config(
                "audit.queue_capacity must be greater than zero".to_string(),
            ));
        }
        if self.audit.output == AuditOutput::File && self.audit.path.is_none() {
            return Err(ConfigError::Config(
                "audit.path is required when audit.output is 'file'".to_string(),
            ));
        }
        if self.mfa.accepted_methods.is_empty() {
            return Err(ConfigError::Config(
                "mfa.accepted_methods must list at least one method".to_string(),
            ));
        }
        for (i, rule) in self.policy.rules.iter().enumerate() {
            if rule.users.is_empty() || rule.databases.is_empty() {
                return Err(ConfigError::Config(format!(
                    "policy.rules[{}] must list at least one user and one database",
                    i
                )));
            }
        }
        Ok(())
    }
}
