//! # bastion-core
//!
//! Configuration types shared across all Bastion crates.

pub mod config;

pub use config::{
    AuditConfig, AuditOutput, ConfigError, Decision, GatewayConfig, ListenerConfig, MethodKind,
    MfaConfig, PolicyConfig, PolicyRule, RelayConfig, UpstreamConfig,
};
