//! Audit pipeline configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for audit event delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Whether audit events are delivered at all.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Events buffered between the data path and the sink; excess events are dropped.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Upper bound on delivering one event to the sink.
    #[serde(default = "default_delivery_timeout_ms")]
    pub delivery_timeout_ms: u64,

    /// Output destination.
    #[serde(default)]
    pub output: AuditOutput,

    /// File path (for file output).
    #[serde(default)]
    pub path: Option<String>,
}

/// Audit output destination.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutput {
    /// JSON lines on stdout.
    #[default]
    Stdout,
    /// JSON lines appended to a file.
    File,
    /// Structured `tracing` events.
    Tracing,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            queue_capacity: default_queue_capacity(),
            delivery_timeout_ms: default_delivery_timeout_ms(),
            output: AuditOutput::default(),
            path: None,
        }
    }
}

impl AuditConfig {
    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }
}

fn default_enabled() -> bool {
    true
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_delivery_timeout_ms() -> u64 {
    250
}
