//! Relay engine limits and timeouts.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Frame size and timing limits for the protocol relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Largest declared frame length accepted in either direction, in bytes.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: u32,

    /// How long a partially received frame may wait for more bytes.
    #[serde(default = "default_frame_timeout_ms")]
    pub frame_timeout_ms: u64,

    /// Idle timeout between frames in seconds (0 = disabled).
    #[serde(default)]
    pub idle_timeout_secs: u64,

    /// How long the backend may keep streaming after the client went away.
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,

    /// Chunk size used when streaming large payloads.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Bytes of query text kept for audit events.
    #[serde(default = "default_audit_capture_bytes")]
    pub audit_capture_bytes: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_frame_size: default_max_frame_size(),
            frame_timeout_ms: default_frame_timeout_ms(),
            idle_timeout_secs: 0,
            drain_timeout_ms: default_drain_timeout_ms(),
            chunk_size: default_chunk_size(),
            audit_capture_bytes: default_audit_capture_bytes(),
        }
    }
}

impl RelayConfig {
    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }

    /// `None` when idle detection is disabled.
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

fn default_max_frame_size() -> u32 {
    64 * 1024 * 1024
}

fn default_frame_timeout_ms() -> u64 {
    30_000
}

fn default_drain_timeout_ms() -> u64 {
    30_000
}

fn default_chunk_size() -> usize {
    8192
}

fn default_audit_capture_bytes() -> usize {
    1024
}
