//! Listener and upstream configuration types.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the client-facing listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// Address to listen on.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Port to listen on for incoming Postgres connections.
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Maximum number of concurrent sessions.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            listen_port: default_listen_port(),
            max_connections: default_max_connections(),
        }
    }
}

impl ListenerConfig {
    /// `addr:port` string suitable for binding.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.listen_addr, self.listen_port)
    }
}

/// Configuration for the backend database the gateway relays to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Hostname of the backend server.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port of the backend server.
    #[serde(default = "default_upstream_port")]
    pub port: u16,

    /// Dial timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_upstream_port(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl UpstreamConfig {
    /// `host:port` string suitable for dialing.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

fn default_listen_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    6432
}

fn default_max_connections() -> u32 {
    100
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_upstream_port() -> u16 {
    5432
}

fn default_connect_timeout() -> u64 {
    10
}
