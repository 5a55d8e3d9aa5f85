//! MFA ceremony configuration.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Authentication method kinds a challenge may accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MethodKind {
    /// Hardware or platform authenticator.
    Webauthn,
    /// Time-based one-time password.
    Totp,
    /// Single sign-on re-authentication.
    Sso,
}

impl fmt::Display for MethodKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Webauthn => write!(f, "webauthn"),
            Self::Totp => write!(f, "totp"),
            Self::Sso => write!(f, "sso"),
        }
    }
}

/// Configuration for MFA ceremonies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MfaConfig {
    /// Upper bound on a single ceremony, including the interactive prompt.
    #[serde(default = "default_ceremony_timeout")]
    pub ceremony_timeout_secs: u64,

    /// Lifetime of locally issued challenges.
    #[serde(default = "default_challenge_ttl")]
    pub challenge_ttl_secs: u64,

    /// Method kinds offered in locally issued challenges.
    #[serde(default = "default_accepted_methods")]
    pub accepted_methods: Vec<MethodKind>,
}

impl Default for MfaConfig {
    fn default() -> Self {
        Self {
            ceremony_timeout_secs: default_ceremony_timeout(),
            challenge_ttl_secs: default_challenge_ttl(),
            accepted_methods: default_accepted_methods(),
        }
    }
}

impl MfaConfig {
    pub fn ceremony_timeout(&self) -> Duration {
        Duration::from_secs(self.ceremony_timeout_secs)
    }

    pub fn challenge_ttl(&self) -> Duration {
        Duration::from_secs(self.challenge_ttl_secs)
    }
}

fn default_ceremony_timeout() -> u64 {
    120
}

fn default_challenge_ttl() -> u64 {
    300
}

fn default_accepted_methods() -> Vec<MethodKind> {
    vec![MethodKind::Webauthn, MethodKind::Totp]
}
