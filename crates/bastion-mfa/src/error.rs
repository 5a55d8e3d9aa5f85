//! Error types for the MFA crate.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Stage of the ceremony at which an authentication failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CeremonyStage {
    /// Obtaining a challenge from the issuer.
    Issuance,
    /// Collecting the user's response.
    Prompt,
}

impl fmt::Display for CeremonyStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Issuance => write!(f, "issuance"),
            Self::Prompt => write!(f, "prompt"),
        }
    }
}

/// Errors that can occur while running an MFA ceremony.
#[derive(Debug, Error)]
pub enum MfaError {
    /// The ceremony cannot run with the current wiring.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The ceremony failed at the given stage.
    #[error("authentication failed at {stage} stage: {source}")]
    Authentication {
        stage: CeremonyStage,
        #[source]
        source: anyhow::Error,
    },

    /// The ceremony deadline passed before the user responded.
    #[error("ceremony timed out after {0:?}")]
    Timeout(Duration),

    /// The governing context was cancelled.
    #[error("ceremony cancelled")]
    Cancelled,

    /// Another ceremony is already pending for this session.
    #[error("a ceremony is already pending for this session")]
    Busy,
}

impl MfaError {
    pub(crate) fn at(stage: CeremonyStage, source: impl Into<anyhow::Error>) -> Self {
        Self::Authentication {
            stage,
            source: source.into(),
        }
    }

    /// The failing stage, for authentication failures.
    pub fn stage(&self) -> Option<CeremonyStage> {
        match self {
            Self::Authentication { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}
