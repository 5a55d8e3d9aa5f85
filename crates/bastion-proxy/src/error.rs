//! Error types for the proxy crate.

use crate::session::SessionState;
use crate::wire::Direction;
use bastion_mfa::{CeremonyStage, MfaError};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur in the gateway.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Failed to bind to the listen address.
    #[error("failed to bind to {address}: {source}")]
    BindFailed {
        address: String,
        source: std::io::Error,
    },

    /// The gateway is wired or configured in a way that cannot work.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The MFA ceremony did not produce a response.
    #[error("MFA ceremony failed: {0}")]
    Ceremony(#[from] MfaError),

    /// The policy refused the action.
    #[error("access denied for user {user} on database {database} ({action})")]
    PolicyDenied {
        user: String,
        database: String,
        action: String,
    },

    /// The policy evaluator itself failed.
    #[error("policy evaluation failed: {0}")]
    Policy(#[source] anyhow::Error),

    /// Malformed frame or protocol state violation.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A frame declared a length above the configured maximum.
    #[error("{direction} frame of {declared} bytes exceeds limit of {limit} bytes")]
    FrameTooLarge {
        direction: Direction,
        declared: u32,
        limit: u32,
    },

    /// A peer stalled longer than allowed.
    #[error("timed out during {stage} after {after:?}")]
    Timeout { stage: &'static str, after: Duration },

    /// The backend could not be reached or went away.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// A session state change that the lifecycle does not allow.
    #[error("invalid session transition from {from} to {to}")]
    InvalidTransition { from: SessionState, to: SessionState },

    /// The governing context was cancelled.
    #[error("session cancelled")]
    Cancelled,

    /// IO error on the client connection.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Coarse classification of a [`ProxyError`].
///
/// Lets callers tell security failures from connectivity failures without
/// matching on every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Authentication,
    Protocol,
    Timeout,
    BackendUnavailable,
    Busy,
    Cancelled,
    PolicyDenied,
    InvalidState,
    Io,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Configuration => "configuration",
            Self::Authentication => "authentication",
            Self::Protocol => "protocol",
            Self::Timeout => "timeout",
            Self::BackendUnavailable => "backend_unavailable",
            Self::Busy => "busy",
            Self::Cancelled => "cancelled",
            Self::PolicyDenied => "policy_denied",
            Self::InvalidState => "invalid_state",
            Self::Io => "io",
            Self::Internal => "internal",
        };
        f.write_str(name)
    }
}

impl ProxyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::BindFailed { .. } | Self::Io(_) => ErrorKind::Io,
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::Ceremony(e) => match e {
                MfaError::Configuration(_) => ErrorKind::Configuration,
                MfaError::Authentication { .. } => ErrorKind::Authentication,
                MfaError::Timeout(_) => ErrorKind::Timeout,
                MfaError::Cancelled => ErrorKind::Cancelled,
                MfaError::Busy => ErrorKind::Busy,
            },
            Self::PolicyDenied { .. } => ErrorKind::PolicyDenied,
            Self::Policy(_) | Self::Internal(_) => ErrorKind::Internal,
            Self::Protocol(_) | Self::FrameTooLarge { .. } => ErrorKind::Protocol,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::BackendUnavailable(_) => ErrorKind::BackendUnavailable,
            Self::InvalidTransition { .. } => ErrorKind::InvalidState,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// The ceremony stage that failed, for MFA authentication failures.
    pub fn ceremony_stage(&self) -> Option<CeremonyStage> {
        match self {
            Self::Ceremony(e) => e.stage(),
            _ => None,
        }
    }

    pub fn is_frame_too_large(&self) -> bool {
        matches!(self, Self::FrameTooLarge { .. })
    }

    /// Whether the error means the peer connection went away.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::Io(_))
    }

    /// SQLSTATE reported to the client when the session ends on this error.
    pub fn sqlstate(&self) -> &'static str {
        match self.kind() {
            ErrorKind::Authentication | ErrorKind::PolicyDenied => "28000",
            ErrorKind::Protocol => "08P01",
            ErrorKind::BackendUnavailable => "08006",
            ErrorKind::Timeout | ErrorKind::Cancelled => "57014",
            ErrorKind::Busy => "55006",
            ErrorKind::Configuration => "F0000",
            ErrorKind::InvalidState | ErrorKind::Io | ErrorKind::Internal => "XX000",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_is_preserved_through_ceremony_errors() {
        let err = ProxyError::from(MfaError::Busy);
        assert_eq!(err.kind(), ErrorKind::Busy);

        let err = ProxyError::from(MfaError::Configuration("no prompt".to_string()));
        assert_eq!(err.kind(), ErrorKind::Configuration);

        let err = ProxyError::from(MfaError::Timeout(Duration::from_secs(1)));
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[test]
    fn test_frame_too_large_is_protocol_kind() {
        let err = ProxyError::FrameTooLarge {
            direction: Direction::Frontend,
            declared: 1 << 30,
            limit: 1 << 20,
        };
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert!(err.is_frame_too_large());
        assert_eq!(err.sqlstate(), "08P01");
        assert!(err.to_string().contains("frontend"));
    }
}
