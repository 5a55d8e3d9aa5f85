//! Ceremony coordination.
//!
//! A ceremony is strictly linear: issue a challenge, prompt the user, bind
//! the response to the challenge. The first failure ends it. Nothing from a
//! failed ceremony survives, so a retry always starts from a fresh challenge.

use crate::challenge::{ChallengeIssuer, ChallengeResponse, ChallengeScope};
use crate::error::{CeremonyStage, MfaError};
use crate::prompt::MfaPrompt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Runs MFA ceremonies for a single session.
///
/// At most one ceremony is pending at a time; overlapping calls to
/// [`initiate`](Self::initiate) fail with [`MfaError::Busy`].
pub struct CeremonyCoordinator {
    issuer: Arc<dyn ChallengeIssuer>,
    prompt: Option<Arc<dyn MfaPrompt>>,
    timeout: Duration,
    pending: Mutex<()>,
}

impl CeremonyCoordinator {
    /// Create a coordinator. `prompt` may be `None` for headless wiring, in
    /// which case every ceremony fails with a configuration error.
    pub fn new(
        issuer: Arc<dyn ChallengeIssuer>,
        prompt: Option<Arc<dyn MfaPrompt>>,
        timeout: Duration,
    ) -> Self {
        Self {
            issuer,
            prompt,
            timeout,
            pending: Mutex::new(()),
        }
    }

    /// Whether a prompt capability is registered.
    pub fn has_prompt(&self) -> bool {
        self.prompt.is_some()
    }

    /// Whether a ceremony is currently in progress.
    pub fn is_pending(&self) -> bool {
        self.pending.try_lock().is_err()
    }

    /// Run one ceremony and return the user's raw response.
    ///
    /// The response is not validated beyond being bound to the issued
    /// challenge. Cancelling `ctx` or exceeding the ceremony deadline drops
    /// the in-flight issuer or prompt call immediately.
    pub async fn initiate(
        &self,
        ctx: &CancellationToken,
        session_id: &str,
    ) -> Result<ChallengeResponse, MfaError> {
        let prompt = self.prompt.as_ref().ok_or_else(|| {
            MfaError::Configuration(
                "no prompt capability registered, cannot perform an MFA ceremony".to_string(),
            )
        })?;

        let _guard = self.pending.try_lock().map_err(|_| {
            tracing::warn!(session = %session_id, "Rejected overlapping MFA ceremony");
            MfaError::Busy
        })?;

        tracing::debug!(session = %session_id, "Starting MFA ceremony");

        let ceremony = async {
            let challenge = self
                .issuer
                .create_challenge(ctx, ChallengeScope::ContextUser)
                .await
                .map_err(|e| MfaError::at(CeremonyStage::Issuance, e))?;

            tracing::debug!(
                session = %session_id,
                expires_at = %challenge.expires_at(),
                methods = ?challenge.accepted_methods(),
                "Challenge issued, prompting user"
            );

            let response = prompt
                .prompt(ctx, &challenge)
                .await
                .map_err(|e| MfaError::at(CeremonyStage::Prompt, e))?;

            challenge
                .bind(response)
                .map_err(|e| MfaError::at(CeremonyStage::Prompt, e))
        };

        let result = tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(MfaError::Cancelled),
            outcome = tokio::time::timeout(self.timeout, ceremony) => {
                outcome.unwrap_or(Err(MfaError::Timeout(self.timeout)))
            }
        };

        match &result {
            Ok(response) => tracing::info!(
                session = %session_id,
                method = %response.method,
                "MFA ceremony completed"
            ),
            Err(e) => tracing::warn!(session = %session_id, error = %e, "MFA ceremony failed"),
        }

        result
    }
}
