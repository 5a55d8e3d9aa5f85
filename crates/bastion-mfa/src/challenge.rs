//! Challenges, responses and the issuer boundary.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use bastion_core::MethodKind;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// What a challenge authorizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeScope {
    /// Re-assert presence of the user behind the current session, not tied
    /// to any particular resource.
    ContextUser,
}

/// A one-shot authentication challenge.
///
/// A challenge is consumed by [`Challenge::bind`], so the same value can
/// never validate two responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Challenge {
    nonce: String,
    scope: ChallengeScope,
    accepted_methods: Vec<MethodKind>,
    expires_at: DateTime<Utc>,
}

impl Challenge {
    pub fn new(
        nonce: impl Into<String>,
        scope: ChallengeScope,
        accepted_methods: Vec<MethodKind>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            nonce: nonce.into(),
            scope,
            accepted_methods,
            expires_at,
        }
    }

    pub fn nonce(&self) -> &str {
        &self.nonce
    }

    pub fn scope(&self) -> ChallengeScope {
        self.scope
    }

    pub fn accepted_methods(&self) -> &[MethodKind] {
        &self.accepted_methods
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Consume the challenge, checking that `response` answers it.
    ///
    /// Only the binding is checked here (nonce, method, expiry). Whether the
    /// assertion itself is valid is decided by whoever issued the challenge.
    pub fn bind(self, response: ChallengeResponse) -> anyhow::Result<ChallengeResponse> {
        if self.is_expired() {
            anyhow::bail!("challenge expired at {}", self.expires_at);
        }
        if response.nonce != self.nonce {
            anyhow::bail!("response is not bound to the issued challenge");
        }
        if !self.accepted_methods.contains(&response.method) {
            anyhow::bail!("method '{}' is not accepted by this challenge", response.method);
        }
        Ok(response)
    }
}

/// Opaque proof answering a [`Challenge`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeResponse {
    /// Nonce of the challenge this response answers.
    pub nonce: String,
    /// Method used to produce the assertion.
    pub method: MethodKind,
    /// Raw assertion bytes (signature, OTP code, ...).
    pub assertion: Vec<u8>,
}

impl ChallengeResponse {
    /// Build a response for `challenge`.
    pub fn for_challenge(challenge: &Challenge, method: MethodKind, assertion: Vec<u8>) -> Self {
        Self {
            nonce: challenge.nonce().to_string(),
            method,
            assertion,
        }
    }
}

/// Source of challenges.
#[async_trait]
pub trait ChallengeIssuer: Send + Sync {
    /// Create a fresh challenge for `scope`.
    async fn create_challenge(
        &self,
        ctx: &CancellationToken,
        scope: ChallengeScope,
    ) -> anyhow::Result<Challenge>;
}

/// Issues challenges locally with random nonces.
pub struct LocalChallengeIssuer {
    ttl: Duration,
    accepted_methods: Vec<MethodKind>,
}

impl LocalChallengeIssuer {
    /// Nonce length in bytes before encoding.
    pub const NONCE_LEN: usize = 32;

    pub fn new(ttl: Duration, accepted_methods: Vec<MethodKind>) -> Self {
        Self {
            ttl,
            accepted_methods,
        }
    }

    /// Create an issuer from the gateway MFA settings.
    pub fn from_config(config: &bastion_core::MfaConfig) -> Self {
        Self::new(config.challenge_ttl(), config.accepted_methods.clone())
    }

    fn generate_nonce() -> String {
        let mut bytes = [0u8; Self::NONCE_LEN];
        rand::rng().fill_bytes(&mut bytes);
        URL_SAFE_NO_PAD.encode(bytes)
    }
}

#[async_trait]
impl ChallengeIssuer for LocalChallengeIssuer {
    async fn create_challenge(
        &self,
        ctx: &CancellationToken,
        scope: ChallengeScope,
    ) -> anyhow::Result<Challenge> {
        if ctx.is_cancelled() {
            anyhow::bail!("context cancelled before challenge issuance");
        }
        let ttl = chrono::Duration::from_std(self.ttl)?;
        Ok(Challenge::new(
            Self::generate_nonce(),
            scope,
            self.accepted_methods.clone(),
            Utc::now() + ttl,
        ))
    }
}
