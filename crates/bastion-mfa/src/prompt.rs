//! Pluggable prompt capability.

use crate::challenge::{Challenge, ChallengeResponse};
use async_trait::async_trait;
use std::future::Future;
use tokio_util::sync::CancellationToken;

/// Collects a [`ChallengeResponse`] from the user.
///
/// Implementations may block for as long as the interaction takes (a
/// hardware key tap, typing an OTP). They should stop promptly once `ctx` is
/// cancelled, although the coordinator does not wait for them to notice.
#[async_trait]
pub trait MfaPrompt: Send + Sync {
    async fn prompt(
        &self,
        ctx: &CancellationToken,
        challenge: &Challenge,
    ) -> anyhow::Result<ChallengeResponse>;
}

/// Adapts an async closure into an [`MfaPrompt`].
///
/// ```
/// use bastion_core::MethodKind;
/// use bastion_mfa::{ChallengeResponse, FnPrompt};
///
/// let prompt = FnPrompt::new(|challenge| async move {
///     Ok(ChallengeResponse::for_challenge(&challenge, MethodKind::Totp, b"123456".to_vec()))
/// });
/// # let _ = prompt;
/// ```
pub struct FnPrompt<F> {
    f: F,
}

impl<F, Fut> FnPrompt<F>
where
    F: Fn(Challenge) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<ChallengeResponse>> + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> MfaPrompt for FnPrompt<F>
where
    F: Fn(Challenge) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<ChallengeResponse>> + Send + 'static,
{
    async fn prompt(
        &self,
        _ctx: &CancellationToken,
        challenge: &Challenge,
    ) -> anyhow::Result<ChallengeResponse> {
        (self.f)(challenge.clone()).await
    }
}
