//! Integration tests for the MFA ceremony coordinator.

use async_trait::async_trait;
use bastion_core::MethodKind;
use bastion_mfa::{
    CeremonyCoordinator, CeremonyStage, Challenge, ChallengeIssuer, ChallengeResponse,
    ChallengeScope, FnPrompt, LocalChallengeIssuer, MfaError, MfaPrompt,
};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn local_issuer() -> Arc<dyn ChallengeIssuer> {
    Arc::new(LocalChallengeIssuer::new(
        Duration::from_secs(60),
        vec![MethodKind::Totp, MethodKind::Webauthn],
    ))
}

fn totp_prompt() -> Arc<dyn MfaPrompt> {
    Arc::new(FnPrompt::new(|challenge: Challenge| async move {
        Ok(ChallengeResponse::for_challenge(
            &challenge,
            MethodKind::Totp,
            b"424242".to_vec(),
        ))
    }))
}

/// Issuer that counts calls and can be told to fail.
struct CountingIssuer {
    calls: AtomicUsize,
    fail: bool,
}

#[async_trait]
impl ChallengeIssuer for CountingIssuer {
    async fn create_challenge(
        &self,
        _ctx: &CancellationToken,
        scope: ChallengeScope,
    ) -> anyhow::Result<Challenge> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            anyhow::bail!("issuer unavailable");
        }
        Ok(Challenge::new(
            format!("nonce-{}", n),
            scope,
            vec![MethodKind::Totp],
            chrono::Utc::now() + chrono::Duration::minutes(5),
        ))
    }
}

/// Prompt that records every challenge nonce it saw and fails the first time.
struct FlakyPrompt {
    seen: Mutex<Vec<String>>,
}

#[async_trait]
impl MfaPrompt for FlakyPrompt {
    async fn prompt(
        &self,
        _ctx: &CancellationToken,
        challenge: &Challenge,
    ) -> anyhow::Result<ChallengeResponse> {
        let attempt = {
            let mut seen = self.seen.lock().unwrap();
            seen.push(challenge.nonce().to_string());
            seen.len()
        };
        if attempt == 1 {
            anyhow::bail!("user dismissed the prompt");
        }
        Ok(ChallengeResponse::for_challenge(challenge, MethodKind::Totp, b"1".to_vec()))
    }
}

/// Prompt that never answers.
struct StuckPrompt;

#[async_trait]
impl MfaPrompt for StuckPrompt {
    async fn prompt(
        &self,
        _ctx: &CancellationToken,
        _challenge: &Challenge,
    ) -> anyhow::Result<ChallengeResponse> {
        std::future::pending().await
    }
}

#[tokio::test]
async fn test_successful_ceremony_returns_bound_response() {
    let coordinator =
        CeremonyCoordinator::new(local_issuer(), Some(totp_prompt()), Duration::from_secs(5));
    let ctx = CancellationToken::new();

    let response = coordinator.initiate(&ctx, "session-1").await.unwrap();
    assert_eq!(response.method, MethodKind::Totp);
    assert_eq!(response.assertion, b"424242".to_vec());
    assert!(!coordinator.is_pending());
}

#[tokio::test]
async fn test_missing_prompt_is_configuration_error() {
    let issuer = Arc::new(CountingIssuer {
        calls: AtomicUsize::new(0),
        fail: false,
    });
    let coordinator = CeremonyCoordinator::new(issuer.clone(), None, Duration::from_secs(5));

    let err = coordinator
        .initiate(&CancellationToken::new(), "session-1")
        .await
        .unwrap_err();
    assert!(matches!(err, MfaError::Configuration(_)));
    // No challenge is requested when the ceremony cannot complete.
    assert_eq!(issuer.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_prompt_error_is_authentication_error() {
    let prompt: Arc<dyn MfaPrompt> = Arc::new(FnPrompt::new(|_challenge: Challenge| async move {
        Err(anyhow::anyhow!("hardware key not present"))
    }));
    let coordinator =
        CeremonyCoordinator::new(local_issuer(), Some(prompt), Duration::from_secs(5));

    let err = coordinator
        .initiate(&CancellationToken::new(), "session-1")
        .await
        .unwrap_err();
    assert_eq!(err.stage(), Some(CeremonyStage::Prompt));
    assert!(err.to_string().contains("prompt"));
}

#[tokio::test]
async fn test_issuance_error_skips_prompt() {
    let issuer = Arc::new(CountingIssuer {
        calls: AtomicUsize::new(0),
        fail: true,
    });
    let prompt = Arc::new(FlakyPrompt {
        seen: Mutex::new(Vec::new()),
    });
    let coordinator = CeremonyCoordinator::new(
        issuer,
        Some(prompt.clone() as Arc<dyn MfaPrompt>),
        Duration::from_secs(5),
    );

    let err = coordinator
        .initiate(&CancellationToken::new(), "session-1")
        .await
        .unwrap_err();
    assert_eq!(err.stage(), Some(CeremonyStage::Issuance));
    assert!(prompt.seen.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_retry_uses_fresh_challenge() {
    let issuer = Arc::new(CountingIssuer {
        calls: AtomicUsize::new(0),
        fail: false,
    });
    let prompt = Arc::new(FlakyPrompt {
        seen: Mutex::new(Vec::new()),
    });
    let coordinator = CeremonyCoordinator::new(
        issuer.clone(),
        Some(prompt.clone() as Arc<dyn MfaPrompt>),
        Duration::from_secs(5),
    );
    let ctx = CancellationToken::new();

    assert!(coordinator.initiate(&ctx, "session-1").await.is_err());
    let response = coordinator.initiate(&ctx, "session-1").await.unwrap();

    let seen = prompt.seen.lock().unwrap().clone();
    assert_eq!(seen, vec!["nonce-0".to_string(), "nonce-1".to_string()]);
    assert_eq!(response.nonce, "nonce-1");
    assert_eq!(issuer.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_response_for_other_challenge_is_rejected() {
    let prompt: Arc<dyn MfaPrompt> = Arc::new(FnPrompt::new(|_challenge: Challenge| async move {
        Ok(ChallengeResponse {
            nonce: "replayed-nonce".to_string(),
            method: MethodKind::Totp,
            assertion: b"000000".to_vec(),
        })
    }));
    let coordinator =
        CeremonyCoordinator::new(local_issuer(), Some(prompt), Duration::from_secs(5));

    let err = coordinator
        .initiate(&CancellationToken::new(), "session-1")
        .await
        .unwrap_err();
    assert_eq!(err.stage(), Some(CeremonyStage::Prompt));
}

#[tokio::test]
async fn test_overlapping_ceremony_is_busy() {
    let coordinator = Arc::new(CeremonyCoordinator::new(
        local_issuer(),
        Some(Arc::new(StuckPrompt) as Arc<dyn MfaPrompt>),
        Duration::from_secs(60),
    ));
    let ctx = CancellationToken::new();

    let first = {
        let coordinator = coordinator.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move { coordinator.initiate(&ctx, "session-1").await })
    };

    // Let the first ceremony reach the prompt.
    while !coordinator.is_pending() {
        tokio::task::yield_now().await;
    }

    let err = coordinator.initiate(&ctx, "session-1").await.unwrap_err();
    assert!(matches!(err, MfaError::Busy));

    ctx.cancel();
    let first = first.await.unwrap().unwrap_err();
    assert!(matches!(first, MfaError::Cancelled));
    assert!(!coordinator.is_pending());
}

#[tokio::test]
async fn test_cancellation_unwinds_pending_prompt() {
    let coordinator = CeremonyCoordinator::new(
        local_issuer(),
        Some(Arc::new(StuckPrompt) as Arc<dyn MfaPrompt>),
        Duration::from_secs(600),
    );
    let ctx = CancellationToken::new();
    let canceller = ctx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        canceller.cancel();
    });

    let err = coordinator.initiate(&ctx, "session-1").await.unwrap_err();
    assert!(matches!(err, MfaError::Cancelled));
}

#[tokio::test(start_paused = true)]
async fn test_ceremony_deadline_is_timeout() {
    let coordinator = CeremonyCoordinator::new(
        local_issuer(),
        Some(Arc::new(StuckPrompt) as Arc<dyn MfaPrompt>),
        Duration::from_secs(30),
    );

    let err = coordinator
        .initiate(&CancellationToken::new(), "session-1")
        .await
        .unwrap_err();
    assert!(matches!(err, MfaError::Timeout(d) if d == Duration::from_secs(30)));
}
