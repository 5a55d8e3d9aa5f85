//! Integration tests for the session lifecycle.

mod common;

use async_trait::async_trait;
use bastion_audit::{AuditDispatcher, AuditEventType, MemorySink};
use bastion_core::{AuditConfig, Decision, GatewayConfig, MethodKind, PolicyConfig};
use bastion_mfa::{
    CeremonyStage, Challenge, ChallengeResponse, FnPrompt, LocalChallengeIssuer, MfaError,
    MfaPrompt,
};
use bastion_policy::StaticPolicy;
use bastion_proxy::wire::{self, CANCEL_REQUEST_CODE, SSL_REQUEST_CODE};
use bastion_proxy::{
    ErrorKind, ProxyError, RelayEnd, SessionContext, SessionOutcome, SessionServices,
    SessionState,
};
use common::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

type Session = SessionContext<DuplexStream, DuplexStream>;

fn config_with(default_decision: Decision) -> Arc<GatewayConfig> {
    let mut config = test_config();
    config.policy = PolicyConfig {
        default_decision,
        rules: Vec::new(),
    };
    Arc::new(config)
}

fn services(config: Arc<GatewayConfig>) -> SessionServices {
    let policy = Arc::new(StaticPolicy::new(&config.policy));
    let issuer = Arc::new(LocalChallengeIssuer::from_config(&config.mfa));
    SessionServices::new(config, policy, issuer)
}

fn totp_response(challenge: &Challenge) -> ChallengeResponse {
    ChallengeResponse::for_challenge(challenge, MethodKind::Totp, b"123456".to_vec())
}

fn approving_prompt() -> Arc<dyn MfaPrompt> {
    Arc::new(FnPrompt::new(|challenge: Challenge| async move {
        Ok(totp_response(&challenge))
    }))
}

fn declining_prompt() -> Arc<dyn MfaPrompt> {
    Arc::new(FnPrompt::new(|_challenge: Challenge| async move {
        Err(anyhow::anyhow!("user declined the push notification"))
    }))
}

/// Prompt that waits for the test to release it.
struct GatedPrompt {
    gate: Arc<Notify>,
}

#[async_trait]
impl MfaPrompt for GatedPrompt {
    async fn prompt(
        &self,
        _ctx: &CancellationToken,
        challenge: &Challenge,
    ) -> anyhow::Result<ChallengeResponse> {
        self.gate.notified().await;
        Ok(totp_response(challenge))
    }
}

struct Peers {
    client: DuplexStream,
    backend: DuplexStream,
}

fn session(services: SessionServices, parent: &CancellationToken) -> (Arc<Session>, Peers) {
    let (client, client_side) = duplex(PIPE_CAPACITY);
    let (backend, backend_side) = duplex(PIPE_CAPACITY);
    let session = SessionContext::new("session-test", client_side, backend_side, services, parent);
    (Arc::new(session), Peers { client, backend })
}

fn startup() -> bytes::Bytes {
    wire::startup_message(&[("user", "alice"), ("database", "billing")])
}

fn request_code(code: u32, extra: &[u8]) -> Vec<u8> {
    let mut packet = ((8 + extra.len()) as u32).to_be_bytes().to_vec();
    packet.extend_from_slice(&code.to_be_bytes());
    packet.extend_from_slice(extra);
    packet
}

#[tokio::test]
async fn test_declined_ceremony_leaves_session_awaiting_mfa() {
    let services = services(config_with(Decision::RequireMfa)).with_prompt(declining_prompt());
    let (session, mut peers) = session(services, &CancellationToken::new());

    peers.client.write_all(&startup()).await.unwrap();
    let err = session.run().await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Authentication);
    assert_eq!(err.ceremony_stage(), Some(CeremonyStage::Prompt));
    assert_eq!(session.state(), SessionState::AwaitingMfa);

    let refusal = read_until(&mut peers.client, b'E').await.unwrap();
    assert_eq!(wire::error_code(&refusal), Some("28000"));
    assert!(drain(&mut peers.backend).await.is_empty());
}

#[tokio::test]
async fn test_missing_prompt_is_a_configuration_error() {
    let (session, mut peers) = session(
        services(config_with(Decision::RequireMfa)),
        &CancellationToken::new(),
    );

    peers.client.write_all(&startup()).await.unwrap();
    let err = session.run().await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert!(drain(&mut peers.backend).await.is_empty());
}

#[tokio::test]
async fn test_cancel_before_startup_closes_backend() {
    let parent = CancellationToken::new();
    let (session, mut peers) = session(services(config_with(Decision::Allow)), &parent);

    let running = tokio::spawn({
        let session = session.clone();
        async move { session.run().await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    parent.cancel();

    let err = running.await.unwrap().unwrap_err();
    assert!(matches!(err, ProxyError::Cancelled));
    assert_eq!(session.state(), SessionState::Closed);
    assert!(drain(&mut peers.backend).await.is_empty());
}

#[tokio::test]
async fn test_policy_denial_refuses_client() {
    let (session, mut peers) = session(
        services(config_with(Decision::Deny)),
        &CancellationToken::new(),
    );

    peers.client.write_all(&startup()).await.unwrap();
    let err = session.run().await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::PolicyDenied);
    assert_eq!(session.state(), SessionState::Closed);
    let refusal = read_until(&mut peers.client, b'E').await.unwrap();
    assert_eq!(wire::error_code(&refusal), Some("28000"));
    assert!(drain(&mut peers.backend).await.is_empty());
}

#[tokio::test]
async fn test_allowed_session_relays_after_ssl_refusal() {
    let sink = Arc::new(MemorySink::new());
    let (audit, worker) = AuditDispatcher::spawn(
        sink.clone(),
        &AuditConfig {
            queue_capacity: 64,
            ..Default::default()
        },
    );
    let services = services(config_with(Decision::Allow)).with_audit(audit);
    let (session, peers) = session(services, &CancellationToken::new());
    let Peers {
        mut client,
        mut backend,
    } = peers;

    let running = tokio::spawn({
        let session = session.clone();
        async move { session.run().await }
    });

    client
        .write_all(&request_code(SSL_REQUEST_CODE, &[]))
        .await
        .unwrap();
    let mut answer = [0u8; 1];
    client.read_exact(&mut answer).await.unwrap();
    assert_eq!(&answer, b"N");

    client.write_all(&startup()).await.unwrap();
    assert_eq!(read_startup_packet(&mut backend).await, startup().to_vec());

    client.write_all(&query("SELECT 1")).await.unwrap();
    assert_eq!(read_message(&mut backend).await.unwrap().0, b'Q');
    let mut reply = result_set(1, 16);
    reply.extend_from_slice(&ready_for_query());
    backend.write_all(&reply).await.unwrap();
    read_until(&mut client, b'Z').await.unwrap();

    client.write_all(&wire::terminate()).await.unwrap();
    let outcome = running.await.unwrap().unwrap();
    match outcome {
        SessionOutcome::Relayed(summary) => {
            assert_eq!(summary.end, RelayEnd::ClientTerminated);
            assert_eq!(summary.rows, 1);
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(session.identity().unwrap().database, "billing");

    drop(session);
    worker.await.unwrap();
    let types: Vec<_> = sink.events().iter().map(|e| e.event_type).collect();
    assert_eq!(
        types,
        vec![
            AuditEventType::SessionStarted,
            AuditEventType::QueryDispatched,
            AuditEventType::QueryCompleted,
            AuditEventType::SessionClosed,
        ]
    );
}

#[tokio::test]
async fn test_required_mfa_activates_session() {
    let services = services(config_with(Decision::RequireMfa)).with_prompt(approving_prompt());
    let (session, mut peers) = session(services, &CancellationToken::new());
    let mut states = session.subscribe();

    let running = tokio::spawn({
        let session = session.clone();
        async move { session.run().await }
    });
    peers.client.write_all(&startup()).await.unwrap();
    assert_eq!(read_startup_packet(&mut peers.backend).await, startup().to_vec());
    states
        .wait_for(|s| *s == SessionState::Active)
        .await
        .unwrap();

    peers.client.write_all(&wire::terminate()).await.unwrap();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_cancel_request_is_forwarded() {
    let (session, mut peers) = session(
        services(config_with(Decision::Deny)),
        &CancellationToken::new(),
    );

    let cancel = request_code(CANCEL_REQUEST_CODE, &[0, 0, 0, 42, 0, 0, 1, 0]);
    peers.client.write_all(&cancel).await.unwrap();

    let outcome = session.run().await.unwrap();
    assert_eq!(outcome, SessionOutcome::CancelForwarded);
    assert_eq!(drain(&mut peers.backend).await, cancel);
}

#[tokio::test]
async fn test_elevation_holds_dispatch_until_ceremony_completes() {
    let gate = Arc::new(Notify::new());
    let services = services(config_with(Decision::Allow)).with_prompt(Arc::new(GatedPrompt {
        gate: gate.clone(),
    }));
    let (session, peers) = session(services, &CancellationToken::new());
    let Peers {
        mut client,
        mut backend,
    } = peers;
    let mut states = session.subscribe();

    let running = tokio::spawn({
        let session = session.clone();
        async move { session.run().await }
    });
    client.write_all(&startup()).await.unwrap();
    read_startup_packet(&mut backend).await;
    states
        .wait_for(|s| *s == SessionState::Active)
        .await
        .unwrap();

    let ctx = CancellationToken::new();
    let elevation = tokio::spawn({
        let session = session.clone();
        let ctx = ctx.clone();
        async move { session.elevate(&ctx).await }
    });
    states
        .wait_for(|s| *s == SessionState::AwaitingMfa)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Only one ceremony at a time.
    let busy = session.elevate(&ctx).await.unwrap_err();
    assert!(matches!(busy, ProxyError::Ceremony(MfaError::Busy)));
    assert_eq!(busy.kind(), ErrorKind::Busy);

    client.write_all(&query("DELETE FROM ledger")).await.unwrap();
    let early = tokio::time::timeout(Duration::from_millis(200), read_message(&mut backend)).await;
    assert!(early.is_err(), "query reached the backend during the ceremony");

    gate.notify_one();
    elevation.await.unwrap().unwrap();
    assert_eq!(session.state(), SessionState::Active);
    assert_eq!(read_message(&mut backend).await.unwrap().0, b'Q');

    client.write_all(&wire::terminate()).await.unwrap();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_elevation_before_startup_is_invalid() {
    let (session, _peers) = session(
        services(config_with(Decision::Allow)).with_prompt(approving_prompt()),
        &CancellationToken::new(),
    );

    let err = session.elevate(&CancellationToken::new()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert_eq!(session.state(), SessionState::Unauthenticated);
}

#[tokio::test]
async fn test_client_disconnect_during_ceremony_closes_session() {
    let gate = Arc::new(Notify::new());
    let services =
        services(config_with(Decision::RequireMfa)).with_prompt(Arc::new(GatedPrompt { gate }));
    let (session, peers) = session(services, &CancellationToken::new());
    let Peers {
        mut client,
        mut backend,
    } = peers;
    let mut states = session.subscribe();

    let running = tokio::spawn({
        let session = session.clone();
        async move { session.run().await }
    });
    client.write_all(&startup()).await.unwrap();
    states
        .wait_for(|s| *s == SessionState::AwaitingMfa)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    drop(client);

    // Well inside the ceremony timeout.
    let err = tokio::time::timeout(Duration::from_secs(1), running)
        .await
        .expect("session outlived its client")
        .unwrap()
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Io);
    assert_eq!(session.state(), SessionState::Closed);
    assert!(drain(&mut backend).await.is_empty());

    // A session whose client left cannot be elevated.
    let late = session.elevate(&CancellationToken::new()).await.unwrap_err();
    assert_eq!(late.kind(), ErrorKind::InvalidState);
}

#[tokio::test]
async fn test_refused_session_cannot_be_elevated_afterwards() {
    let services = services(config_with(Decision::RequireMfa)).with_prompt(declining_prompt());
    let (session, mut peers) = session(services, &CancellationToken::new());

    peers.client.write_all(&startup()).await.unwrap();
    session.run().await.unwrap_err();
    assert_eq!(session.state(), SessionState::AwaitingMfa);

    let err = session.elevate(&CancellationToken::new()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert_eq!(session.state(), SessionState::AwaitingMfa);
}
