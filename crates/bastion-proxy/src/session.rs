//! Session context.
//!
//! One [`SessionContext`] per client connection. It owns the client and
//! backend connections, reads the startup packet, consults the policy, runs
//! the MFA ceremony when required and only then hands both connections to
//! the relay.
//!
//! ```text
//! Unauthenticated ──► AwaitingMFA ──► Active ──► Closed
//!        │                 ▲            │
//!        └─────────────────┼────────────┘ (no MFA required)
//!                          └── elevate ─┘
//! ```

use crate::error::ProxyError;
use crate::relay::{RelayEngine, RelaySession, RelaySummary};
use crate::wire::{self, StartupRequest};
use bastion_audit::{AuditDispatcher, AuditEvent, AuditEventType};
use bastion_core::GatewayConfig;
use bastion_mfa::{CeremonyCoordinator, ChallengeIssuer, MfaError, MfaPrompt};
use bastion_policy::{AccessAction, AccessRequest, Decision, PolicyEvaluator};
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    AwaitingMfa,
    Active,
    Closed,
}

impl SessionState {
    /// Lifecycle moves forward only, except that an active session may go
    /// back to `AwaitingMfa` for an elevated action.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Unauthenticated, AwaitingMfa)
                | (Unauthenticated, Active)
                | (AwaitingMfa, Active)
                | (Active, AwaitingMfa)
                | (Unauthenticated | AwaitingMfa | Active, Closed)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unauthenticated => write!(f, "unauthenticated"),
            Self::AwaitingMfa => write!(f, "awaiting_mfa"),
            Self::Active => write!(f, "active"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Who the session belongs to, taken from the startup packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    pub user: String,
    pub database: String,
}

/// How a session ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    Relayed(RelaySummary),
    /// The connection carried a CancelRequest, which was passed to the backend.
    CancelForwarded,
}

/// Collaborators shared by every session of a gateway.
#[derive(Clone)]
pub struct SessionServices {
    pub config: Arc<GatewayConfig>,
    pub policy: Arc<dyn PolicyEvaluator>,
    pub issuer: Arc<dyn ChallengeIssuer>,
    pub prompt: Option<Arc<dyn MfaPrompt>>,
    pub audit: AuditDispatcher,
}

impl SessionServices {
    pub fn new(
        config: Arc<GatewayConfig>,
        policy: Arc<dyn PolicyEvaluator>,
        issuer: Arc<dyn ChallengeIssuer>,
    ) -> Self {
        Self {
            config,
            policy,
            issuer,
            prompt: None,
            audit: AuditDispatcher::disabled(),
        }
    }

    /// Register the prompt capability used for MFA ceremonies.
    pub fn with_prompt(mut self, prompt: Arc<dyn MfaPrompt>) -> Self {
        self.prompt = Some(prompt);
        self
    }

    pub fn with_audit(mut self, audit: AuditDispatcher) -> Self {
        self.audit = audit;
        self
    }
}

/// State and connections of one client session.
pub struct SessionContext<C, B> {
    id: String,
    services: SessionServices,
    ceremony: CeremonyCoordinator,
    relay: RelayEngine,
    state: watch::Sender<SessionState>,
    identity: OnceLock<SessionIdentity>,
    connections: Mutex<Option<(C, B)>>,
    cancel: CancellationToken,
}

impl<C, B> SessionContext<C, B>
where
    C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    B: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    /// Create a session over an accepted client and a dialed backend.
    /// Cancelling `parent` ends the session.
    pub fn new(
        id: impl Into<String>,
        client: C,
        backend: B,
        services: SessionServices,
        parent: &CancellationToken,
    ) -> Self {
        let ceremony = CeremonyCoordinator::new(
            services.issuer.clone(),
            services.prompt.clone(),
            services.config.mfa.ceremony_timeout(),
        );
        let relay = RelayEngine::new(services.config.relay.clone(), services.audit.clone());
        Self {
            id: id.into(),
            services,
            ceremony,
            relay,
            state: watch::channel(SessionState::Unauthenticated).0,
            identity: OnceLock::new(),
            connections: Mutex::new(Some((client, backend))),
            cancel: parent.child_token(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Observe state changes.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn identity(&self) -> Option<&SessionIdentity> {
        self.identity.get()
    }

    /// Cancel the session: any pending ceremony unwinds and both connections close.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Drive the session to completion.
    ///
    /// A session refused by its MFA ceremony is left in `AwaitingMfa`; every
    /// other ending moves it to `Closed`. Either way the session cannot be
    /// elevated afterwards.
    pub async fn run(&self) -> Result<SessionOutcome, ProxyError> {
        let taken = self
            .connections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some((client, backend)) = taken else {
            return Err(ProxyError::Internal(anyhow::anyhow!(
                "session {} was already run",
                self.id
            )));
        };

        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ProxyError::Cancelled),
            result = self.serve(client, backend) => result,
        };

        // Both connections are gone by now.
        self.cancel.cancel();
        let refused_by_ceremony = matches!(result, Err(ProxyError::Ceremony(_)))
            && self.state() == SessionState::AwaitingMfa;
        if !refused_by_ceremony {
            self.close();
        }

        let mut event = self.event(AuditEventType::SessionClosed);
        if let Err(e) = &result {
            event = event.error(e.to_string());
        }
        self.services.audit.emit(event.build());

        match &result {
            Ok(outcome) => tracing::info!(session = %self.id, outcome = ?outcome, "Session ended"),
            Err(e) => tracing::warn!(
                session = %self.id,
                error = %e,
                kind = %e.kind(),
                state = %self.state(),
                "Session ended with error"
            ),
        }
        result
    }

    async fn serve(&self, mut client: C, mut backend: B) -> Result<SessionOutcome, ProxyError> {
        let startup_timeout = self.services.config.relay.frame_timeout();
        let startup = loop {
            let Some(packet) = wire::read_startup(&mut client, startup_timeout).await? else {
                return Err(ProxyError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "client closed before startup",
                )));
            };
            match packet.request {
                // TLS is terminated in front of the gateway, if anywhere.
                StartupRequest::Ssl | StartupRequest::GssEnc => {
                    client.write_all(b"N").await?;
                    client.flush().await?;
                }
                StartupRequest::Cancel => {
                    tracing::debug!(session = %self.id, "Forwarding cancel request");
                    backend
                        .write_all(packet.as_bytes())
                        .await
                        .map_err(|e| ProxyError::BackendUnavailable(e.to_string()))?;
                    let _ = backend.shutdown().await;
                    return Ok(SessionOutcome::CancelForwarded);
                }
                StartupRequest::Startup { .. } => break packet,
            }
        };

        let user = startup
            .param("user")
            .ok_or_else(|| ProxyError::Protocol("startup packet has no user".to_string()))?
            .to_string();
        let database = startup.param("database").unwrap_or(&user).to_string();
        let identity = self.identity.get_or_init(|| SessionIdentity { user, database });

        tracing::info!(
            session = %self.id,
            user = %identity.user,
            database = %identity.database,
            "Session started"
        );

        // Losing the race drops the ceremony, which releases its prompt.
        let admitted = tokio::select! {
            admitted = self.admit(identity) => admitted,
            gone = client_departure(&mut client) => Err(gone),
        };
        if let Err(e) = admitted {
            refuse(&mut client, &e).await;
            return Err(e);
        }

        backend
            .write_all(startup.as_bytes())
            .await
            .map_err(|e| ProxyError::BackendUnavailable(e.to_string()))?;
        self.services
            .audit
            .emit(self.event(AuditEventType::SessionStarted).build());

        let relay_session = RelaySession {
            id: self.id.clone(),
            user: identity.user.clone(),
            database: identity.database.clone(),
            state: self.state.subscribe(),
            cancel: self.cancel.clone(),
        };
        let summary = self.relay.attach(client, backend, &relay_session).await?;
        Ok(SessionOutcome::Relayed(summary))
    }

    /// Policy check for the connection, followed by the ceremony if required.
    async fn admit(&self, identity: &SessionIdentity) -> Result<(), ProxyError> {
        let decision = self.evaluate(identity, AccessAction::Connect).await?;
        match decision {
            Decision::Allow => self.transition(SessionState::Active),
            Decision::RequireMfa => {
                self.transition(SessionState::AwaitingMfa)?;
                self.ceremony(&self.cancel).await?;
                self.transition(SessionState::Active)
            }
            Decision::Deny => Err(self.denied(identity, AccessAction::Connect)),
        }
    }

    /// Re-assert the user's presence before a privileged action.
    ///
    /// Dispatch frames are held by the relay until the ceremony succeeds. On
    /// failure the session stays in `AwaitingMfa` and may retry with a fresh
    /// challenge.
    pub async fn elevate(&self, ctx: &CancellationToken) -> Result<(), ProxyError> {
        let current = self.state();
        if self.cancel.is_cancelled() {
            return Err(ProxyError::InvalidTransition {
                from: current,
                to: SessionState::Active,
            });
        }
        match current {
            SessionState::Active => {}
            SessionState::AwaitingMfa if self.ceremony.is_pending() => {
                return Err(MfaError::Busy.into());
            }
            SessionState::AwaitingMfa if self.identity.get().is_some() => {}
            other => {
                return Err(ProxyError::InvalidTransition {
                    from: other,
                    to: SessionState::AwaitingMfa,
                });
            }
        }
        let identity = self.identity.get().ok_or(ProxyError::InvalidTransition {
            from: current,
            to: SessionState::AwaitingMfa,
        })?;

        match self.evaluate(identity, AccessAction::Elevate).await? {
            Decision::Deny => Err(self.denied(identity, AccessAction::Elevate)),
            Decision::Allow => self.transition(SessionState::Active),
            Decision::RequireMfa => {
                self.transition(SessionState::AwaitingMfa)?;
                let outcome = tokio::select! {
                    biased;
                    _ = ctx.cancelled() => Err(ProxyError::Ceremony(MfaError::Cancelled)),
                    outcome = self.ceremony(&self.cancel) => outcome,
                };
                outcome?;
                self.transition(SessionState::Active)
            }
        }
    }

    async fn ceremony(&self, ctx: &CancellationToken) -> Result<(), ProxyError> {
        self.services
            .audit
            .emit(self.event(AuditEventType::CeremonyStarted).build());
        match self.ceremony.initiate(ctx, &self.id).await {
            Ok(response) => {
                self.services.audit.emit(
                    self.event(AuditEventType::CeremonySucceeded)
                        .query(format!("method={}", response.method))
                        .build(),
                );
                Ok(())
            }
            Err(e) => {
                self.services.audit.emit(
                    self.event(AuditEventType::CeremonyFailed)
                        .error(e.to_string())
                        .build(),
                );
                Err(e.into())
            }
        }
    }

    async fn evaluate(
        &self,
        identity: &SessionIdentity,
        action: AccessAction,
    ) -> Result<Decision, ProxyError> {
        let request = AccessRequest::new(&identity.user, &identity.database, action);
        self.services
            .policy
            .evaluate(&request)
            .await
            .map_err(ProxyError::Policy)
    }

    fn denied(&self, identity: &SessionIdentity, action: AccessAction) -> ProxyError {
        tracing::warn!(
            session = %self.id,
            user = %identity.user,
            database = %identity.database,
            action = %action,
            "Policy denied"
        );
        self.services.audit.emit(
            self.event(AuditEventType::PolicyDenied)
                .error(format!("{} denied", action))
                .build(),
        );
        ProxyError::PolicyDenied {
            user: identity.user.clone(),
            database: identity.database.clone(),
            action: action.to_string(),
        }
    }

    fn transition(&self, next: SessionState) -> Result<(), ProxyError> {
        let mut result = Ok(());
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            if !current.can_transition_to(next) {
                result = Err(ProxyError::InvalidTransition {
                    from: *current,
                    to: next,
                });
                return false;
            }
            tracing::debug!(session = %self.id, from = %current, to = %next, "Session state changed");
            *current = next;
            true
        });
        result
    }

    fn close(&self) {
        self.state.send_if_modified(|current| {
            if *current == SessionState::Closed {
                return false;
            }
            *current = SessionState::Closed;
            true
        });
    }

    fn event(&self, event_type: AuditEventType) -> bastion_audit::AuditEventBuilder {
        let builder = AuditEvent::builder(event_type, self.id.clone());
        match self.identity.get() {
            Some(identity) => builder
                .user(identity.user.clone())
                .database(identity.database.clone()),
            None => builder,
        }
    }
}

impl<C, B> Drop for SessionContext<C, B> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Resolves when the client hangs up, or speaks out of turn, while the
/// session is still deciding whether to admit it.
async fn client_departure<C: AsyncRead + Unpin>(client: &mut C) -> ProxyError {
    let mut byte = [0u8; 1];
    match client.read(&mut byte).await {
        Ok(0) => ProxyError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "client closed during admission",
        )),
        Ok(_) => ProxyError::Protocol(format!(
            "client sent {:?} before authentication completed",
            byte[0] as char
        )),
        Err(e) => ProxyError::Io(e),
    }
}

/// Tell the client why it is being turned away. Best effort.
async fn refuse<C: AsyncWrite + Unpin>(client: &mut C, error: &ProxyError) {
    let frame = wire::error_response(error.sqlstate(), &error.to_string());
    if client.write_all(&frame).await.is_ok() {
        let _ = client.flush().await;
    }
}
