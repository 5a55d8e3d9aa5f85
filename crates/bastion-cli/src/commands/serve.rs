//! Serve command for starting the gateway.
//!
//! `bastion serve` - Start the Postgres gateway.

use anyhow::Context;
use async_trait::async_trait;
use bastion_audit::{AuditDispatcher, create_sink};
use bastion_core::{GatewayConfig, MethodKind};
use bastion_mfa::{Challenge, ChallengeResponse, LocalChallengeIssuer, MfaPrompt};
use bastion_policy::StaticPolicy;
use bastion_proxy::{GatewayServer, SessionServices};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader, Stdin};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// How long queued audit events may take to flush on shutdown.
const AUDIT_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum PromptMode {
    /// The operator types the one-time code for each challenge on stdin.
    Console,
    /// No prompt; sessions that require MFA are refused.
    #[value(name = "none")]
    Disabled,
}

pub async fn serve(config_path: PathBuf, prompt: PromptMode) -> anyhow::Result<()> {
    tracing::info!(config = %config_path.display(), "Loading configuration");
    let config = GatewayConfig::from_file(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    let config = Arc::new(config);

    let sink = create_sink(&config.audit).context("failed to initialize audit sink")?;
    let (audit, audit_worker) = AuditDispatcher::from_config(sink, &config.audit);
    tracing::info!(
        enabled = audit.is_enabled(),
        output = ?config.audit.output,
        "Audit pipeline ready"
    );

    let policy = Arc::new(StaticPolicy::new(&config.policy));
    tracing::info!(
        rules = config.policy.rules.len(),
        default_decision = ?config.policy.default_decision,
        "Policy loaded"
    );

    let issuer = Arc::new(LocalChallengeIssuer::from_config(&config.mfa));
    let mut services = SessionServices::new(config.clone(), policy, issuer).with_audit(audit);
    match prompt {
        PromptMode::Console => services = services.with_prompt(Arc::new(ConsolePrompt::new())),
        PromptMode::Disabled => {
            tracing::warn!("No MFA prompt registered, sessions requiring MFA will be refused")
        }
    }

    let server = GatewayServer::new(services);
    let shutdown = server.shutdown_token();
    tokio::spawn(cancel_on_ctrl_c(shutdown));

    server.run().await?;
    drop(server);

    if let Some(worker) = audit_worker {
        // Sessions unwinding after shutdown still hold dispatcher clones.
        if tokio::time::timeout(AUDIT_FLUSH_TIMEOUT, worker).await.is_err() {
            tracing::warn!("Audit worker did not finish flushing before exit");
        }
    }
    tracing::info!("Gateway stopped");
    Ok(())
}

async fn cancel_on_ctrl_c(shutdown: CancellationToken) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Received Ctrl-C, shutting down"),
        Err(e) => tracing::error!(error = %e, "Failed to listen for Ctrl-C"),
    }
    shutdown.cancel();
}

/// Asks the gateway operator for a one-time code.
///
/// Ceremonies share one terminal, so they are answered one at a time.
struct ConsolePrompt {
    stdin: Mutex<BufReader<Stdin>>,
}

impl ConsolePrompt {
    fn new() -> Self {
        Self {
            stdin: Mutex::new(BufReader::new(tokio::io::stdin())),
        }
    }
}

#[async_trait]
impl MfaPrompt for ConsolePrompt {
    async fn prompt(
        &self,
        ctx: &CancellationToken,
        challenge: &Challenge,
    ) -> anyhow::Result<ChallengeResponse> {
        if !challenge.accepted_methods().contains(&MethodKind::Totp) {
            anyhow::bail!("challenge does not accept one-time codes");
        }

        let mut stdin = self.stdin.lock().await;
        eprintln!(
            "MFA challenge {} (expires {}): enter one-time code:",
            challenge.nonce(),
            challenge.expires_at()
        );

        let mut line = String::new();
        let read = tokio::select! {
            _ = ctx.cancelled() => anyhow::bail!("prompt cancelled"),
            read = stdin.read_line(&mut line) => read.context("failed to read from stdin")?,
        };
        if read == 0 {
            anyhow::bail!("stdin closed");
        }

        let code = line.trim();
        if code.is_empty() {
            anyhow::bail!("no code entered");
        }
        Ok(ChallengeResponse::for_challenge(
            challenge,
            MethodKind::Totp,
            code.as_bytes().to_vec(),
        ))
    }
}
