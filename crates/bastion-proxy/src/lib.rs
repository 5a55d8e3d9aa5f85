//! # bastion-proxy
//!
//! Postgres wire protocol relay for the Bastion gateway.
//!
//! The gateway sits between a client and an upstream Postgres server. Every
//! connection gets a [`SessionContext`] that reads the startup packet, asks
//! the access policy whether the user may connect, runs an MFA ceremony when
//! the policy requires one and then relays frames in both directions.
//!
//! ## Architecture
//!
//! ```text
//! Client
//!    │
//!    │ Postgres wire protocol
//!    ▼
//! ┌──────────────────────────┐
//! │  GatewayServer           │
//! │  1. Startup packet       │
//! │  2. Policy               │  ← bastion-policy
//! │  3. MFA ceremony         │  ← bastion-mfa
//! │  4. Relay + demux        │
//! │  5. Audit                │  ← bastion-audit
//! └────────────┬─────────────┘
//!              │
//!              ▼
//!      Upstream Postgres
//! ```
//!
//! Frames are relayed without interpreting SQL. The backend direction is fed
//! through a [`Demultiplexer`] that tracks result set and row boundaries so
//! executions can be audited and drained when the client disappears.
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use bastion_core::GatewayConfig;
//! use bastion_mfa::LocalChallengeIssuer;
//! use bastion_policy::StaticPolicy;
//! use bastion_proxy::{GatewayServer, SessionServices};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Arc::new(GatewayConfig::default());
//!     let services = SessionServices::new(
//!         config.clone(),
//!         Arc::new(StaticPolicy::new(&config.policy)),
//!         Arc::new(LocalChallengeIssuer::from_config(&config.mfa)),
//!     );
//!     GatewayServer::new(services).run().await?;
//!     Ok(())
//! }
//! ```

pub mod demux;
pub mod error;
pub mod relay;
pub mod server;
pub mod session;
pub mod stream;
pub mod wire;

pub use demux::{DemuxEvent, DemuxState, Demultiplexer, ResultSetStatus, Transition};
pub use error::{ErrorKind, ProxyError};
pub use relay::{RelayEnd, RelayEngine, RelaySession, RelaySummary};
pub use server::GatewayServer;
pub use session::{SessionContext, SessionIdentity, SessionOutcome, SessionServices, SessionState};
pub use stream::{ResultSet, ResultSetSummary, ResultStream, Row};
pub use wire::{Direction, Frame, FrameHeader, FrameLimits, FrameReader, FrameType};
