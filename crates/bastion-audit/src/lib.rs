//! # bastion-audit
//!
//! Best-effort audit trail for the Bastion gateway.
//!
//! Audit delivery sits next to the data path, never on it. Relays hand events
//! to an [`AuditDispatcher`], which queues them without waiting; a worker task
//! delivers them to an [`AuditSink`] with a per-event deadline. A slow or
//! failing sink costs audit events, not query latency.
//!
//! ## Event Types
//!
//! | Event Type | Description |
//! |------------|-------------|
//! | `SessionStarted` | Session admitted and relay started |
//! | `SessionClosed` | Session ended |
//! | `PolicyDenied` | Session or elevation refused by policy |
//! | `CeremonyStarted` | MFA ceremony started |
//! | `CeremonySucceeded` | MFA ceremony completed |
//! | `CeremonyFailed` | MFA ceremony failed, timed out or was cancelled |
//! | `QueryDispatched` | Query frame forwarded to the backend |
//! | `QueryCompleted` | Backend ready for the next query |
//! | `QueryFailed` | Backend reported an error |
//!
//! Query text is passed through [`redact_query`] before it is attached to an
//! event, so literal values never reach the sink.
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use bastion_audit::{AuditDispatcher, AuditEvent, AuditEventType, create_sink};
//! use bastion_core::AuditConfig;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AuditConfig::default();
//! let sink = create_sink(&config)?;
//! let (audit, _worker) = AuditDispatcher::spawn(sink, &config);
//!
//! audit.emit(
//!     AuditEvent::builder(AuditEventType::SessionStarted, "sess-1")
//!         .user("alice")
//!         .database("billing")
//!         .build(),
//! );
//! # Ok(())
//! # }
//! ```

pub mod dispatcher;
pub mod error;
pub mod event;
pub mod redact;
pub mod storage;

pub use dispatcher::AuditDispatcher;
pub use error::AuditError;
pub use event::{AuditEvent, AuditEventBuilder, AuditEventType};
pub use redact::redact_query;
pub use storage::{
    AuditSink, JsonLinesSink, MemorySink, NullSink, StdoutSink, TracingSink, create_sink,
};
