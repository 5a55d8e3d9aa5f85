//! Audit event types.
//!
//! Every event carries the session it belongs to. Query events add the
//! redacted query text, and completion events add row count and duration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Type of audit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    // ===== Session lifecycle =====
    /// A session was admitted and the relay started.
    SessionStarted,
    /// A session ended.
    SessionClosed,
    /// The policy refused the session or an elevation.
    PolicyDenied,

    // ===== MFA ceremony =====
    /// An MFA ceremony was started.
    CeremonyStarted,
    /// An MFA ceremony completed.
    CeremonySucceeded,
    /// An MFA ceremony failed.
    CeremonyFailed,

    // ===== Query traffic =====
    /// A query-dispatch frame was forwarded to the backend.
    QueryDispatched,
    /// The backend reported the execution ready for the next query.
    QueryCompleted,
    /// The backend reported an error for the execution.
    QueryFailed,
}

impl std::fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SessionStarted => write!(f, "SESSION_STARTED"),
            Self::SessionClosed => write!(f, "SESSION_CLOSED"),
            Self::PolicyDenied => write!(f, "POLICY_DENIED"),
            Self::CeremonyStarted => write!(f, "CEREMONY_STARTED"),
            Self::CeremonySucceeded => write!(f, "CEREMONY_SUCCEEDED"),
            Self::CeremonyFailed => write!(f, "CEREMONY_FAILED"),
            Self::QueryDispatched => write!(f, "QUERY_DISPATCHED"),
            Self::QueryCompleted => write!(f, "QUERY_COMPLETED"),
            Self::QueryFailed => write!(f, "QUERY_FAILED"),
        }
    }
}

/// An audit event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Unique event ID.
    pub event_id: Uuid,

    /// When the event occurred.
    pub occurred_at: DateTime<Utc>,

    /// Event type.
    pub event_type: AuditEventType,

    /// Session the event belongs to.
    pub session_id: String,

    /// Database user of the session.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    /// Target database of the session.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,

    /// Redacted query text or statement identifier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,

    /// Rows returned to the client.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_count: Option<u64>,

    /// Result sets produced by the execution.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_sets: Option<u32>,

    /// Duration in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,

    /// Error message (if event_type indicates failure).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AuditEvent {
    /// Create a new audit event for a session.
    pub fn new(event_type: AuditEventType, session_id: impl Into<String>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            occurred_at: Utc::now(),
            event_type,
            session_id: session_id.into(),
            user: None,
            database: None,
            query: None,
            row_count: None,
            result_sets: None,
            duration_ms: None,
            error: None,
        }
    }

    /// Create a builder for an audit event.
    pub fn builder(
        event_type: AuditEventType,
        session_id: impl Into<String>,
    ) -> AuditEventBuilder {
        AuditEventBuilder {
            event: Self::new(event_type, session_id),
        }
    }

    /// Format the event as a human-readable log line.
    pub fn to_log_line(&self) -> String {
        let mut line = format!(
            "[{}] {} session={} user={} db={}",
            self.occurred_at.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            self.event_type,
            self.session_id,
            self.user.as_deref().unwrap_or("-"),
            self.database.as_deref().unwrap_or("-"),
        );
        if let Some(query) = &self.query {
            line.push_str(&format!(" query=\"{}\"", query));
        }
        if let Some(rows) = self.row_count {
            line.push_str(&format!(" rows={}", rows));
        }
        if let Some(ms) = self.duration_ms {
            line.push_str(&format!(" duration_ms={}", ms));
        }
        if let Some(error) = &self.error {
            line.push_str(&format!(" error=\"{}\"", error));
        }
        line
    }
}

/// Builder for [`AuditEvent`].
#[derive(Debug, Clone)]
pub struct AuditEventBuilder {
    event: AuditEvent,
}

impl AuditEventBuilder {
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.event.user = Some(user.into());
        self
    }

    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.event.database = Some(database.into());
        self
    }

    pub fn query(mut self, query: impl Into<String>) -> Self {
        self.event.query = Some(query.into());
        self
    }

    pub fn row_count(mut self, rows: u64) -> Self {
        self.event.row_count = Some(rows);
        self
    }

    pub fn result_sets(mut self, count: u32) -> Self {
        self.event.result_sets = Some(count);
        self
    }

    pub fn duration_ms(mut self, ms: u64) -> Self {
        self.event.duration_ms = Some(ms);
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.event.error = Some(error.into());
        self
    }

    pub fn build(self) -> AuditEvent {
        self.event
    }
}
