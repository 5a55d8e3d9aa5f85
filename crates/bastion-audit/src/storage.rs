//! Audit sinks.

use crate::error::AuditError;
use crate::event::{AuditEvent, AuditEventType};
use async_trait::async_trait;
use bastion_core::{AuditConfig, AuditOutput};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Trait for audit event destinations.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Deliver one audit event.
    async fn store(&self, event: AuditEvent) -> Result<(), AuditError>;
}

/// Create a sink based on configuration.
pub fn create_sink(config: &AuditConfig) -> Result<Arc<dyn AuditSink>, AuditError> {
    if !config.enabled {
        return Ok(Arc::new(NullSink));
    }
    match config.output {
        AuditOutput::Stdout => Ok(Arc::new(StdoutSink)),
        AuditOutput::Tracing => Ok(Arc::new(TracingSink)),
        AuditOutput::File => {
            let path = config.path.as_deref().ok_or_else(|| {
                AuditError::InitializationFailed("file output requires a path".to_string())
            })?;
            Ok(Arc::new(JsonLinesSink::new(path)))
        }
    }
}

/// Discards every event.
pub struct NullSink;

#[async_trait]
impl AuditSink for NullSink {
    async fn store(&self, _event: AuditEvent) -> Result<(), AuditError> {
        Ok(())
    }
}

/// Writes events as JSON lines to stdout.
pub struct StdoutSink;

#[async_trait]
impl AuditSink for StdoutSink {
    async fn store(&self, event: AuditEvent) -> Result<(), AuditError> {
        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');
        let mut stdout = tokio::io::stdout();
        stdout.write_all(&line).await?;
        stdout.flush().await?;
        Ok(())
    }
}

/// Emits events through `tracing` under the `audit` target.
pub struct TracingSink;

#[async_trait]
impl AuditSink for TracingSink {
    async fn store(&self, event: AuditEvent) -> Result<(), AuditError> {
        match event.event_type {
            AuditEventType::PolicyDenied
            | AuditEventType::CeremonyFailed
            | AuditEventType::QueryFailed => {
                tracing::warn!(target: "audit", event_id = %event.event_id, "{}", event.to_log_line());
            }
            _ => {
                tracing::info!(target: "audit", event_id = %event.event_id, "{}", event.to_log_line());
            }
        }
        Ok(())
    }
}

/// Appends events as JSON lines to a file.
///
/// The file is opened lazily on the first event and kept open afterwards.
pub struct JsonLinesSink {
    path: PathBuf,
    file: Mutex<Option<tokio::fs::File>>,
}

impl JsonLinesSink {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl AuditSink for JsonLinesSink {
    async fn store(&self, event: AuditEvent) -> Result<(), AuditError> {
        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');

        let mut guard = self.file.lock().await;
        if guard.is_none() {
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            *guard = Some(file);
        }
        let file = guard
            .as_mut()
            .ok_or_else(|| AuditError::StorageError("audit file not open".to_string()))?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Keeps events in memory. Used by tests and embedders that inspect
/// the audit trail directly.
#[derive(Default)]
pub struct MemorySink {
    events: RwLock<Vec<AuditEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every stored event, oldest first.
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.read().map(|e| e.clone()).unwrap_or_default()
    }

    /// Stored events of one type.
    pub fn events_of(&self, event_type: AuditEventType) -> Vec<AuditEvent> {
        self.events
            .read()
            .map(|events| {
                events
                    .iter()
                    .filter(|e| e.event_type == event_type)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.events.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl AuditSink for MemorySink {
    async fn store(&self, event: AuditEvent) -> Result<(), AuditError> {
        let mut events = self.events.write().map_err(|e| {
            AuditError::StorageError(format!("Failed to acquire write lock: {}", e))
        })?;
        events.push(event);
        Ok(())
    }
}
