//! Non-blocking audit dispatch.
//!
//! The data path hands events to [`AuditDispatcher::emit`], which never waits.
//! A single worker task drains the queue into the sink, bounding each delivery
//! with the configured timeout. When the queue is full the event is dropped
//! and counted.

use crate::event::AuditEvent;
use crate::storage::AuditSink;
use bastion_core::AuditConfig;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Cloneable handle for emitting audit events.
#[derive(Clone)]
pub struct AuditDispatcher {
    sender: Option<mpsc::Sender<AuditEvent>>,
    dropped: Arc<AtomicU64>,
}

impl AuditDispatcher {
    /// Start the delivery worker for `sink`.
    ///
    /// The worker exits once every dispatcher clone has been dropped and the
    /// queue is empty.
    pub fn spawn(sink: Arc<dyn AuditSink>, config: &AuditConfig) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let dropped = Arc::new(AtomicU64::new(0));
        let handle = tokio::spawn(deliver(rx, sink, config.delivery_timeout()));
        (
            Self {
                sender: Some(tx),
                dropped,
            },
            handle,
        )
    }

    /// A dispatcher that discards everything without a worker.
    pub fn disabled() -> Self {
        Self {
            sender: None,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Build a dispatcher from configuration, or a disabled one when audit is off.
    pub fn from_config(
        sink: Arc<dyn AuditSink>,
        config: &AuditConfig,
    ) -> (Self, Option<JoinHandle<()>>) {
        if config.enabled {
            let (dispatcher, handle) = Self::spawn(sink, config);
            (dispatcher, Some(handle))
        } else {
            (Self::disabled(), None)
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.sender.is_some()
    }

    /// Queue an event for delivery. Never blocks the caller.
    pub fn emit(&self, event: AuditEvent) {
        let Some(sender) = &self.sender else {
            return;
        };
        match sender.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(
                    event_type = %event.event_type,
                    session_id = %event.session_id,
                    dropped_total = total,
                    "Audit queue full, event dropped"
                );
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    event_type = %event.event_type,
                    "Audit worker stopped, event dropped"
                );
            }
        }
    }

    /// Number of events dropped since the dispatcher was created.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for AuditDispatcher {
    fn default() -> Self {
        Self::disabled()
    }
}

impl std::fmt::Debug for AuditDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditDispatcher")
            .field("enabled", &self.is_enabled())
            .field("dropped", &self.dropped())
            .finish()
    }
}

async fn deliver(
    mut rx: mpsc::Receiver<AuditEvent>,
    sink: Arc<dyn AuditSink>,
    delivery_timeout: Duration,
) {
    while let Some(event) = rx.recv().await {
        let event_id = event.event_id;
        match tokio::time::timeout(delivery_timeout, sink.store(event)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(%event_id, error = %e, "Audit sink rejected event");
            }
            Err(_) => {
                tracing::warn!(
                    %event_id,
                    timeout_ms = delivery_timeout.as_millis() as u64,
                    "Audit sink timed out"
                );
            }
        }
    }
    tracing::debug!("Audit worker finished");
}
