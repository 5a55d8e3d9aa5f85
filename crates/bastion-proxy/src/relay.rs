//! Protocol relay engine.
//!
//! Each attached session runs two pumps as separate tasks:
//!
//! - **client → backend**: forwards frames, streaming payloads in bounded
//!   chunks. Query-dispatch frames wait for the session to be `Active`
//!   and produce audit events.
//! - **backend → client**: classifies frames, drives the [`Demultiplexer`]
//!   and writes each frame to the client before reading the next one, so a
//!   slow client stops the pump instead of growing a buffer.
//!
//! When one pump ends the other is cancelled. The exception is a client that
//! disappears while executions are still in flight: the backend is allowed
//! to finish them (output discarded), then receives Terminate. A client that
//! disappears partway through a frame leaves the backend mid-message, so the
//! backend connection is shut down without Terminate.

use crate::demux::{DemuxEvent, Demultiplexer};
use crate::error::ProxyError;
use crate::session::SessionState;
use crate::wire::{self, Direction, FrameLimits, FrameReader, FrameType};
use bastion_audit::{AuditDispatcher, AuditEvent, AuditEventType, redact_query};
use bastion_core::RelayConfig;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

/// What the relay needs to know about its session.
#[derive(Debug, Clone)]
pub struct RelaySession {
    pub id: String,
    pub user: String,
    pub database: String,
    /// Dispatch frames are held while this is not `Active`.
    pub state: watch::Receiver<SessionState>,
    /// Cancelling this closes both connections.
    pub cancel: CancellationToken,
}

/// How a relay ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    /// The client sent Terminate.
    ClientTerminated,
    /// The client connection closed. `drained` is false when in-flight
    /// executions could not be finished within the drain timeout.
    ClientClosed { drained: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelaySummary {
    pub end: RelayEnd,
    /// Executions completed by a ReadyForQuery.
    pub executions: u64,
    pub result_sets: u64,
    pub rows: u64,
}

/// Relays one client/backend connection pair.
#[derive(Debug, Clone)]
pub struct RelayEngine {
    config: RelayConfig,
    audit: AuditDispatcher,
}

impl RelayEngine {
    pub fn new(config: RelayConfig, audit: AuditDispatcher) -> Self {
        Self { config, audit }
    }

    /// Relay until either side closes, a fatal error occurs or the session
    /// is cancelled. Both connections are closed when this returns.
    pub async fn attach<C, B>(
        &self,
        client: C,
        backend: B,
        session: &RelaySession,
    ) -> Result<RelaySummary, ProxyError>
    where
        C: AsyncRead + AsyncWrite + Send + 'static,
        B: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (client_read, client_write) = tokio::io::split(client);
        let (backend_read, backend_write) = tokio::io::split(backend);
        let stop = session.cancel.child_token();
        let inflight = Arc::new(Inflight::default());
        let meta = Arc::new(SessionMeta {
            id: session.id.clone(),
            user: session.user.clone(),
            database: session.database.clone(),
        });

        tracing::info!(
            session = %meta.id,
            user = %meta.user,
            database = %meta.database,
            max_frame_size = self.config.max_frame_size,
            "Relay attached"
        );

        let client_pump = ClientPump {
            reader: FrameReader::new(
                client_read,
                Direction::Frontend,
                FrameLimits::frontend(&self.config),
            ),
            backend: backend_write,
            state: session.state.clone(),
            inflight: inflight.clone(),
            audit: self.audit.clone(),
            meta: meta.clone(),
            capture_limit: self.config.audit_capture_bytes,
            statement: None,
        };
        let backend_pump = BackendPump {
            reader: FrameReader::new(
                backend_read,
                Direction::Backend,
                FrameLimits::backend(&self.config),
            ),
            client: client_write,
            demux: Demultiplexer::new(),
            inflight: inflight.clone(),
            audit: self.audit.clone(),
            meta: meta.clone(),
        };

        let mut upstream = tokio::spawn(client_pump.run(stop.clone()));
        let mut downstream = tokio::spawn(backend_pump.run(stop.clone()));

        let result = tokio::select! {
            biased;
            joined = &mut upstream => {
                self.client_finished(joined, downstream, &inflight, &stop).await
            }
            joined = &mut downstream => {
                stop.cancel();
                let client_side = upstream.await;
                backend_finished(joined, client_side).await
            }
        };
        stop.cancel();

        match &result {
            Ok(end) => tracing::info!(
                session = %meta.id,
                end = ?end,
                executions = inflight.executions.load(Ordering::Relaxed),
                rows = inflight.rows.load(Ordering::Relaxed),
                "Relay finished"
            ),
            Err(e) => tracing::warn!(
                session = %meta.id,
                error = %e,
                kind = %e.kind(),
                "Relay failed"
            ),
        }

        result.map(|end| RelaySummary {
            end,
            executions: inflight.executions.load(Ordering::Relaxed),
            result_sets: inflight.result_sets.load(Ordering::Relaxed),
            rows: inflight.rows.load(Ordering::Relaxed),
        })
    }

    async fn client_finished<B>(
        &self,
        joined: Result<ClientOutcome<B>, JoinError>,
        mut downstream: JoinHandle<Result<BackendExit, ProxyError>>,
        inflight: &Inflight,
        stop: &CancellationToken,
    ) -> Result<RelayEnd, ProxyError>
    where
        B: AsyncWrite,
    {
        let (exit, mut backend) = match joined {
            Ok(outcome) => outcome,
            Err(e) => {
                stop.cancel();
                let _ = downstream.await;
                return Err(join_failed(e));
            }
        };

        match exit {
            Ok(ClientExit::Closed) => {}
            Ok(ClientExit::Truncated) => {
                stop.cancel();
                let _ = downstream.await;
                let pending = inflight.mark_client_gone();
                tracing::info!(pending, "Client closed mid-frame, closing backend without Terminate");
                let _ = backend.shutdown().await;
                return Ok(RelayEnd::ClientClosed { drained: false });
            }
            Ok(ClientExit::Terminated) => {
                stop.cancel();
                let _ = downstream.await;
                return Ok(RelayEnd::ClientTerminated);
            }
            Ok(ClientExit::Stopped) => {
                stop.cancel();
                let _ = downstream.await;
                return Err(ProxyError::Cancelled);
            }
            Err(e) => {
                stop.cancel();
                let _ = downstream.await;
                return Err(e);
            }
        }

        let pending = inflight.mark_client_gone();
        let mut drained = true;
        let mut finished = false;
        if pending > 0 {
            tracing::info!(
                pending,
                timeout_ms = self.config.drain_timeout_ms,
                "Client gone mid-execution, draining backend"
            );
            match tokio::time::timeout(self.config.drain_timeout(), &mut downstream).await {
                Ok(joined) => {
                    finished = true;
                    match joined {
                        Ok(Ok(BackendExit::Drained)) => {}
                        Ok(Ok(other)) => {
                            drained = false;
                            tracing::debug!(exit = ?other, "Backend pump ended before draining");
                        }
                        Ok(Err(e)) => {
                            drained = false;
                            tracing::warn!(error = %e, "Backend failed while draining");
                        }
                        Err(e) => {
                            drained = false;
                            tracing::warn!(error = %e, "Backend pump task failed while draining");
                        }
                    }
                }
                Err(_) => {
                    drained = false;
                    tracing::warn!(
                        timeout_ms = self.config.drain_timeout_ms,
                        "Backend did not finish in-flight executions in time"
                    );
                }
            }
        }

        stop.cancel();
        if !finished {
            let _ = downstream.await;
        }
        send_terminate(&mut backend).await;
        Ok(RelayEnd::ClientClosed { drained })
    }
}

async fn backend_finished<B>(
    joined: Result<Result<BackendExit, ProxyError>, JoinError>,
    client_side: Result<ClientOutcome<B>, JoinError>,
) -> Result<RelayEnd, ProxyError>
where
    B: AsyncWrite,
{
    let exit = joined.map_err(join_failed)??;
    match exit {
        BackendExit::Drained => {
            if let Ok((Ok(ClientExit::Closed), mut backend)) = client_side {
                send_terminate(&mut backend).await;
            }
            Ok(RelayEnd::ClientClosed { drained: true })
        }
        BackendExit::Closed => match client_side {
            // The backend closing right after Terminate is the normal ending.
            Ok((Ok(ClientExit::Terminated), _)) => Ok(RelayEnd::ClientTerminated),
            _ => Err(ProxyError::BackendUnavailable(
                "backend closed the connection".to_string(),
            )),
        },
        BackendExit::Stopped => Err(ProxyError::Cancelled),
    }
}

async fn send_terminate<W: AsyncWrite + Unpin>(backend: &mut W) {
    if let Err(e) = backend.write_all(&wire::terminate()).await {
        tracing::debug!(error = %e, "Could not send Terminate to backend");
        return;
    }
    let _ = backend.flush().await;
    let _ = backend.shutdown().await;
}

fn join_failed(e: JoinError) -> ProxyError {
    ProxyError::Internal(anyhow::anyhow!("relay task failed: {}", e))
}

fn backend_lost(e: std::io::Error) -> ProxyError {
    ProxyError::BackendUnavailable(e.to_string())
}

struct SessionMeta {
    id: String,
    user: String,
    database: String,
}

impl SessionMeta {
    fn event(&self, event_type: AuditEventType) -> bastion_audit::AuditEventBuilder {
        AuditEvent::builder(event_type, self.id.clone())
            .user(self.user.clone())
            .database(self.database.clone())
    }
}

/// Dispatches awaiting their ReadyForQuery, shared by both pumps.
#[derive(Default)]
struct Inflight {
    state: Mutex<InflightState>,
    executions: AtomicU64,
    result_sets: AtomicU64,
    rows: AtomicU64,
}

#[derive(Default)]
struct InflightState {
    queue: VecDeque<Dispatch>,
    client_gone: bool,
}

struct Dispatch {
    query: Option<String>,
    started: Instant,
}

impl Inflight {
    fn lock(&self) -> MutexGuard<'_, InflightState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn begin(&self, query: Option<String>) {
        self.lock().queue.push_back(Dispatch {
            query,
            started: Instant::now(),
        });
    }

    /// Pop the oldest dispatch. The flag is true once the client is gone and
    /// nothing is left in flight.
    fn complete(&self) -> (Option<Dispatch>, bool) {
        let mut state = self.lock();
        let dispatch = state.queue.pop_front();
        (dispatch, state.client_gone && state.queue.is_empty())
    }

    fn pending(&self) -> usize {
        self.lock().queue.len()
    }

    /// Returns the number of executions still in flight.
    fn mark_client_gone(&self) -> usize {
        let mut state = self.lock();
        state.client_gone = true;
        state.queue.len()
    }

    fn client_gone(&self) -> bool {
        self.lock().client_gone
    }
}

// ============================================================================
// client → backend
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientExit {
    Closed,
    /// Closed after part of a frame had already been forwarded.
    Truncated,
    Terminated,
    Stopped,
}

/// The backend write half comes back so the relay can still send Terminate.
type ClientOutcome<B> = (Result<ClientExit, ProxyError>, WriteHalf<B>);

struct ClientPump<C, B> {
    reader: FrameReader<ReadHalf<C>>,
    backend: WriteHalf<B>,
    state: watch::Receiver<SessionState>,
    inflight: Arc<Inflight>,
    audit: AuditDispatcher,
    meta: Arc<SessionMeta>,
    capture_limit: usize,
    /// Query text of the last Parse, reported when its Sync completes.
    statement: Option<String>,
}

impl<C, B> ClientPump<C, B>
where
    C: AsyncRead,
    B: AsyncWrite,
{
    async fn run(mut self, stop: CancellationToken) -> ClientOutcome<B> {
        let result = loop {
            tokio::select! {
                _ = stop.cancelled() => break Ok(ClientExit::Stopped),
                step = self.step() => match step {
                    Ok(None) => {}
                    Ok(Some(exit)) => break Ok(exit),
                    Err(e) => break Err(e),
                },
            }
        };
        (result, self.backend)
    }

    async fn step(&mut self) -> Result<Option<ClientExit>, ProxyError> {
        let header = match self.reader.next_header().await {
            Ok(Some(header)) => header,
            Ok(None) => return Ok(Some(ClientExit::Closed)),
            Err(e) if e.is_disconnect() => {
                tracing::debug!(session = %self.meta.id, error = %e, "Client read failed");
                return Ok(Some(ClientExit::Closed));
            }
            Err(e) => return Err(e),
        };
        let frame_type = header.frame_type;

        if frame_type.is_dispatch() && !self.wait_until_active().await {
            return Ok(Some(ClientExit::Stopped));
        }

        self.backend
            .write_all(&header.encode())
            .await
            .map_err(backend_lost)?;

        let limit = if frame_type.is_dispatch() {
            self.capture_limit
        } else {
            0
        };
        let mut capture = Vec::new();
        let mut remaining = header.payload_len();
        while remaining > 0 {
            let chunk = match self.reader.read_chunk(&mut remaining).await {
                Ok(chunk) => chunk,
                Err(e) if e.is_disconnect() => return Ok(Some(ClientExit::Truncated)),
                Err(e) => return Err(e),
            };
            if capture.len() < limit {
                let take = (limit - capture.len()).min(chunk.len());
                capture.extend_from_slice(&chunk[..take]);
            }
            self.backend.write_all(chunk).await.map_err(backend_lost)?;
        }
        self.backend.flush().await.map_err(backend_lost)?;

        tracing::trace!(session = %self.meta.id, frame = %frame_type, len = header.length, "Forwarded client frame");
        self.after_forward(frame_type, &capture);

        if frame_type == FrameType::Terminate {
            return Ok(Some(ClientExit::Terminated));
        }
        Ok(None)
    }

    /// Hold a dispatch frame until the session is `Active`. False if the
    /// session closed instead.
    async fn wait_until_active(&mut self) -> bool {
        if *self.state.borrow() == SessionState::Active {
            return true;
        }
        tracing::debug!(session = %self.meta.id, "Holding dispatch until session is active");
        match self
            .state
            .wait_for(|s| matches!(s, SessionState::Active | SessionState::Closed))
            .await
        {
            Ok(state) => *state == SessionState::Active,
            Err(_) => false,
        }
    }

    fn after_forward(&mut self, frame_type: FrameType, capture: &[u8]) {
        match frame_type {
            FrameType::Query => {
                let query = redact_query(&wire::leading_cstr(capture), self.capture_limit);
                self.audit_dispatch(&query);
                self.inflight.begin(Some(query));
            }
            FrameType::Parse => {
                let query = redact_query(&wire::second_cstr(capture), self.capture_limit);
                self.audit_dispatch(&query);
                self.statement = Some(query);
            }
            FrameType::Bind => {
                let statement = wire::second_cstr(capture);
                self.audit_dispatch(&format!("BIND {}", display_name(&statement)));
            }
            FrameType::Execute => {
                let portal = wire::leading_cstr(capture);
                self.audit_dispatch(&format!("EXECUTE {}", display_name(&portal)));
            }
            FrameType::Sync => self.inflight.begin(self.statement.take()),
            _ => {}
        }
    }

    fn audit_dispatch(&self, query: &str) {
        self.audit.emit(
            self.meta
                .event(AuditEventType::QueryDispatched)
                .query(query)
                .build(),
        );
    }
}

fn display_name(name: &str) -> &str {
    if name.is_empty() { "<unnamed>" } else { name }
}

// ============================================================================
// backend → client
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BackendExit {
    /// The backend closed its connection.
    Closed,
    /// The client is gone and every in-flight execution has completed.
    Drained,
    Stopped,
}

struct BackendPump<B, C> {
    reader: FrameReader<ReadHalf<B>>,
    client: WriteHalf<C>,
    demux: Demultiplexer,
    inflight: Arc<Inflight>,
    audit: AuditDispatcher,
    meta: Arc<SessionMeta>,
}

impl<B, C> BackendPump<B, C>
where
    B: AsyncRead,
    C: AsyncWrite,
{
    async fn run(mut self, stop: CancellationToken) -> Result<BackendExit, ProxyError> {
        loop {
            tokio::select! {
                _ = stop.cancelled() => return Ok(BackendExit::Stopped),
                step = self.step() => {
                    if let Some(exit) = step? {
                        return Ok(exit);
                    }
                }
            }
        }
    }

    async fn step(&mut self) -> Result<Option<BackendExit>, ProxyError> {
        let header = match self.reader.next_header().await {
            Ok(Some(header)) => header,
            Ok(None) => return Ok(Some(self.backend_gone(None).await)),
            Err(e) if e.is_disconnect() => return Ok(Some(self.backend_gone(Some(e)).await)),
            Err(e) => return Err(e),
        };
        let transition = self.demux.observe(header.frame_type)?;

        match header.frame_type {
            // Opaque frames (CopyData, notices, auth) can be large; pass them through.
            FrameType::Unknown(_) => {
                deliver(&mut self.client, &self.inflight, &header.encode()).await;
                let mut remaining = header.payload_len();
                while remaining > 0 {
                    let chunk = match self.reader.read_chunk(&mut remaining).await {
                        Ok(chunk) => chunk,
                        Err(e) if e.is_disconnect() => {
                            return Ok(Some(self.backend_gone(Some(e)).await));
                        }
                        Err(e) => return Err(e),
                    };
                    deliver(&mut self.client, &self.inflight, chunk).await;
                }
            }
            // Rows and result markers go out whole or not at all.
            _ => {
                let frame = match self.reader.read_frame(header).await {
                    Ok(frame) => frame,
                    Err(e) if e.is_disconnect() => {
                        return Ok(Some(self.backend_gone(Some(e)).await));
                    }
                    Err(e) => return Err(e),
                };
                deliver(&mut self.client, &self.inflight, frame.as_bytes()).await;
            }
        }
        if !self.inflight.client_gone() {
            let _ = self.client.flush().await;
        }

        let row = if header.frame_type == FrameType::DataRow {
            Some(self.demux.complete_row()?)
        } else {
            None
        };
        for event in transition.chain(row) {
            if self.on_event(event) {
                return Ok(Some(BackendExit::Drained));
            }
        }
        Ok(None)
    }

    /// Returns true once the relay has nothing left to drain.
    fn on_event(&mut self, event: DemuxEvent) -> bool {
        match event {
            DemuxEvent::Row { .. } => {
                self.inflight.rows.fetch_add(1, Ordering::Relaxed);
            }
            DemuxEvent::ResultSetEnd {
                index,
                rows,
                status,
            } => {
                self.inflight.result_sets.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(session = %self.meta.id, index, rows, status = ?status, "Result set ended");
            }
            DemuxEvent::ExecutionComplete {
                result_sets,
                rows,
                failed,
            } => {
                let (dispatch, drained) = self.inflight.complete();
                if let Some(dispatch) = dispatch {
                    self.inflight.executions.fetch_add(1, Ordering::Relaxed);
                    let event_type = if failed {
                        AuditEventType::QueryFailed
                    } else {
                        AuditEventType::QueryCompleted
                    };
                    let mut event = self
                        .meta
                        .event(event_type)
                        .row_count(rows)
                        .result_sets(result_sets)
                        .duration_ms(dispatch.started.elapsed().as_millis() as u64);
                    if let Some(query) = dispatch.query {
                        event = event.query(query);
                    }
                    self.audit.emit(event.build());
                }
                return drained;
            }
            DemuxEvent::ResultSetStart { .. } | DemuxEvent::CommandComplete => {}
        }
        false
    }

    async fn backend_gone(&mut self, cause: Option<ProxyError>) -> BackendExit {
        let pending = self.inflight.pending();
        tracing::info!(
            session = %self.meta.id,
            pending,
            cause = ?cause,
            "Backend connection closed"
        );
        if pending > 0 && !self.inflight.client_gone() {
            let notice = wire::error_response("08006", "backend connection lost");
            deliver(&mut self.client, &self.inflight, &notice).await;
        }
        let _ = self.client.flush().await;
        let _ = self.client.shutdown().await;
        BackendExit::Closed
    }
}

/// Write to the client unless it is already gone. A failed write marks it gone.
async fn deliver<W: AsyncWrite + Unpin>(client: &mut W, inflight: &Inflight, bytes: &[u8]) {
    if inflight.client_gone() {
        return;
    }
    if let Err(e) = client.write_all(bytes).await {
        tracing::debug!(error = %e, "Client write failed, discarding backend output");
        inflight.mark_client_gone();
    }
}
