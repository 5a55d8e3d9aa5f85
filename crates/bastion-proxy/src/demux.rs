//! Result stream demultiplexer.
//!
//! Segments backend traffic into result sets and rows using frame tags only.
//! The state machine keeps counters, never rows, so its memory use does not
//! depend on how many rows pass through.
//!
//! ```text
//!            RowDescription                    DataRow
//!   Idle ───────────────────► Described ──────────────────► InResultSet ◄── complete_row ──┐
//!    ▲                          │    ▲ RowDescription          │        │                    │
//!    │ ReadyForQuery            │    └───────┘                 │        └── DataRow ────► InRow
//!    │                          │ CommandComplete              │ CommandComplete
//!    │                          │ ErrorResponse                │ ErrorResponse
//!    └───────────────────── Draining ◄─────────────────────────┘
//! ```
//!
//! A RowDescription only opens a result set once rows, CommandComplete or an
//! ErrorResponse follow it. Describe answers in an extended-protocol batch
//! announce columns that never produce rows, so a description that is
//! replaced by another one, or cut off by ReadyForQuery, yields no set.
//!
//! A row is whole once the relay has delivered its frame and called
//! [`Demultiplexer::complete_row`]; any frame observed before that is a
//! protocol violation.

use crate::error::ProxyError;
use crate::wire::FrameType;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemuxState {
    /// No execution in progress.
    Idle,
    /// Columns have been described but no set has opened yet.
    Described,
    /// A result set is open and between rows.
    InResultSet,
    /// A DataRow has been announced and is being delivered.
    InRow,
    /// Between result sets of one execution, waiting for more or for ReadyForQuery.
    Draining,
}

impl fmt::Display for DemuxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// How a result set ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultSetStatus {
    /// Terminated by CommandComplete.
    Complete,
    /// Terminated by an ErrorResponse.
    Failed,
    /// Cut short by ReadyForQuery, e.g. a suspended portal.
    Incomplete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemuxEvent {
    ResultSetStart {
        index: u32,
    },
    Row {
        result_set: u32,
        index: u64,
    },
    /// Emitted for every result set, including empty ones.
    ResultSetEnd {
        index: u32,
        rows: u64,
        status: ResultSetStatus,
    },
    /// A command finished without producing a result set.
    CommandComplete,
    /// The backend is ready for the next query.
    ExecutionComplete {
        result_sets: u32,
        rows: u64,
        failed: bool,
    },
}

/// Events produced by one observed frame, in order. At most two.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Transition {
    first: Option<DemuxEvent>,
    second: Option<DemuxEvent>,
}

impl Transition {
    fn none() -> Self {
        Self::default()
    }

    fn one(event: DemuxEvent) -> Self {
        Self {
            first: Some(event),
            second: None,
        }
    }

    fn two(first: DemuxEvent, second: DemuxEvent) -> Self {
        Self {
            first: Some(first),
            second: Some(second),
        }
    }
}

impl Iterator for Transition {
    type Item = DemuxEvent;

    fn next(&mut self) -> Option<DemuxEvent> {
        self.first.take().or_else(|| self.second.take())
    }
}

/// Per-session result stream state machine.
#[derive(Debug)]
pub struct Demultiplexer {
    state: DemuxState,
    result_sets: u32,
    set_rows: u64,
    execution_rows: u64,
    failed: bool,
}

impl Default for Demultiplexer {
    fn default() -> Self {
        Self::new()
    }
}

impl Demultiplexer {
    pub fn new() -> Self {
        Self {
            state: DemuxState::Idle,
            result_sets: 0,
            set_rows: 0,
            execution_rows: 0,
            failed: false,
        }
    }

    pub fn state(&self) -> DemuxState {
        self.state
    }

    /// Feed the type of the next backend frame, before its payload is delivered.
    pub fn observe(&mut self, frame: FrameType) -> Result<Transition, ProxyError> {
        if self.state == DemuxState::InRow {
            return Err(ProxyError::Protocol(format!(
                "{} received while a row was in flight",
                frame
            )));
        }

        let transition = match frame {
            FrameType::RowDescription => {
                if self.state == DemuxState::InResultSet {
                    return Err(ProxyError::Protocol(
                        "RowDescription received inside an open result set".to_string(),
                    ));
                }
                // A later description supersedes a Describe answer.
                self.state = DemuxState::Described;
                Transition::none()
            }
            FrameType::DataRow => {
                let transition = match self.state {
                    DemuxState::InResultSet => Transition::none(),
                    // Extended protocol without Describe: no RowDescription precedes the rows.
                    _ => Transition::one(self.open_set()),
                };
                self.state = DemuxState::InRow;
                transition
            }
            FrameType::CommandComplete => match self.state {
                DemuxState::InResultSet => Transition::one(self.close_set(ResultSetStatus::Complete)),
                DemuxState::Described => {
                    let start = self.open_set();
                    Transition::two(start, self.close_set(ResultSetStatus::Complete))
                }
                _ => {
                    self.state = DemuxState::Draining;
                    Transition::one(DemuxEvent::CommandComplete)
                }
            },
            FrameType::ErrorResponse => {
                self.failed = true;
                match self.state {
                    DemuxState::InResultSet => Transition::one(self.close_set(ResultSetStatus::Failed)),
                    DemuxState::Described => {
                        let start = self.open_set();
                        Transition::two(start, self.close_set(ResultSetStatus::Failed))
                    }
                    _ => {
                        self.state = DemuxState::Draining;
                        Transition::none()
                    }
                }
            }
            FrameType::ReadyForQuery => match self.state {
                DemuxState::InResultSet => {
                    let end = self.close_set(ResultSetStatus::Incomplete);
                    Transition::two(end, self.finish_execution())
                }
                // Describe-only execution: the columns never turned into a set.
                _ => Transition::one(self.finish_execution()),
            },
            _ => Transition::none(),
        };
        Ok(transition)
    }

    /// Mark the announced row as fully delivered.
    pub fn complete_row(&mut self) -> Result<DemuxEvent, ProxyError> {
        if self.state != DemuxState::InRow {
            return Err(ProxyError::Protocol(format!(
                "row completed in state {}",
                self.state
            )));
        }
        let index = self.set_rows;
        self.set_rows += 1;
        self.execution_rows += 1;
        self.state = DemuxState::InResultSet;
        Ok(DemuxEvent::Row {
            result_set: self.result_sets - 1,
            index,
        })
    }

    fn open_set(&mut self) -> DemuxEvent {
        let index = self.result_sets;
        self.result_sets += 1;
        self.set_rows = 0;
        self.state = DemuxState::InResultSet;
        DemuxEvent::ResultSetStart { index }
    }

    fn close_set(&mut self, status: ResultSetStatus) -> DemuxEvent {
        self.state = DemuxState::Draining;
        DemuxEvent::ResultSetEnd {
            index: self.result_sets - 1,
            rows: self.set_rows,
            status,
        }
    }

    fn finish_execution(&mut self) -> DemuxEvent {
        let event = DemuxEvent::ExecutionComplete {
            result_sets: self.result_sets,
            rows: self.execution_rows,
            failed: self.failed,
        };
        *self = Self::new();
        event
    }
}
