//! Lazy result consumption on the client side of the relay.
//!
//! [`ResultStream`] reads backend-format frames and hands out one
//! [`ResultSet`] at a time. A result set borrows the stream mutably, so it can
//! only be walked forward once and no other set can be opened while it lives.

use crate::demux::{DemuxEvent, Demultiplexer, ResultSetStatus};
use crate::error::ProxyError;
use crate::wire::{Direction, FrameLimits, FrameReader, FrameType};
use bytes::Bytes;
use tokio::io::AsyncRead;

/// One DataRow payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    payload: Bytes,
}

impl Row {
    pub fn new(payload: Bytes) -> Self {
        Self { payload }
    }

    /// Size of the row on the wire, excluding the frame header.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn column_count(&self) -> Result<usize, ProxyError> {
        Ok(self.columns()?.len())
    }

    /// Column values in order; `None` for SQL NULL.
    pub fn columns(&self) -> Result<Vec<Option<&[u8]>>, ProxyError> {
        let malformed = || ProxyError::Protocol("malformed DataRow".to_string());
        let data = &self.payload[..];
        if data.len() < 2 {
            return Err(malformed());
        }
        let count = i16::from_be_bytes([data[0], data[1]]);
        let count = usize::try_from(count).map_err(|_| malformed())?;
        let mut columns = Vec::with_capacity(count);
        let mut pos = 2;
        for _ in 0..count {
            let len_bytes = data.get(pos..pos + 4).ok_or_else(malformed)?;
            let len = i32::from_be_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]);
            pos += 4;
            if len < 0 {
                columns.push(None);
                continue;
            }
            let end = pos + len as usize;
            columns.push(Some(data.get(pos..end).ok_or_else(malformed)?));
            pos = end;
        }
        Ok(columns)
    }
}

/// How a consumed result set ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultSetSummary {
    pub index: u32,
    pub rows: u64,
    pub status: ResultSetStatus,
}

/// Frame-driven reader of query results.
pub struct ResultStream<R> {
    reader: FrameReader<R>,
    demux: Demultiplexer,
    /// Row that opened a result set without a RowDescription.
    pending_row: Option<Row>,
    set_open: bool,
    /// Set opened by the last step and not yet handed out.
    announced: Option<u32>,
    execution_done: bool,
    last_set: Option<ResultSetSummary>,
    last_error: Option<Bytes>,
}

enum Step {
    Row(Row),
    Other,
    Eof,
}

impl<R: AsyncRead + Unpin> ResultStream<R> {
    pub fn new(reader: R, limits: FrameLimits) -> Self {
        Self {
            reader: FrameReader::new(reader, Direction::Backend, limits),
            demux: Demultiplexer::new(),
            pending_row: None,
            set_open: false,
            announced: None,
            execution_done: false,
            last_set: None,
            last_error: None,
        }
    }

    /// Advance to the next result set of the current execution.
    ///
    /// Returns `None` once the backend reports ReadyForQuery; the following
    /// call moves on to the next pipelined execution. Rows left unread in the
    /// previous set are skipped.
    pub async fn next_result_set(&mut self) -> Result<Option<ResultSet<'_, R>>, ProxyError> {
        self.pending_row = None;
        self.announced = None;
        while self.set_open {
            if let Step::Eof = self.step().await? {
                return Err(unexpected_eof());
            }
        }
        if self.execution_done {
            self.execution_done = false;
            return Ok(None);
        }

        loop {
            match self.step().await? {
                Step::Eof => return Ok(None),
                Step::Row(row) => {
                    // The DataRow opened the set; hand it to the set first.
                    self.pending_row = Some(row);
                }
                Step::Other => {}
            }
            // An empty described set opens and closes within one step.
            if let Some(index) = self.announced.take() {
                return Ok(Some(ResultSet {
                    stream: self,
                    index,
                }));
            }
            if self.execution_done {
                self.execution_done = false;
                return Ok(None);
            }
        }
    }

    /// Summary of the most recently finished result set.
    pub fn last_result_set(&self) -> Option<ResultSetSummary> {
        self.last_set
    }

    /// Payload of the last ErrorResponse seen.
    pub fn last_error(&self) -> Option<&Bytes> {
        self.last_error.as_ref()
    }

    async fn step(&mut self) -> Result<Step, ProxyError> {
        let Some(header) = self.reader.next_header().await? else {
            return Ok(Step::Eof);
        };
        let transition = self.demux.observe(header.frame_type)?;
        let frame = self.reader.read_frame(header).await?;

        let row_event = if header.frame_type == FrameType::DataRow {
            Some(self.demux.complete_row()?)
        } else {
            None
        };
        if header.frame_type == FrameType::ErrorResponse {
            self.last_error = Some(frame.payload());
        }

        for event in transition.chain(row_event) {
            match event {
                DemuxEvent::ResultSetStart { index } => {
                    self.set_open = true;
                    self.announced = Some(index);
                }
                DemuxEvent::ResultSetEnd {
                    index,
                    rows,
                    status,
                } => {
                    self.set_open = false;
                    self.last_set = Some(ResultSetSummary {
                        index,
                        rows,
                        status,
                    });
                }
                DemuxEvent::ExecutionComplete { .. } => self.execution_done = true,
                DemuxEvent::Row { .. } | DemuxEvent::CommandComplete => {}
            }
        }

        Ok(match row_event {
            Some(_) => Step::Row(Row::new(frame.payload())),
            None => Step::Other,
        })
    }
}

/// A single result set. Rows are produced lazily from the wire.
pub struct ResultSet<'a, R> {
    stream: &'a mut ResultStream<R>,
    index: u32,
}

impl<R: AsyncRead + Unpin> ResultSet<'_, R> {
    /// Position of this set within its execution.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// The next row, or `None` at the end of the set.
    pub async fn next_row(&mut self) -> Result<Option<Row>, ProxyError> {
        if let Some(row) = self.stream.pending_row.take() {
            return Ok(Some(row));
        }
        if !self.stream.set_open {
            return Ok(None);
        }
        loop {
            match self.stream.step().await? {
                Step::Row(row) => return Ok(Some(row)),
                Step::Eof => return Err(unexpected_eof()),
                Step::Other if !self.stream.set_open => return Ok(None),
                Step::Other => {}
            }
        }
    }

    /// Count and discard the remaining rows.
    pub async fn count_rows(&mut self) -> Result<u64, ProxyError> {
        let mut count = 0;
        while self.next_row().await?.is_some() {
            count += 1;
        }
        Ok(count)
    }
}

fn unexpected_eof() -> ProxyError {
    ProxyError::Io(std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        "stream ended inside a result set",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::frame;
    use std::time::Duration;

    fn limits() -> FrameLimits {
        FrameLimits {
            max_frame_size: 1 << 20,
            frame_timeout: Duration::from_secs(1),
            idle_timeout: None,
            chunk_size: 8192,
        }
    }

    fn data_row(values: &[Option<&[u8]>]) -> Vec<u8> {
        let mut payload = (values.len() as i16).to_be_bytes().to_vec();
        for value in values {
            match value {
                Some(v) => {
                    payload.extend_from_slice(&(v.len() as i32).to_be_bytes());
                    payload.extend_from_slice(v);
                }
                None => payload.extend_from_slice(&(-1i32).to_be_bytes()),
            }
        }
        frame(b'D', &payload).to_vec()
    }

    fn wire(parts: &[Vec<u8>]) -> Vec<u8> {
        parts.concat()
    }

    #[tokio::test]
    async fn test_walks_multiple_result_sets() {
        let bytes = wire(&[
            frame(b'T', b"desc").to_vec(),
            data_row(&[Some(b"1")]),
            data_row(&[Some(b"2")]),
            frame(b'C', b"SELECT 2\0").to_vec(),
            frame(b'T', b"desc").to_vec(),
            frame(b'C', b"SELECT 0\0").to_vec(),
            frame(b'Z', b"I").to_vec(),
        ]);
        let mut stream = ResultStream::new(&bytes[..], limits());

        let mut counts = Vec::new();
        while let Some(mut set) = stream.next_result_set().await.unwrap() {
            counts.push((set.index(), set.count_rows().await.unwrap()));
        }
        assert_eq!(counts, vec![(0, 2), (1, 0)]);
        assert!(stream.next_result_set().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_row_columns_and_nulls() {
        let bytes = wire(&[
            frame(b'T', b"desc").to_vec(),
            data_row(&[Some(b"abc"), None, Some(b"")]),
            frame(b'C', b"SELECT 1\0").to_vec(),
            frame(b'Z', b"I").to_vec(),
        ]);
        let mut stream = ResultStream::new(&bytes[..], limits());
        let mut set = stream.next_result_set().await.unwrap().unwrap();
        let row = set.next_row().await.unwrap().unwrap();
        let columns = row.columns().unwrap();
        assert_eq!(columns, vec![Some(&b"abc"[..]), None, Some(&b""[..])]);
        assert!(set.next_row().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_implicit_set_keeps_first_row() {
        let bytes = wire(&[
            frame(b'1', b"").to_vec(),
            data_row(&[Some(b"x")]),
            data_row(&[Some(b"y")]),
            frame(b'C', b"SELECT 2\0").to_vec(),
            frame(b'Z', b"I").to_vec(),
        ]);
        let mut stream = ResultStream::new(&bytes[..], limits());
        let mut set = stream.next_result_set().await.unwrap().unwrap();
        assert_eq!(set.count_rows().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_unread_rows_are_skipped() {
        let bytes = wire(&[
            frame(b'T', b"desc").to_vec(),
            data_row(&[Some(b"1")]),
            data_row(&[Some(b"2")]),
            frame(b'C', b"SELECT 2\0").to_vec(),
            frame(b'T', b"desc").to_vec(),
            data_row(&[Some(b"3")]),
            frame(b'C', b"SELECT 1\0").to_vec(),
            frame(b'Z', b"I").to_vec(),
        ]);
        let mut stream = ResultStream::new(&bytes[..], limits());
        {
            let mut first = stream.next_result_set().await.unwrap().unwrap();
            first.next_row().await.unwrap();
        }
        let mut second = stream.next_result_set().await.unwrap().unwrap();
        assert_eq!(second.index(), 1);
        assert_eq!(second.count_rows().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_describe_answers_do_not_surface_as_sets() {
        let bytes = wire(&[
            frame(b'1', b"").to_vec(),
            frame(b't', b"\0\0").to_vec(),
            frame(b'T', b"desc").to_vec(),
            frame(b'2', b"").to_vec(),
            frame(b'T', b"desc").to_vec(),
            data_row(&[Some(b"7")]),
            frame(b'C', b"SELECT 1\0").to_vec(),
            frame(b'Z', b"I").to_vec(),
        ]);
        let mut stream = ResultStream::new(&bytes[..], limits());
        let mut set = stream.next_result_set().await.unwrap().unwrap();
        assert_eq!(set.index(), 0);
        assert_eq!(set.count_rows().await.unwrap(), 1);
        assert!(stream.next_result_set().await.unwrap().is_none());
    }
}
