//! Postgres v3 wire framing.
//!
//! Only what the relay needs: frame headers, a closed set of recognized
//! tags, the untagged startup packet, and a few messages the gateway writes
//! itself. Payloads are otherwise opaque.
//!
//! Every tagged frame is a 1-byte tag followed by a big-endian `u32` length
//! that counts itself but not the tag.

use crate::error::ProxyError;
use bastion_core::RelayConfig;
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Tag byte plus length field.
pub const HEADER_LEN: usize = 5;

/// Protocol version 3.0, encoded as `(major << 16) | minor`.
pub const PROTOCOL_VERSION_3_0: u32 = 196_608;

/// Sent instead of a StartupMessage to request TLS.
pub const SSL_REQUEST_CODE: u32 = 80_877_103;

/// Sent instead of a StartupMessage to request GSSAPI encryption.
pub const GSSENC_REQUEST_CODE: u32 = 80_877_104;

/// Sent on a fresh connection to cancel a running query.
pub const CANCEL_REQUEST_CODE: u32 = 80_877_102;

/// Upper bound Postgres itself applies to startup packets.
pub const MAX_STARTUP_PACKET_LEN: u32 = 10_000;

/// Which way a frame travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to backend.
    Frontend,
    /// Backend to client.
    Backend,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Frontend => write!(f, "frontend"),
            Self::Backend => write!(f, "backend"),
        }
    }
}

/// Frame types the gateway acts on. Everything else is `Unknown` and is
/// forwarded unchanged.
///
/// Several tags are reused across directions ('E' is Execute from the
/// client and ErrorResponse from the backend), so classification always
/// takes the direction into account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    // -- Frontend
    Query,     // 'Q'
    Parse,     // 'P'
    Bind,      // 'B'
    Execute,   // 'E'
    Sync,      // 'S'
    Terminate, // 'X'

    // -- Backend
    RowDescription,  // 'T'
    DataRow,         // 'D'
    CommandComplete, // 'C'
    ErrorResponse,   // 'E'
    ReadyForQuery,   // 'Z'

    Unknown(u8),
}

impl FrameType {
    pub fn classify(direction: Direction, tag: u8) -> Self {
        match (direction, tag) {
            (Direction::Frontend, b'Q') => Self::Query,
            (Direction::Frontend, b'P') => Self::Parse,
            (Direction::Frontend, b'B') => Self::Bind,
            (Direction::Frontend, b'E') => Self::Execute,
            (Direction::Frontend, b'S') => Self::Sync,
            (Direction::Frontend, b'X') => Self::Terminate,
            (Direction::Backend, b'T') => Self::RowDescription,
            (Direction::Backend, b'D') => Self::DataRow,
            (Direction::Backend, b'C') => Self::CommandComplete,
            (Direction::Backend, b'E') => Self::ErrorResponse,
            (Direction::Backend, b'Z') => Self::ReadyForQuery,
            (_, other) => Self::Unknown(other),
        }
    }

    pub fn tag(self) -> u8 {
        match self {
            Self::Query => b'Q',
            Self::Parse => b'P',
            Self::Bind => b'B',
            Self::Execute => b'E',
            Self::Sync => b'S',
            Self::Terminate => b'X',
            Self::RowDescription => b'T',
            Self::DataRow => b'D',
            Self::CommandComplete => b'C',
            Self::ErrorResponse => b'E',
            Self::ReadyForQuery => b'Z',
            Self::Unknown(tag) => tag,
        }
    }

    /// Frames that start or drive query execution on the backend.
    pub fn is_dispatch(self) -> bool {
        matches!(self, Self::Query | Self::Parse | Self::Bind | Self::Execute)
    }

    /// Frames after which the backend owes exactly one ReadyForQuery.
    pub fn expects_ready(self) -> bool {
        matches!(self, Self::Query | Self::Sync)
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(tag) if tag.is_ascii_graphic() => write!(f, "Unknown('{}')", *tag as char),
            Self::Unknown(tag) => write!(f, "Unknown(0x{:02x})", tag),
            other => write!(f, "{:?}", other),
        }
    }
}

/// A parsed frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub frame_type: FrameType,
    /// Declared length, including the length field itself.
    pub length: u32,
}

impl FrameHeader {
    /// Parse and validate a header. Nothing of a frame that fails here has
    /// been forwarded yet.
    pub fn parse(
        direction: Direction,
        raw: [u8; HEADER_LEN],
        max_frame_size: u32,
    ) -> Result<Self, ProxyError> {
        let length = u32::from_be_bytes([raw[1], raw[2], raw[3], raw[4]]);
        if length < 4 {
            return Err(ProxyError::Protocol(format!(
                "{} frame tag 0x{:02x} declares invalid length {}",
                direction, raw[0], length
            )));
        }
        if length > max_frame_size {
            return Err(ProxyError::FrameTooLarge {
                direction,
                declared: length,
                limit: max_frame_size,
            });
        }
        Ok(Self {
            frame_type: FrameType::classify(direction, raw[0]),
            length,
        })
    }

    pub fn payload_len(&self) -> usize {
        (self.length - 4) as usize
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let len = self.length.to_be_bytes();
        [self.frame_type.tag(), len[0], len[1], len[2], len[3]]
    }
}

/// A fully received frame: encoded header plus payload.
#[derive(Debug, Clone)]
pub struct Frame {
    pub header: FrameHeader,
    bytes: Bytes,
}

impl Frame {
    pub fn frame_type(&self) -> FrameType {
        self.header.frame_type
    }

    /// The frame exactly as it appeared on the wire.
    pub fn as_bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn payload(&self) -> Bytes {
        self.bytes.slice(HEADER_LEN..)
    }
}

/// Size and timing limits applied by a [`FrameReader`].
#[derive(Debug, Clone, Copy)]
pub struct FrameLimits {
    pub max_frame_size: u32,
    /// Bound on waiting for the rest of a partially received frame.
    pub frame_timeout: Duration,
    /// Bound on waiting for the first byte of the next frame.
    pub idle_timeout: Option<Duration>,
    pub chunk_size: usize,
}

impl FrameLimits {
    /// Limits for reading client frames.
    pub fn frontend(config: &RelayConfig) -> Self {
        Self {
            max_frame_size: config.max_frame_size,
            frame_timeout: config.frame_timeout(),
            idle_timeout: config.idle_timeout(),
            chunk_size: config.chunk_size,
        }
    }

    /// Limits for reading backend frames. The backend may be legitimately
    /// silent while a long query runs, so there is no idle bound.
    pub fn backend(config: &RelayConfig) -> Self {
        Self {
            idle_timeout: None,
            ..Self::frontend(config)
        }
    }
}

/// Reads frames from one direction of a connection.
///
/// The reader never holds more than one frame: either the payload is pulled
/// whole with [`read_frame`](Self::read_frame), or it is passed through in
/// `chunk_size` pieces with [`read_chunk`](Self::read_chunk).
pub struct FrameReader<R> {
    inner: R,
    direction: Direction,
    limits: FrameLimits,
    frame: BytesMut,
    chunk: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, direction: Direction, limits: FrameLimits) -> Self {
        Self {
            inner,
            direction,
            limits,
            frame: BytesMut::new(),
            chunk: vec![0u8; limits.chunk_size.max(1)],
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Read the next frame header. `Ok(None)` is a clean close between frames.
    pub async fn next_header(&mut self) -> Result<Option<FrameHeader>, ProxyError> {
        let mut raw = [0u8; HEADER_LEN];
        let n = read_timed(
            &mut self.inner,
            &mut raw[..1],
            self.limits.idle_timeout,
            "idle wait",
        )
        .await?;
        if n == 0 {
            return Ok(None);
        }
        read_full(&mut self.inner, &mut raw[1..], self.limits.frame_timeout).await?;
        FrameHeader::parse(self.direction, raw, self.limits.max_frame_size).map(Some)
    }

    /// Receive the whole payload for `header`.
    pub async fn read_frame(&mut self, header: FrameHeader) -> Result<Frame, ProxyError> {
        let payload_len = header.payload_len();
        self.frame.clear();
        self.frame.reserve(HEADER_LEN + payload_len);
        self.frame.put_slice(&header.encode());
        self.frame.resize(HEADER_LEN + payload_len, 0);
        read_full(
            &mut self.inner,
            &mut self.frame[HEADER_LEN..],
            self.limits.frame_timeout,
        )
        .await?;
        Ok(Frame {
            header,
            bytes: self.frame.split().freeze(),
        })
    }

    /// Receive up to one chunk of the payload. `remaining` counts the payload
    /// bytes still expected and is decremented by the returned length.
    pub async fn read_chunk(&mut self, remaining: &mut usize) -> Result<&[u8], ProxyError> {
        let want = (*remaining).min(self.chunk.len());
        if want == 0 {
            return Ok(&[]);
        }
        let n = read_timed(
            &mut self.inner,
            &mut self.chunk[..want],
            Some(self.limits.frame_timeout),
            "frame assembly",
        )
        .await?;
        if n == 0 {
            return Err(truncated());
        }
        *remaining -= n;
        Ok(&self.chunk[..n])
    }

    /// Consume and drop the rest of a payload.
    pub async fn skip_payload(&mut self, header: FrameHeader) -> Result<(), ProxyError> {
        let mut remaining = header.payload_len();
        while remaining > 0 {
            self.read_chunk(&mut remaining).await?;
        }
        Ok(())
    }
}

async fn read_timed<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
    wait: Option<Duration>,
    stage: &'static str,
) -> Result<usize, ProxyError> {
    match wait {
        None => Ok(reader.read(buf).await?),
        Some(after) => match tokio::time::timeout(after, reader.read(buf)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ProxyError::Timeout { stage, after }),
        },
    }
}

/// Fill `buf`, allowing `frame_timeout` between successive reads.
async fn read_full<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
    frame_timeout: Duration,
) -> Result<(), ProxyError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = read_timed(reader, &mut buf[filled..], Some(frame_timeout), "frame assembly")
            .await?;
        if n == 0 {
            return Err(truncated());
        }
        filled += n;
    }
    Ok(())
}

fn truncated() -> ProxyError {
    ProxyError::Io(std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        "connection closed mid-frame",
    ))
}

// ============================================================================
// Startup packets
// ============================================================================

/// The first, untagged packet a client sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartupRequest {
    Ssl,
    GssEnc,
    /// Carries the backend process id and secret key, forwarded as-is.
    Cancel,
    Startup {
        protocol: u32,
        params: Vec<(String, String)>,
    },
}

#[derive(Debug, Clone)]
pub struct StartupPacket {
    pub request: StartupRequest,
    raw: Bytes,
}

impl StartupPacket {
    /// The packet exactly as received.
    pub fn as_bytes(&self) -> &Bytes {
        &self.raw
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        match &self.request {
            StartupRequest::Startup { params, .. } => params
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str()),
            _ => None,
        }
    }

    pub fn parse(raw: Bytes) -> Result<Self, ProxyError> {
        if raw.len() < 8 {
            return Err(ProxyError::Protocol("startup packet too short".to_string()));
        }
        let code = u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]);
        let request = match code {
            SSL_REQUEST_CODE => StartupRequest::Ssl,
            GSSENC_REQUEST_CODE => StartupRequest::GssEnc,
            CANCEL_REQUEST_CODE => StartupRequest::Cancel,
            version if version >> 16 == 3 => StartupRequest::Startup {
                protocol: version,
                params: parse_params(&raw[8..])?,
            },
            other => {
                return Err(ProxyError::Protocol(format!(
                    "unsupported protocol version {}.{}",
                    other >> 16,
                    other & 0xffff
                )));
            }
        };
        Ok(Self { request, raw })
    }
}

fn parse_params(mut body: &[u8]) -> Result<Vec<(String, String)>, ProxyError> {
    let mut params = Vec::new();
    loop {
        let key = take_cstr(&mut body)?;
        if key.is_empty() {
            return Ok(params);
        }
        let value = take_cstr(&mut body)?;
        params.push((key.to_string(), value.to_string()));
    }
}

fn take_cstr<'a>(body: &mut &'a [u8]) -> Result<&'a str, ProxyError> {
    let end = body
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| ProxyError::Protocol("unterminated string in startup packet".to_string()))?;
    let s = std::str::from_utf8(&body[..end])
        .map_err(|_| ProxyError::Protocol("startup parameter is not UTF-8".to_string()))?;
    *body = &body[end + 1..];
    Ok(s)
}

/// Read one startup packet. `Ok(None)` when the client closed without sending one.
pub async fn read_startup<R: AsyncRead + Unpin>(
    reader: &mut R,
    timeout: Duration,
) -> Result<Option<StartupPacket>, ProxyError> {
    let mut len_buf = [0u8; 4];
    let n = read_timed(reader, &mut len_buf[..1], Some(timeout), "startup").await?;
    if n == 0 {
        return Ok(None);
    }
    read_full(reader, &mut len_buf[1..], timeout).await?;
    let len = u32::from_be_bytes(len_buf);
    if !(8..=MAX_STARTUP_PACKET_LEN).contains(&len) {
        return Err(ProxyError::Protocol(format!(
            "invalid startup packet length {}",
            len
        )));
    }
    let mut raw = BytesMut::with_capacity(len as usize);
    raw.put_slice(&len_buf);
    raw.resize(len as usize, 0);
    read_full(reader, &mut raw[4..], timeout).await?;
    StartupPacket::parse(raw.freeze()).map(Some)
}

/// Build a StartupMessage.
pub fn startup_message(params: &[(&str, &str)]) -> Bytes {
    let mut body = BytesMut::new();
    body.put_u32(PROTOCOL_VERSION_3_0);
    for (key, value) in params {
        put_cstr(&mut body, key);
        put_cstr(&mut body, value);
    }
    body.put_u8(0);

    let mut packet = BytesMut::with_capacity(body.len() + 4);
    packet.put_u32((body.len() + 4) as u32);
    packet.put_slice(&body);
    packet.freeze()
}

// ============================================================================
// Messages the gateway writes itself
// ============================================================================

/// Encode a tagged frame around `payload`.
pub fn frame(tag: u8, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u8(tag);
    buf.put_u32((payload.len() + 4) as u32);
    buf.put_slice(payload);
    buf.freeze()
}

/// An ErrorResponse with severity FATAL.
pub fn error_response(code: &str, message: &str) -> Bytes {
    let mut body = BytesMut::new();
    for (field, value) in [(b'S', "FATAL"), (b'V', "FATAL"), (b'C', code), (b'M', message)] {
        body.put_u8(field);
        put_cstr(&mut body, value);
    }
    body.put_u8(0);
    frame(b'E', &body)
}

/// SQLSTATE of an ErrorResponse payload, if present.
pub fn error_code(payload: &[u8]) -> Option<&str> {
    let mut rest = payload;
    while let Some((&field, tail)) = rest.split_first() {
        if field == 0 {
            return None;
        }
        let end = tail.iter().position(|b| *b == 0)?;
        if field == b'C' {
            return std::str::from_utf8(&tail[..end]).ok();
        }
        rest = &tail[end + 1..];
    }
    None
}

pub fn terminate() -> Bytes {
    frame(b'X', &[])
}

/// Leading NUL-terminated string of a payload, lossily decoded.
pub fn leading_cstr(payload: &[u8]) -> String {
    let end = payload.iter().position(|b| *b == 0).unwrap_or(payload.len());
    String::from_utf8_lossy(&payload[..end]).into_owned()
}

/// Second NUL-terminated string of a payload (the query text of a Parse).
pub fn second_cstr(payload: &[u8]) -> String {
    match payload.iter().position(|b| *b == 0) {
        Some(first) => leading_cstr(&payload[first + 1..]),
        None => String::new(),
    }
}

fn put_cstr(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}
