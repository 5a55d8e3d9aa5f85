//! Shared helpers for the relay, session and server tests.
//!
//! The test plays both peers: it writes client frames into one end of a
//! duplex pipe and answers as the backend on another.

#![allow(dead_code)]

use bastion_core::GatewayConfig;
use bastion_proxy::FrameLimits;
use bastion_proxy::wire::frame;
use bytes::Bytes;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};

pub const PIPE_CAPACITY: usize = 64 * 1024;

/// Gateway configuration with short timeouts suitable for tests.
pub fn test_config() -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.relay.frame_timeout_ms = 2_000;
    config.relay.drain_timeout_ms = 2_000;
    config.relay.chunk_size = 512;
    config.mfa.ceremony_timeout_secs = 5;
    config
}

pub fn client_limits() -> FrameLimits {
    FrameLimits {
        max_frame_size: 1 << 20,
        frame_timeout: Duration::from_secs(2),
        idle_timeout: None,
        chunk_size: 8192,
    }
}

pub fn query(sql: &str) -> Bytes {
    let mut payload = sql.as_bytes().to_vec();
    payload.push(0);
    frame(b'Q', &payload)
}

pub fn row_description() -> Bytes {
    // One text column named "v".
    let mut payload = 1i16.to_be_bytes().to_vec();
    payload.extend_from_slice(b"v\0");
    payload.extend_from_slice(&0i32.to_be_bytes());
    payload.extend_from_slice(&0i16.to_be_bytes());
    payload.extend_from_slice(&25i32.to_be_bytes());
    payload.extend_from_slice(&(-1i16).to_be_bytes());
    payload.extend_from_slice(&(-1i32).to_be_bytes());
    payload.extend_from_slice(&0i16.to_be_bytes());
    frame(b'T', &payload)
}

/// A single-column DataRow whose frame is exactly `width` bytes on the wire.
pub fn data_row(width: usize) -> Bytes {
    const OVERHEAD: usize = 5 + 2 + 4;
    assert!(width >= OVERHEAD, "row width must cover the frame overhead");
    let value = vec![b'x'; width - OVERHEAD];
    let mut payload = 1i16.to_be_bytes().to_vec();
    payload.extend_from_slice(&(value.len() as i32).to_be_bytes());
    payload.extend_from_slice(&value);
    frame(b'D', &payload)
}

pub fn command_complete(tag: &str) -> Bytes {
    let mut payload = tag.as_bytes().to_vec();
    payload.push(0);
    frame(b'C', &payload)
}

pub fn ready_for_query() -> Bytes {
    frame(b'Z', b"I")
}

/// A whole result set: description, `rows` rows and its CommandComplete.
pub fn result_set(rows: usize, width: usize) -> Vec<u8> {
    let mut out = row_description().to_vec();
    for _ in 0..rows {
        out.extend_from_slice(&data_row(width));
    }
    out.extend_from_slice(&command_complete(&format!("SELECT {}", rows)));
    out
}

/// Read one tagged frame, `None` at end of stream.
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Option<(u8, Vec<u8>)> {
    let mut header = [0u8; 5];
    reader.read_exact(&mut header).await.ok()?;
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    let mut payload = vec![0u8; len - 4];
    reader.read_exact(&mut payload).await.ok()?;
    Some((header[0], payload))
}

/// Read frames until one with `tag` arrives.
pub async fn read_until<R: AsyncRead + Unpin>(reader: &mut R, tag: u8) -> Option<Vec<u8>> {
    loop {
        let (found, payload) = read_message(reader).await?;
        if found == tag {
            return Some(payload);
        }
    }
}

/// Read a length-prefixed startup packet.
pub async fn read_startup_packet<R: AsyncRead + Unpin>(reader: &mut R) -> Vec<u8> {
    let mut len = [0u8; 4];
    reader.read_exact(&mut len).await.unwrap();
    let mut packet = len.to_vec();
    packet.resize(u32::from_be_bytes(len) as usize, 0);
    reader.read_exact(&mut packet[4..]).await.unwrap();
    packet
}

/// Everything left on `reader` until it closes.
pub async fn drain<R: AsyncRead + Unpin>(reader: &mut R) -> Vec<u8> {
    let mut rest = Vec::new();
    let _ = tokio::time::timeout(Duration::from_secs(5), reader.read_to_end(&mut rest)).await;
    rest
}
