//! Guest-agent wire protocol.
//!
//! Both agent channels (control and TTY) share one frame layout:
//!
//! ```text
//! ┌────────────────┬──────────────┬──────────────────────┐
//! │ tag: u64 (BE)  │ len: u32 (BE)│ payload[len - 12]    │
//! └────────────────┴──────────────┴──────────────────────┘
//! ```
//!
//! `len` counts the whole frame including the 12-byte header. On the
//! control channel the tag is a request/ack code; on the TTY channel it
//! is a session id.

use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Frame header length in bytes.
pub const FRAME_HEADER_LEN: usize = 12;

/// Largest representable payload.
pub const MAX_FRAME_PAYLOAD: u32 = u32::MAX - FRAME_HEADER_LEN as u32;

/// Read granularity while accumulating a frame.
const READ_CHUNK: usize = 512;

// =============================================================================
// Request Codes
// =============================================================================

/// Start the pod; payload is the serialized VM spec.
pub const START_POD: u32 = 1;

/// Execute a command; payload is the serialized exec request.
pub const EXEC_CMD: u32 = 2;

/// Shut the pod down; empty payload.
pub const SHUTDOWN: u32 = 3;

/// Human-readable name of a request/ack code.
#[must_use]
pub fn code_name(code: u32) -> &'static str {
    match code {
        START_POD => "START_POD",
        EXEC_CMD => "EXEC_CMD",
        SHUTDOWN => "SHUTDOWN",
        _ => "UNKNOWN",
    }
}

// =============================================================================
// Frame Codec
// =============================================================================

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Request code (control channel) or session id (TTY channel).
    pub tag: u64,
    /// Frame payload, possibly empty.
    pub payload: Vec<u8>,
}

/// Encodes a frame for the wire.
///
/// # Panics
///
/// Panics if the payload exceeds [`MAX_FRAME_PAYLOAD`]; callers bound
/// payloads well below that.
#[must_use]
pub fn encode_frame(tag: u64, payload: &[u8]) -> Vec<u8> {
    assert!(payload.len() <= MAX_FRAME_PAYLOAD as usize);
    let total = FRAME_HEADER_LEN + payload.len();
    let mut frame = Vec::with_capacity(total);
    frame.extend_from_slice(&tag.to_be_bytes());
    frame.extend_from_slice(&(total as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Reads one frame, retrying partial reads until the declared length
/// is in hand.
///
/// # Errors
///
/// - `UnexpectedEof` when the stream ends mid-frame
/// - `InvalidData` when the declared length is below the header size
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Frame> {
    let mut need = FRAME_HEADER_LEN;
    let mut have = Vec::with_capacity(READ_CHUNK);
    let mut chunk = [0u8; READ_CHUNK];

    while have.len() < need {
        let want = (need - have.len()).min(READ_CHUNK);
        let n = reader.read(&mut chunk[..want]).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "stream closed mid-frame",
            ));
        }
        have.extend_from_slice(&chunk[..n]);

        if need == FRAME_HEADER_LEN && have.len() >= FRAME_HEADER_LEN {
            let declared = u32::from_be_bytes([have[8], have[9], have[10], have[11]]) as usize;
            if declared < FRAME_HEADER_LEN {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("frame length {declared} below header size"),
                ));
            }
            need = declared;
        }
    }

    let tag = u64::from_be_bytes([
        have[0], have[1], have[2], have[3], have[4], have[5], have[6], have[7],
    ]);
    Ok(Frame {
        tag,
        payload: have.split_off(FRAME_HEADER_LEN),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn round_trip() {
        let payloads: [&[u8]; 4] = [b"", b"x", b"hello pod", &[0u8; 700]];
        for payload in payloads {
            let wire = encode_frame(42, payload);
            let mut cursor = wire.as_slice();
            let frame = read_frame(&mut cursor).await.unwrap();
            assert_eq!(frame.tag, 42);
            assert_eq!(frame.payload, payload);
        }
    }

    #[tokio::test]
    async fn decode_across_partial_writes() {
        let (mut client, server) = tokio::io::duplex(16);
        let wire = encode_frame(7, b"fragmented payload");
        let writer = tokio::spawn(async move {
            for byte in wire {
                client.write_all(&[byte]).await.unwrap();
                client.flush().await.unwrap();
            }
        });

        let (mut read_half, _write_half) = tokio::io::split(server);
        let frame = read_frame(&mut read_half).await.unwrap();
        assert_eq!(frame.tag, 7);
        assert_eq!(frame.payload, b"fragmented payload");
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn reject_undersized_length() {
        let mut wire = encode_frame(1, b"abc");
        wire[8..12].copy_from_slice(&4u32.to_be_bytes());
        let mut cursor = wire.as_slice();
        let err = read_frame(&mut cursor).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn eof_mid_frame() {
        let wire = encode_frame(1, b"truncated");
        let mut cursor = &wire[..wire.len() - 3];
        let err = read_frame(&mut cursor).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn code_names() {
        assert_eq!(code_name(START_POD), "START_POD");
        assert_eq!(code_name(EXEC_CMD), "EXEC_CMD");
        assert_eq!(code_name(SHUTDOWN), "SHUTDOWN");
        assert_eq!(code_name(99), "UNKNOWN");
    }
}
