// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 jobfab contributors

//! Length-prefix framing for the job stream.
//!
//! TCP is a byte stream without message boundaries; every fabric message
//! travels as:
//!
//! ```text
//! +----------------+--------------------+
//! | length (4B LE) | payload            |
//! +----------------+--------------------+
//! ```
//!
//! The receiver reconstructs exactly the byte sequence the sender framed -
//! no merging or splitting is visible above this layer. Grouping of small
//! messages is an application-level convention (see
//! [`crate::protocol::control`]), not a transport one.

use std::io::{self, Read};

/// Frame header size (4-byte little-endian length).
pub const FRAME_HEADER_SIZE: usize = 4;

/// Incremental decoder state for one stream direction.
///
/// Keeps partial-read state across calls so it can be driven by both
/// blocking and non-blocking sockets. One instance per connection.
#[derive(Debug)]
pub struct FrameCodec {
    state: ReadState,
    buffer: Vec<u8>,
    max_size: usize,
}

#[derive(Debug, Clone, Copy)]
enum ReadState {
    Header { bytes_read: usize },
    Body { expected: usize, bytes_read: usize },
}

impl Default for ReadState {
    fn default() -> Self {
        ReadState::Header { bytes_read: 0 }
    }
}

impl FrameCodec {
    /// Create a decoder that rejects payloads above `max_size` bytes.
    pub fn new(max_size: usize) -> Self {
        Self {
            state: ReadState::default(),
            buffer: vec![0u8; FRAME_HEADER_SIZE],
            max_size,
        }
    }

    /// Frame one payload: `[len LE][payload]`.
    pub fn encode(payload: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
        Self::encode_into(payload, &mut frame);
        frame
    }

    /// Append `[len LE][payload]` to an existing buffer.
    pub fn encode_into(payload: &[u8], buf: &mut Vec<u8>) {
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(payload);
    }

    /// Frame several payloads into one contiguous buffer so the caller can
    /// issue a single stream write.
    pub fn encode_batch<B: AsRef<[u8]>>(payloads: &[B]) -> Vec<u8> {
        let total: usize = payloads
            .iter()
            .map(|p| FRAME_HEADER_SIZE + p.as_ref().len())
            .sum();
        let mut buf = Vec::with_capacity(total);
        for payload in payloads {
            Self::encode_into(payload.as_ref(), &mut buf);
        }
        buf
    }

    /// Pull the next complete payload out of `reader`.
    ///
    /// Returns `Ok(Some(payload))` for a complete frame, `Ok(None)` when a
    /// non-blocking reader would block mid-frame, and `Err` on stream
    /// breakage, EOF, or an oversized length prefix.
    pub fn decode<R: Read + ?Sized>(&mut self, reader: &mut R) -> io::Result<Option<Vec<u8>>> {
        loop {
            match self.state {
                ReadState::Header { bytes_read } => {
                    match reader.read(&mut self.buffer[bytes_read..FRAME_HEADER_SIZE]) {
                        Ok(0) => {
                            let msg = if bytes_read == 0 {
                                "connection closed"
                            } else {
                                "incomplete frame header"
                            };
                            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, msg));
                        }
                        Ok(n) => {
                            let total = bytes_read + n;
                            if total < FRAME_HEADER_SIZE {
                                self.state = ReadState::Header { bytes_read: total };
                                continue;
                            }

                            let len = u32::from_le_bytes([
                                self.buffer[0],
                                self.buffer[1],
                                self.buffer[2],
                                self.buffer[3],
                            ]) as usize;

                            if len > self.max_size {
                                self.state = ReadState::default();
                                return Err(io::Error::new(
                                    io::ErrorKind::InvalidData,
                                    format!("frame too large: {} bytes (max {})", len, self.max_size),
                                ));
                            }
                            if len == 0 {
                                self.state = ReadState::default();
                                return Ok(Some(Vec::new()));
                            }

                            self.buffer.resize(len, 0);
                            self.state = ReadState::Body {
                                expected: len,
                                bytes_read: 0,
                            };
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e),
                    }
                }

                ReadState::Body {
                    expected,
                    bytes_read,
                } => {
                    match reader.read(&mut self.buffer[bytes_read..expected]) {
                        Ok(0) => {
                            return Err(io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                "incomplete frame body",
                            ));
                        }
                        Ok(n) => {
                            let total = bytes_read + n;
                            if total < expected {
                                self.state = ReadState::Body {
                                    expected,
                                    bytes_read: total,
                                };
                                continue;
                            }

                            let payload = self.buffer[..expected].to_vec();
                            self.buffer.resize(FRAME_HEADER_SIZE, 0);
                            self.state = ReadState::default();
                            return Ok(Some(payload));
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e),
                    }
                }
            }
        }
    }

    /// True while the decoder sits in the middle of a frame.
    pub fn is_partial(&self) -> bool {
        match self.state {
            ReadState::Header { bytes_read } => bytes_read > 0,
            ReadState::Body { .. } => true,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn encode_prefixes_little_endian_length() {
        let frame = FrameCodec::encode(b"hello");
        assert_eq!(frame.len(), 4 + 5);
        assert_eq!(&frame[..4], &5u32.to_le_bytes());
        assert_eq!(&frame[4..], b"hello");
    }

    #[test]
    fn decode_single() {
        let mut codec = FrameCodec::new(1024);
        let mut cursor = Cursor::new(FrameCodec::encode(b"job unit 7"));
        assert_eq!(
            codec.decode(&mut cursor).unwrap(),
            Some(b"job unit 7".to_vec())
        );
    }

    #[test]
    fn decode_back_to_back_frames() {
        let mut codec = FrameCodec::new(1024);
        let mut buf = Vec::new();
        FrameCodec::encode_into(b"first", &mut buf);
        FrameCodec::encode_into(b"second", &mut buf);
        FrameCodec::encode_into(b"", &mut buf);
        let mut cursor = Cursor::new(buf);

        assert_eq!(codec.decode(&mut cursor).unwrap(), Some(b"first".to_vec()));
        assert_eq!(codec.decode(&mut cursor).unwrap(), Some(b"second".to_vec()));
        assert_eq!(codec.decode(&mut cursor).unwrap(), Some(Vec::new()));
    }

    #[test]
    fn encode_batch_matches_sequential_encodes() {
        let payloads: Vec<&[u8]> = vec![b"a", b"bb", b"ccc"];
        let batch = FrameCodec::encode_batch(&payloads);

        let mut sequential = Vec::new();
        for p in &payloads {
            FrameCodec::encode_into(p, &mut sequential);
        }
        assert_eq!(batch, sequential);
    }

    #[test]
    fn oversized_frame_rejected() {
        let mut codec = FrameCodec::new(8);
        let mut cursor = Cursor::new(FrameCodec::encode(b"way past the limit"));
        let err = codec.decode(&mut cursor).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn eof_mid_frame_is_an_error() {
        let mut codec = FrameCodec::new(1024);
        let frame = FrameCodec::encode(b"truncated");
        let mut cursor = Cursor::new(&frame[..6]);
        let err = codec.decode(&mut cursor).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn partial_state_tracked_across_calls() {
        // Hands out queued bytes and then reports WouldBlock, like a
        // non-blocking socket between readable events.
        struct Trickle {
            pending: Vec<u8>,
        }
        impl Read for Trickle {
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                if self.pending.is_empty() {
                    return Err(io::Error::from(io::ErrorKind::WouldBlock));
                }
                let n = buf.len().min(self.pending.len());
                buf[..n].copy_from_slice(&self.pending[..n]);
                self.pending.drain(..n);
                Ok(n)
            }
        }

        let frame = FrameCodec::encode(b"split across reads");
        let mut reader = Trickle {
            pending: frame[..3].to_vec(),
        };

        let mut codec = FrameCodec::new(1024);
        // First readable event only covers part of the header.
        assert_eq!(codec.decode(&mut reader).unwrap(), None);
        assert!(codec.is_partial());

        reader.pending = frame[3..].to_vec();
        assert_eq!(
            codec.decode(&mut reader).unwrap(),
            Some(b"split across reads".to_vec())
        );
        assert!(!codec.is_partial());
    }

    #[test]
    fn randomized_roundtrip() {
        let mut codec = FrameCodec::new(1 << 20);
        for _ in 0..50 {
            let len = fastrand::usize(0..10_000);
            let payload: Vec<u8> = (0..len).map(|_| fastrand::u8(..)).collect();
            let mut cursor = Cursor::new(FrameCodec::encode(&payload));
            assert_eq!(codec.decode(&mut cursor).unwrap(), Some(payload));
        }
    }
}
