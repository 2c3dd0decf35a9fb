// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 jobfab contributors

//! Wire formats: byte-level encode/decode for the discovery datagram and
//! the reserved control packet.
//!
//! Everything on the wire is little-endian. Strings carry a `u16` length
//! prefix. Decoders are bounds-checked end to end and return
//! [`ProtocolError`] on malformed input - they never panic and never
//! index past the buffer.

pub mod advert;
pub mod control;
pub mod wire;

pub use advert::{generate_job_id, AdvertKind, Advertisement};
pub use control::ControlMsg;
pub use wire::{WireReader, WireWriter};

/// Malformed bytes on the wire. Per the failure policy these are logged
/// and the offending message dropped, never fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Buffer ended before the announced content did.
    Truncated,
    /// A string field was not valid UTF-8.
    BadUtf8,
    /// Control packet carried an unknown sub-kind byte.
    UnknownControl(u8),
    /// A grouped container held another grouped container.
    NestedGroup,
    /// A grouped sub-message length pointed past the container.
    BadGroupLength,
    /// Advertisement carried an unknown message kind.
    UnknownAdvertKind(u8),
    /// Advertisement protocol version does not match ours.
    Version(u8),
    /// Encoded advertisement would exceed the datagram budget.
    AdvertTooLarge(usize),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::Truncated => write!(f, "truncated message"),
            ProtocolError::BadUtf8 => write!(f, "string field is not valid UTF-8"),
            ProtocolError::UnknownControl(k) => write!(f, "unknown control sub-kind {}", k),
            ProtocolError::NestedGroup => write!(f, "grouped packet nested inside a group"),
            ProtocolError::BadGroupLength => write!(f, "grouped sub-message overruns container"),
            ProtocolError::UnknownAdvertKind(k) => {
                write!(f, "unknown advertisement kind {}", k)
            }
            ProtocolError::Version(v) => write!(f, "advertisement protocol version {}", v),
            ProtocolError::AdvertTooLarge(n) => {
                write!(f, "advertisement would be {} bytes", n)
            }
        }
    }
}

impl std::error::Error for ProtocolError {}
