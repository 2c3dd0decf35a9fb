// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 jobfab contributors

//! The reserved control packet (kind 27).
//!
//! Byte 0 of every control payload is [`PACKET_KIND_CONTROL`], byte 1 the
//! sub-kind. The payload is decoded exactly once, at dispatch time, into
//! a [`ControlMsg`] - handlers never re-interpret raw offsets.
//!
//! Grouped containers ride the same packet kind: the envelope payload is
//! `[27, 4]` followed by `{u32 len, len bytes}` repeats in send order.
//! Containers nest at most zero levels deep; a group inside a group is
//! rejected as malformed rather than expanded recursively.

use super::wire::{WireReader, WireWriter};
use super::ProtocolError;
use crate::config::{
    CONTROL_COMMAND_LINE, CONTROL_EXE_NAME, CONTROL_GROUPED_PACKET, CONTROL_PEER_NAME,
    CONTROL_TIMING_DONE, CONTROL_WAITING_FOR_COMMAND_LINE, PACKET_KIND_CONTROL,
};

/// Two-byte header opening every grouped-packet envelope.
pub const GROUPED_HEADER: [u8; 2] = [PACKET_KIND_CONTROL, CONTROL_GROUPED_PACKET];

/// A decoded control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMsg {
    /// Peer announces its machine name right after connecting.
    PeerName(String),
    /// Master hands the worker its full command line.
    CommandLine(Vec<String>),
    /// Worker probe: "I expect a command line, are you sending one?"
    WaitingForCommandLine,
    /// Batched container of independently framed sub-messages.
    Grouped(Vec<Vec<u8>>),
    /// Timing barrier released by the master.
    TimingDone,
    /// Master's executable basename, for stale-worker rejection.
    ExeName(String),
}

impl ControlMsg {
    /// Serialize into a full packet payload (kind byte included).
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.put_u8(PACKET_KIND_CONTROL);
        match self {
            ControlMsg::PeerName(name) => {
                w.put_u8(CONTROL_PEER_NAME);
                w.put_str(name);
            }
            ControlMsg::CommandLine(args) => {
                w.put_u8(CONTROL_COMMAND_LINE);
                assert!(args.len() <= u16::MAX as usize, "argv over u16::MAX entries");
                w.put_u16(args.len() as u16);
                for arg in args {
                    w.put_str(arg);
                }
            }
            ControlMsg::WaitingForCommandLine => w.put_u8(CONTROL_WAITING_FOR_COMMAND_LINE),
            ControlMsg::Grouped(subs) => {
                w.put_u8(CONTROL_GROUPED_PACKET);
                for sub in subs {
                    w.put_u32(sub.len() as u32);
                    w.put_bytes(sub);
                }
            }
            ControlMsg::TimingDone => w.put_u8(CONTROL_TIMING_DONE),
            ControlMsg::ExeName(name) => {
                w.put_u8(CONTROL_EXE_NAME);
                w.put_str(name);
            }
        }
        w.into_vec()
    }

    /// Decode a control payload (must start with the control kind byte).
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() < 2 || payload[0] != PACKET_KIND_CONTROL {
            return Err(ProtocolError::Truncated);
        }
        let mut r = WireReader::starting_at(payload, 2);
        match payload[1] {
            CONTROL_PEER_NAME => Ok(ControlMsg::PeerName(r.get_str()?)),
            CONTROL_COMMAND_LINE => {
                let argc = r.get_u16()? as usize;
                let mut args = Vec::with_capacity(argc.min(256));
                for _ in 0..argc {
                    args.push(r.get_str()?);
                }
                Ok(ControlMsg::CommandLine(args))
            }
            CONTROL_WAITING_FOR_COMMAND_LINE => Ok(ControlMsg::WaitingForCommandLine),
            CONTROL_GROUPED_PACKET => Ok(ControlMsg::Grouped(split_grouped(payload)?)),
            CONTROL_TIMING_DONE => Ok(ControlMsg::TimingDone),
            CONTROL_EXE_NAME => Ok(ControlMsg::ExeName(r.get_str()?)),
            other => Err(ProtocolError::UnknownControl(other)),
        }
    }
}

/// True if `payload` is a grouped-packet envelope.
pub fn is_grouped(payload: &[u8]) -> bool {
    payload.len() >= 2 && payload[..2] == GROUPED_HEADER
}

/// Break a grouped envelope into its sub-messages, in container order.
///
/// Each sub-message must be complete within the container and must not
/// itself be a grouped envelope.
pub fn split_grouped(payload: &[u8]) -> Result<Vec<Vec<u8>>, ProtocolError> {
    debug_assert!(is_grouped(payload));
    let mut r = WireReader::starting_at(payload, 2);
    let mut subs = Vec::new();
    while r.remaining() > 0 {
        let len = r.get_u32()? as usize;
        if len > r.remaining() {
            return Err(ProtocolError::BadGroupLength);
        }
        let sub = r.get_bytes(len)?;
        if is_grouped(sub) {
            return Err(ProtocolError::NestedGroup);
        }
        subs.push(sub.to_vec());
    }
    Ok(subs)
}

/// Wrap pre-framed sub-messages into one grouped envelope payload.
pub fn build_grouped<B: AsRef<[u8]>>(subs: &[B]) -> Vec<u8> {
    let total: usize = subs.iter().map(|s| 4 + s.as_ref().len()).sum();
    let mut w = WireWriter::with_capacity(2 + total);
    w.put_bytes(&GROUPED_HEADER);
    for sub in subs {
        w.put_u32(sub.as_ref().len() as u32);
        w.put_bytes(sub.as_ref());
    }
    w.into_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_name_roundtrip() {
        let msg = ControlMsg::PeerName("render-07".into());
        assert_eq!(ControlMsg::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn command_line_roundtrip() {
        let msg = ControlMsg::CommandLine(vec![
            "vis.exe".into(),
            "-threads".into(),
            "4".into(),
            "de_site.bsp".into(),
        ]);
        assert_eq!(ControlMsg::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn flag_messages_roundtrip() {
        for msg in [ControlMsg::WaitingForCommandLine, ControlMsg::TimingDone] {
            assert_eq!(ControlMsg::decode(&msg.encode()).unwrap(), msg);
        }
    }

    #[test]
    fn grouped_split_preserves_order_and_bytes() {
        let subs: Vec<Vec<u8>> = vec![vec![9, 1, 2], vec![3], vec![12, 0, 0, 7]];
        let envelope = build_grouped(&subs);
        assert!(is_grouped(&envelope));
        assert_eq!(split_grouped(&envelope).unwrap(), subs);
    }

    #[test]
    fn grouped_decodes_through_control_msg() {
        let subs: Vec<Vec<u8>> = vec![vec![5, 5], vec![6]];
        let envelope = build_grouped(&subs);
        assert_eq!(
            ControlMsg::decode(&envelope).unwrap(),
            ControlMsg::Grouped(subs)
        );
    }

    #[test]
    fn nested_group_is_rejected() {
        let inner = build_grouped(&[vec![1u8, 2]]);
        let outer = build_grouped(&[inner]);
        assert_eq!(split_grouped(&outer).unwrap_err(), ProtocolError::NestedGroup);
    }

    #[test]
    fn overrunning_sub_length_is_rejected() {
        let mut envelope = build_grouped(&[vec![1u8, 2, 3]]);
        // Inflate the sub-length past the container end.
        envelope[2..6].copy_from_slice(&100u32.to_le_bytes());
        assert_eq!(
            split_grouped(&envelope).unwrap_err(),
            ProtocolError::BadGroupLength
        );
    }

    #[test]
    fn unknown_subkind_is_rejected() {
        let payload = [PACKET_KIND_CONTROL, 99];
        assert_eq!(
            ControlMsg::decode(&payload).unwrap_err(),
            ProtocolError::UnknownControl(99)
        );
    }
}
