// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 jobfab contributors

//! Built-in control handlers and the blocking join exchanges.
//!
//! Control packets (kind 27) are decoded once into a
//! [`ControlMsg`](crate::protocol::ControlMsg) and applied here, on the
//! dispatch thread. The worker-side waits (`receive_exe_name`,
//! `receive_command_line`, `wait_for_timing_signal`) pump the dispatch
//! loop with a bounded timeout until the corresponding flag flips.

use std::time::{Duration, Instant};

use crate::config::{HANDSHAKE_TIMEOUT, MASTER_RANK};
use crate::engine::Message;
use crate::protocol::ControlMsg;
use crate::session::{Error, Result, Session};

/// Worker-side handshake flags, flipped by control handlers as the
/// corresponding messages arrive.
#[derive(Debug, Default)]
pub(crate) struct HandshakeState {
    pub master_exe_name: Option<String>,
    pub command_line: Option<Vec<String>>,
    pub timing_done: bool,
}

/// Apply one control packet. Malformed control traffic is logged and
/// dropped - one peer's garbage must not stop the loop.
pub(crate) fn handle_control(session: &Session, msg: &Message) {
    match ControlMsg::decode(&msg.bytes) {
        Ok(ControlMsg::PeerName(name)) => {
            if let Ok(conn) = session.connection(msg.source_rank) {
                log::debug!("[SESSION] rank {} is {}", msg.source_rank, name);
                conn.set_machine_name(&name);
            }
        }
        Ok(ControlMsg::CommandLine(args)) => {
            session.handshake.lock().command_line = Some(args);
        }
        Ok(ControlMsg::WaitingForCommandLine) => {
            if session.is_master() && !session.shares_command_line() {
                log::warn!(
                    "[SESSION] worker {} expects a pushed command line, but sharing is off",
                    msg.source_rank
                );
            }
        }
        Ok(ControlMsg::TimingDone) => {
            session.handshake.lock().timing_done = true;
        }
        Ok(ControlMsg::ExeName(name)) => {
            session.handshake.lock().master_exe_name = Some(name);
        }
        // Envelopes are expanded at the queue head and never reach
        // dispatch; seeing one here means a peer sent garbage.
        Ok(ControlMsg::Grouped(_)) => {
            log::warn!(
                "[DISPATCH] unexpected grouped envelope from rank {}",
                msg.source_rank
            );
        }
        Err(e) => {
            log::warn!(
                "[DISPATCH] dropping malformed control packet from rank {}: {}",
                msg.source_rank,
                e
            );
        }
    }
}

impl Session {
    /// Announce our machine name to `rank`.
    pub(crate) fn send_machine_name_to(&self, rank: usize) -> Result<()> {
        let payload = ControlMsg::PeerName(self.local_name().to_string()).encode();
        self.send_to(rank, &payload)?;
        Ok(())
    }

    /// Record our exe basename for every current and future peer, so a
    /// stale worker from the previous job can reject this one.
    pub(crate) fn send_exe_name(&self) {
        self.send_persistent(&ControlMsg::ExeName(current_exe_basename()).encode());
    }

    /// Worker side: wait for the master's exe name and verify it matches
    /// ours (case-insensitive basename compare).
    pub(crate) fn receive_exe_name(&self) -> Result<()> {
        let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
        loop {
            if let Some(master) = self.handshake.lock().master_exe_name.clone() {
                let local = current_exe_basename();
                if master.eq_ignore_ascii_case(&local) {
                    return Ok(());
                }
                return Err(Error::ExeNameMismatch { master, local });
            }
            if Instant::now() >= deadline {
                return Err(Error::HandshakeTimeout("the master's exe name"));
            }
            self.dispatch_next(Duration::from_millis(500));
        }
    }

    /// Record the full worker command line for every current and future
    /// peer.
    pub(crate) fn send_command_line(&self, args: &[String]) {
        self.send_persistent(&ControlMsg::CommandLine(args.to_vec()).encode());
    }

    /// Worker side: probe the master and block until it pushes the job
    /// command line.
    pub fn receive_command_line(&self) -> Result<Vec<String>> {
        self.send_to(MASTER_RANK, &ControlMsg::WaitingForCommandLine.encode())?;

        let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
        loop {
            if let Some(args) = self.handshake.lock().command_line.clone() {
                return Ok(args);
            }
            if Instant::now() >= deadline {
                return Err(Error::HandshakeTimeout("the job command line"));
            }
            self.dispatch_next(Duration::from_millis(500));
        }
    }

    /// Command line previously received from the master, if any.
    pub fn worker_command_line(&self) -> Option<Vec<String>> {
        self.handshake.lock().command_line.clone()
    }

    /// Master side: release the timing barrier for every current and
    /// future worker.
    pub fn signal_timing_start(&self) {
        self.send_persistent(&ControlMsg::TimingDone.encode());
    }

    /// Worker side: block until the master releases the timing barrier.
    pub fn wait_for_timing_signal(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.handshake.lock().timing_done {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::HandshakeTimeout("the timing start signal"));
            }
            self.dispatch_next(Duration::from_millis(50));
        }
    }
}

/// Basename of the running executable, extension stripped.
pub(crate) fn current_exe_basename() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "unknown-exe".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Message;

    fn control_message(rank: usize, msg: &ControlMsg) -> Message {
        Message {
            source_rank: rank,
            bytes: msg.encode(),
        }
    }

    #[test]
    fn exe_name_lands_in_handshake_state() {
        let session = Session::test_instance(false);
        handle_control(
            &session,
            &control_message(0, &ControlMsg::ExeName("vis".into())),
        );
        assert_eq!(
            session.handshake.lock().master_exe_name.as_deref(),
            Some("vis")
        );
    }

    #[test]
    fn peer_name_updates_the_connection() {
        let session = Session::test_instance(true);
        handle_control(
            &session,
            &control_message(0, &ControlMsg::PeerName("farm-3".into())),
        );
        let conn = session.connection(0).unwrap();
        assert_eq!(conn.machine_name(), "farm-3");
        assert!(conn.has_machine_name());
    }

    #[test]
    fn timing_flag_flips() {
        let session = Session::test_instance(false);
        assert!(!session.handshake.lock().timing_done);
        handle_control(&session, &control_message(0, &ControlMsg::TimingDone));
        assert!(session.handshake.lock().timing_done);
    }

    #[test]
    fn command_line_is_captured() {
        let session = Session::test_instance(false);
        let args = vec!["vis".to_string(), "-fast".to_string()];
        handle_control(
            &session,
            &control_message(0, &ControlMsg::CommandLine(args.clone())),
        );
        assert_eq!(session.worker_command_line(), Some(args));
    }

    #[test]
    fn garbage_control_packet_is_dropped() {
        let session = Session::test_instance(false);
        handle_control(
            &session,
            &Message {
                source_rank: 0,
                bytes: vec![crate::config::PACKET_KIND_CONTROL, 250],
            },
        );
        // Nothing flipped, nothing panicked.
        assert!(session.handshake.lock().master_exe_name.is_none());
    }

    #[test]
    fn wait_for_timing_signal_times_out() {
        let session = Session::test_instance(false);
        let err = session
            .wait_for_timing_signal(Duration::from_millis(30))
            .unwrap_err();
        assert!(matches!(err, Error::HandshakeTimeout(_)));
    }
}
