// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 jobfab contributors

//! Fabric constants - single source of truth.
//!
//! This module centralizes the packet-kind space, port ranges, and timing
//! constants shared between the master and the workers.
//! **NEVER hardcode these elsewhere!**
//!
//! # Port layout
//!
//! ```text
//! 23300..23309   master job listen ports (first free one is used)
//! 23310..23319   master downloader listen ports
//! 23320..23335   worker-side connect ports
//! 23336..23351   downloader-side connect ports
//! 23397..23412   discovery broadcast ports (services listen here)
//! ```

use std::time::Duration;

/// Discovery datagram protocol version. Workers ignore advertisements
/// carrying a different version.
pub const PROTOCOL_VERSION: u8 = 5;

// =======================================================================
// Packet-kind space
// =======================================================================

/// Total number of packet kinds. Byte 0 of every framed message must be
/// below this value.
pub const MAX_PACKET_KINDS: usize = 32;

/// File-transfer traffic. One of the few kinds a downloader-only peer
/// still receives.
pub const PACKET_KIND_FILE_TRANSFER: u8 = 25;

/// Shared master/worker bookkeeping traffic (also passed to downloaders).
pub const PACKET_KIND_SHARED: u8 = 26;

/// Reserved internal control kind. Byte 1 selects a [`control sub-kind`]
/// (crate::protocol::control). Applications cannot register a handler for
/// this kind.
pub const PACKET_KIND_CONTROL: u8 = 27;

// Control sub-kinds (byte 1 of a PACKET_KIND_CONTROL payload).
pub const CONTROL_PEER_NAME: u8 = 1;
pub const CONTROL_COMMAND_LINE: u8 = 2;
pub const CONTROL_WAITING_FOR_COMMAND_LINE: u8 = 3;
pub const CONTROL_GROUPED_PACKET: u8 = 4;
pub const CONTROL_TIMING_DONE: u8 = 5;
pub const CONTROL_EXE_NAME: u8 = 6;

// =======================================================================
// Ranks
// =======================================================================

/// Rank of the master. On the master this slot is a virtual self-entry
/// with no socket; on a worker it is the link back to the master.
pub const MASTER_RANK: usize = 0;

/// Hard ceiling on connection slots (ranks are never recycled).
pub const MAX_CONNECTIONS: usize = 512;

/// Workers admitted when the caller does not configure a cap.
pub const DEFAULT_MAX_WORKERS: usize = 32;

/// Extra downloader-only admissions allowed beyond the free worker slots.
pub const DOWNLOADER_CAP_SLACK: usize = 8;

// =======================================================================
// Ports
// =======================================================================

/// First/last candidate port for the master's job listener.
pub const MASTER_PORT_FIRST: u16 = 23300;
pub const MASTER_PORT_LAST: u16 = 23309;

/// First/last candidate port for the master's downloader listener.
pub const DOWNLOADER_LISTEN_PORT_FIRST: u16 = 23310;
pub const DOWNLOADER_LISTEN_PORT_LAST: u16 = 23319;

/// Source-port range a worker binds before connecting. The master uses the
/// remote port to tell workers and downloaders apart.
pub const WORKER_PORT_FIRST: u16 = 23320;
pub const WORKER_PORT_LAST: u16 = 23335;

/// Source-port range a downloader-only peer binds before connecting.
pub const DOWNLOADER_PORT_FIRST: u16 = 23336;
pub const DOWNLOADER_PORT_LAST: u16 = 23351;

/// Ports the discovery advertisement is broadcast to. Idle services listen
/// on the first free port in this range.
pub const SERVICE_PORT_FIRST: u16 = 23397;
pub const SERVICE_PORT_LAST: u16 = 23412;

/// Worker-args entry that tells workers to run without socket timeouts
/// (so they can sit under a debugger).
pub const ARG_NO_TIMEOUT: &str = "-jf_no_timeout";

// =======================================================================
// Timing
// =======================================================================

/// Cadence of the discovery broadcast.
pub const BROADCAST_INTERVAL: Duration = Duration::from_millis(600);

/// How often the broadcaster thread polls its shutdown signal and the
/// listen sockets. Must stay well under [`BROADCAST_INTERVAL`].
pub const BROADCAST_POLL_TICK: Duration = Duration::from_millis(20);

/// Ceiling on time spent draining accepts in one broadcaster tick.
pub const BROADCAST_ACCEPT_BUDGET: Duration = Duration::from_millis(500);

/// Handshake exchanges (exe-name verify, command-line transfer) abort
/// after this long without an answer.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a worker keeps knocking on the master's door before giving up
/// (unless retry-forever is configured).
pub const CONNECT_WINDOW: Duration = Duration::from_secs(3);

// =======================================================================
// Limits
// =======================================================================

/// Upper bound on a single framed message (anti-OOM guard on receive).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Upper bound on an encoded discovery datagram. Staying under typical
/// MTU keeps the broadcast from fragmenting.
pub const MAX_ADVERT_SIZE: usize = 1400;
