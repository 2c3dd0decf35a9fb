// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 jobfab contributors

//! # jobfab - master/worker job distribution over a LAN
//!
//! One controlling process (the *master*) discovers idle machines with a
//! periodic UDP broadcast, hands each a command line, and then exchanges
//! typed, length-framed messages with every connected *worker* to drive a
//! compute job (distributing units of a lighting or visibility pass, for
//! example).
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use jobfab::{MasterConfig, Session};
//! use std::time::Duration;
//!
//! const KIND_RESULT: u8 = 2;
//!
//! fn main() -> jobfab::Result<()> {
//!     let (session, broadcaster) = Session::init_master(MasterConfig {
//!         job_args: vec!["de_site.bsp".into()],
//!         ..MasterConfig::default()
//!     })?;
//!
//!     session.register_handler(KIND_RESULT, |_session, msg| {
//!         println!("result from rank {}: {} bytes", msg.source_rank, msg.bytes.len());
//!     });
//!
//!     loop {
//!         session.dispatch_next(Duration::from_millis(200));
//!         # break;
//!     }
//!     drop(broadcaster);
//!     session.finalize();
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------------+
//! |                        Application Layer                           |
//! |        packet handlers | disconnect handlers | job logic           |
//! +--------------------------------------------------------------------+
//! |                           Session                                  |
//! |   dispatch loop | send paths / batching | persistent records       |
//! +--------------------------------------------------------------------+
//! |        Registry            |            Discovery                  |
//! |   rank slots, admission    |   UDP advertisement, accept, replay   |
//! +--------------------------------------------------------------------+
//! |                          Transport                                 |
//! |   length-prefix framing | per-peer reader threads | UDP broadcast  |
//! +--------------------------------------------------------------------+
//! ```
//!
//! ## Threading contract
//!
//! Socket reader threads only ever enqueue (messages into the inbox,
//! failures into the error queue). Every user-visible callback - packet
//! handlers, disconnect handlers - runs on the one thread that pumps
//! [`Session::dispatch_next`]. Handlers therefore need no locking for
//! dispatch state; they take the registry lock only when touching
//! connection fields.
//!
//! ## Delivery guarantees
//!
//! - Per-connection receive order is preserved end to end, including
//!   through grouped-packet expansion.
//! - [`Session::send_persistent`] reaches every current *and* future
//!   peer exactly once, in send order (late joiners get a verbatim
//!   replay before any other traffic).
//! - Sends to a dead peer are safe no-ops that return `false`.

/// Fabric constants (packet kinds, ports, timing).
pub mod config;
/// Worker discovery: the master's broadcast-and-admit loop.
pub mod discovery;
/// The shared inbox and the packet-kind dispatch table.
pub mod engine;
/// Wire formats: control packets and the discovery advertisement.
pub mod protocol;
/// The fabric context object, connection registry, and join handshake.
pub mod session;
/// Socket-level plumbing: framing, stream sockets, listeners, broadcast.
pub mod transport;

pub use config::{
    MASTER_RANK, PACKET_KIND_CONTROL, PACKET_KIND_FILE_TRANSFER, PACKET_KIND_SHARED,
};
pub use discovery::Broadcaster;
pub use engine::Message;
pub use protocol::{AdvertKind, Advertisement, ControlMsg};
pub use session::registry::{Connection, ConnectionRegistry};
pub use session::{
    Error, MasterConfig, PatchConfig, Result, SendOpts, Session, StatsSnapshot, WorkerConfig,
};
