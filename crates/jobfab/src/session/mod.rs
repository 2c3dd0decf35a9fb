// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 jobfab contributors

//! The fabric context object.
//!
//! One [`Session`] per process ties together the connection registry, the
//! shared inbox, the dispatch table, and the persistent-record list. All
//! user-visible callbacks (packet handlers, disconnect handlers) run on
//! the single thread that pumps [`Session::dispatch_next`]; socket reader
//! threads only ever enqueue.
//!
//! # Quick start (master side)
//!
//! ```rust,no_run
//! use jobfab::{MasterConfig, Session};
//!
//! fn main() -> jobfab::Result<()> {
//!     let (session, broadcaster) = Session::init_master(MasterConfig {
//!         job_args: vec!["-threads".into(), "4".into(), "de_site.bsp".into()],
//!         ..MasterConfig::default()
//!     })?;
//!
//!     session.register_handler(2, |session, msg| {
//!         let _ = session.send_to(msg.source_rank, &[3, 0]);
//!     });
//!
//!     while session.registry_count() < 2 {
//!         session.dispatch_next(std::time::Duration::from_millis(200));
//!     }
//!     drop(broadcaster);
//!     session.finalize();
//!     Ok(())
//! }
//! ```

pub mod handshake;
pub mod registry;

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::queue::SegQueue;
use parking_lot::Mutex;

use crate::config::{
    CONNECT_WINDOW, DEFAULT_MAX_WORKERS, DOWNLOADER_LISTEN_PORT_FIRST,
    DOWNLOADER_LISTEN_PORT_LAST, DOWNLOADER_PORT_FIRST, DOWNLOADER_PORT_LAST, MASTER_PORT_FIRST,
    MASTER_PORT_LAST, MASTER_RANK, MAX_CONNECTIONS, PACKET_KIND_CONTROL,
    PACKET_KIND_FILE_TRANSFER, PACKET_KIND_SHARED, SERVICE_PORT_FIRST, SERVICE_PORT_LAST,
    WORKER_PORT_FIRST, WORKER_PORT_LAST,
};
use crate::discovery::Broadcaster;
use crate::engine::inbox::PopOutcome;
use crate::engine::{DispatchTable, Inbox, Message};
use crate::protocol::{control, ProtocolError};
use crate::transport::frame::FRAME_HEADER_SIZE;
use crate::transport::stream::connect_with_source_port;
use crate::transport::{SocketHandler, StreamSocket};

use handshake::HandshakeState;
use registry::{Connection, ConnectionRegistry};

// ============================================================================
// Errors
// ============================================================================

/// Fabric-level failures surfaced to the caller.
#[derive(Debug)]
pub enum Error {
    /// Rank outside the registry's slot range.
    InvalidRank(usize),
    /// No port in the configured listen range could be bound (fatal at
    /// master startup).
    BindRange {
        first: u16,
        last: u16,
        source: io::Error,
    },
    /// Worker gave up connecting to the master.
    ConnectFailed(String),
    /// A blocking protocol exchange ran out of time.
    HandshakeTimeout(&'static str),
    /// Worker connected to a master running a different tool (stale
    /// worker from a previous job).
    ExeNameMismatch { master: String, local: String },
    /// Malformed bytes on the wire.
    Protocol(ProtocolError),
    /// Underlying socket failure.
    Io(io::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidRank(rank) => write!(f, "invalid rank {}", rank),
            Error::BindRange {
                first,
                last,
                source,
            } => write!(
                f,
                "can't bind a listen port in range [{}, {}]: {}",
                first, last, source
            ),
            Error::ConnectFailed(detail) => write!(f, "connect failed: {}", detail),
            Error::HandshakeTimeout(what) => write!(f, "timed out waiting for {}", what),
            Error::ExeNameMismatch { master, local } => write!(
                f,
                "mismatched exe names (master: {}, me: {}) - usually a stale worker \
                 from the previous job connecting to a new one",
                master, local
            ),
            Error::Protocol(e) => write!(f, "protocol error: {}", e),
            Error::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) | Error::BindRange { source: e, .. } => Some(e),
            Error::Protocol(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Error::Protocol(e)
    }
}

/// Convenient alias for fabric results.
pub type Result<T> = std::result::Result<T, Error>;

// ============================================================================
// Send options
// ============================================================================

/// Per-send routing options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendOpts {
    /// Allow this message into the outbound batch instead of an immediate
    /// write. Only effective when the session was built with packet
    /// grouping on; flushed by [`Session::flush_batches`].
    pub group: bool,
}

impl SendOpts {
    /// Opt this send into batching.
    pub fn grouped() -> Self {
        Self { group: true }
    }
}

// ============================================================================
// Stats
// ============================================================================

#[derive(Debug, Default)]
struct TransferStats {
    messages_sent: AtomicU64,
    bytes_sent: AtomicU64,
    messages_received: AtomicU64,
    bytes_received: AtomicU64,
}

impl TransferStats {
    fn count_sent(&self, payload_len: usize) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent
            .fetch_add((payload_len + FRAME_HEADER_SIZE) as u64, Ordering::Relaxed);
    }

    fn count_received(&self, payload_len: usize) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received
            .fetch_add((payload_len + FRAME_HEADER_SIZE) as u64, Ordering::Relaxed);
    }
}

/// Point-in-time transfer counters (frame headers included in byte
/// counts).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub messages_sent: u64,
    pub bytes_sent: u64,
    pub messages_received: u64,
    pub bytes_received: u64,
}

// ============================================================================
// Configuration
// ============================================================================

/// Master-side setup.
#[derive(Debug, Clone)]
pub struct MasterConfig {
    /// Worker admission cap; clamped to `2..=MAX_CONNECTIONS`.
    pub max_workers: usize,
    /// Advertised job password; workers configured with a different one
    /// ignore the advertisement.
    pub password: String,
    /// Command line handed to workers (without the exe name - it is
    /// prepended automatically).
    pub job_args: Vec<String>,
    /// Also push the full command line to workers over the control
    /// channel (for workers launched bare, without service-provided
    /// arguments).
    pub share_command_line: bool,
    /// Enable outbound small-message batching.
    pub group_packets: bool,
    /// Candidate ports for the job listener.
    pub listen_ports: (u16, u16),
    /// Candidate ports for the downloader listener; `None` disables
    /// downloader admission.
    pub downloader_ports: Option<(u16, u16)>,
    /// Discovery ports the advertisement is sprayed at.
    pub broadcast_ports: (u16, u16),
    /// Advertisement cadence.
    pub broadcast_interval: Duration,
    /// Patch push instead of an open job.
    pub patch: Option<PatchConfig>,
    /// Override the announced machine name (defaults to the host name).
    pub machine_name: Option<String>,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
            password: String::new(),
            job_args: Vec::new(),
            share_command_line: false,
            group_packets: false,
            listen_ports: (MASTER_PORT_FIRST, MASTER_PORT_LAST),
            downloader_ports: Some((DOWNLOADER_LISTEN_PORT_FIRST, DOWNLOADER_LISTEN_PORT_LAST)),
            broadcast_ports: (SERVICE_PORT_FIRST, SERVICE_PORT_LAST),
            broadcast_interval: crate::config::BROADCAST_INTERVAL,
            patch: None,
            machine_name: None,
        }
    }
}

/// Restricted patch-mode targeting.
#[derive(Debug, Clone)]
pub struct PatchConfig {
    /// Version string advertised to services.
    pub version: String,
    /// Push the patch even to services already at this version.
    pub force: bool,
    /// Explicit machines to offer the patch to (no open broadcast).
    pub worker_ips: Vec<std::net::Ipv4Addr>,
}

/// Worker-side setup.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Where the master listens.
    pub master_addr: SocketAddr,
    /// Connect on the downloader port range and skip the job handshake.
    pub downloader_only: bool,
    /// Keep retrying the connect window forever instead of giving up.
    pub retry_forever: bool,
    /// Block until the master pushes the full command line.
    pub expect_command_line: bool,
    /// Enable outbound small-message batching.
    pub group_packets: bool,
    /// Override the source-port range (defaults per role).
    pub source_ports: Option<(u16, u16)>,
    /// Override the announced machine name (defaults to the host name).
    pub machine_name: Option<String>,
}

impl WorkerConfig {
    /// Plain worker setup for `master_addr`.
    pub fn new(master_addr: SocketAddr) -> Self {
        Self {
            master_addr,
            downloader_only: false,
            retry_forever: false,
            expect_command_line: false,
            group_packets: false,
            source_ports: None,
            machine_name: None,
        }
    }
}

// ============================================================================
// Session
// ============================================================================

type DisconnectHandler = Arc<dyn Fn(&Session, usize, &str) + Send + Sync>;

/// One fabric endpoint (master or worker). See the module docs.
pub struct Session {
    pub(crate) registry: ConnectionRegistry,
    pub(crate) inbox: Arc<Inbox>,
    /// Ranks whose socket broke, awaiting single-threaded notification.
    pub(crate) failed: Arc<SegQueue<usize>>,
    dispatch: DispatchTable,
    /// Every payload ever sent with persistent semantics, in send order.
    pub(crate) persistent: Mutex<Vec<Vec<u8>>>,
    disconnect_handlers: Mutex<Vec<DisconnectHandler>>,
    pub(crate) handshake: Mutex<HandshakeState>,
    group_packets: bool,
    last_flush: Mutex<Instant>,
    stats: TransferStats,
    current_stage: Mutex<String>,
    local_name: String,
    is_master: bool,
    shares_command_line: bool,
}

impl Session {
    fn new(
        is_master: bool,
        group_packets: bool,
        shares_command_line: bool,
        local_name: String,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry: ConnectionRegistry::new(),
            inbox: Arc::new(Inbox::new()),
            failed: Arc::new(SegQueue::new()),
            dispatch: DispatchTable::new(),
            persistent: Mutex::new(Vec::new()),
            disconnect_handlers: Mutex::new(Vec::new()),
            handshake: Mutex::new(HandshakeState::default()),
            group_packets,
            last_flush: Mutex::new(Instant::now()),
            stats: TransferStats::default(),
            current_stage: Mutex::new(String::new()),
            local_name,
            is_master,
            shares_command_line,
        })
    }

    /// Bare session for unit tests - no sockets, no broadcaster.
    #[cfg(test)]
    pub(crate) fn test_instance(is_master: bool) -> Arc<Self> {
        Session::new(is_master, false, false, "test".to_string())
    }

    /// Bring up the master: persistent handshake records first, then the
    /// discovery broadcaster. Keep the returned [`Broadcaster`] alive for
    /// as long as workers should be admitted.
    pub fn init_master(mut config: MasterConfig) -> Result<(Arc<Self>, Broadcaster)> {
        config.max_workers = config.max_workers.clamp(2, MAX_CONNECTIONS);
        let name = config
            .machine_name
            .clone()
            .unwrap_or_else(local_machine_name);
        log::info!(
            "[SESSION] master up on {} (cap {} workers)",
            name,
            config.max_workers
        );

        let session = Session::new(true, config.group_packets, config.share_command_line, name);

        // Recorded before any worker can join, so every worker sees them
        // first, via replay.
        session.send_exe_name();
        if config.share_command_line {
            let mut args = vec![handshake::current_exe_basename()];
            args.extend(config.job_args.iter().cloned());
            session.send_command_line(&args);
        }

        let broadcaster = Broadcaster::start(Arc::clone(&session), &config)?;
        Ok((session, broadcaster))
    }

    /// Join a job as a worker (or downloader-only peer): connect to the
    /// master, announce our machine name, and run the join handshake.
    pub fn init_worker(config: WorkerConfig) -> Result<Arc<Self>> {
        let (first, last) = config.source_ports.unwrap_or(if config.downloader_only {
            (DOWNLOADER_PORT_FIRST, DOWNLOADER_PORT_LAST)
        } else {
            (WORKER_PORT_FIRST, WORKER_PORT_LAST)
        });

        let stream = loop {
            let window_start = Instant::now();
            let connected = loop {
                match connect_with_source_port(config.master_addr, first, last) {
                    Ok(stream) => break Some(stream),
                    Err(e) => {
                        if window_start.elapsed() >= CONNECT_WINDOW {
                            break None;
                        }
                        log::debug!("[SESSION] connect to {} failed: {}", config.master_addr, e);
                        thread::sleep(Duration::from_millis(100));
                    }
                }
            };
            match connected {
                Some(stream) => break stream,
                None if config.retry_forever => {
                    log::info!("[SESSION] retrying connection to {}", config.master_addr);
                }
                None => {
                    return Err(Error::ConnectFailed(format!(
                        "no answer from {} within the connect window",
                        config.master_addr
                    )))
                }
            }
        };

        let name = config
            .machine_name
            .clone()
            .unwrap_or_else(local_machine_name);
        let session = Session::new(false, config.group_packets, false, name);

        // Rank 0 on a worker is the link back to the master.
        let master = session
            .registry
            .get(MASTER_RANK)
            .expect("registry seeds rank 0");
        let handler: Arc<dyn SocketHandler> = Arc::new(PeerHandler {
            rank: MASTER_RANK,
            inbox: Arc::clone(&session.inbox),
            failed: Arc::clone(&session.failed),
            conn: Arc::downgrade(&master),
        });
        master.attach_socket(StreamSocket::start(stream, handler)?);

        session.send_machine_name_to(MASTER_RANK)?;
        if !config.downloader_only {
            session.receive_exe_name()?;
            if config.expect_command_line {
                session.receive_command_line()?;
            }
        }
        Ok(session)
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// True on the master endpoint.
    pub fn is_master(&self) -> bool {
        self.is_master
    }

    pub(crate) fn shares_command_line(&self) -> bool {
        self.shares_command_line
    }

    /// Our announced machine name.
    pub fn local_name(&self) -> &str {
        &self.local_name
    }

    /// Total connection slots ever created (dead ones included).
    pub fn registry_count(&self) -> usize {
        self.registry.count()
    }

    /// Live (regular, downloader-only) peer counts.
    pub fn active_counts(&self) -> (usize, usize) {
        self.registry.count_active()
    }

    /// Slot for `rank`; `InvalidRank` when out of range.
    pub fn connection(&self, rank: usize) -> Result<Arc<Connection>> {
        self.registry.get(rank).ok_or(Error::InvalidRank(rank))
    }

    /// Machine name of `rank` (ours for rank 0 on the master).
    pub fn machine_name(&self, rank: usize) -> Result<String> {
        if self.is_master && rank == MASTER_RANK {
            return Ok(self.local_name.clone());
        }
        Ok(self.connection(rank)?.machine_name())
    }

    /// Transfer counters so far.
    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            bytes_sent: self.stats.bytes_sent.load(Ordering::Relaxed),
            messages_received: self.stats.messages_received.load(Ordering::Relaxed),
            bytes_received: self.stats.bytes_received.load(Ordering::Relaxed),
        }
    }

    /// Free-form progress label for status surfaces.
    pub fn set_current_stage(&self, stage: &str) {
        *self.current_stage.lock() = stage.to_string();
    }

    pub fn current_stage(&self) -> String {
        self.current_stage.lock().clone()
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Register the handler for an application packet kind. Must happen
    /// before the dispatch loop starts; registering a kind twice (or the
    /// reserved control kind) panics.
    pub fn register_handler<F>(&self, kind: u8, handler: F)
    where
        F: Fn(&Session, &Message) + Send + Sync + 'static,
    {
        self.dispatch.register(kind, handler);
    }

    /// Add a disconnect observer. Runs on the dispatch thread, after the
    /// connection is already in the permanently-dead state.
    pub fn add_disconnect_handler<F>(&self, handler: F)
    where
        F: Fn(&Session, usize, &str) + Send + Sync + 'static,
    {
        self.disconnect_handlers.lock().push(Arc::new(handler));
    }

    // ------------------------------------------------------------------
    // Dispatch loop
    // ------------------------------------------------------------------

    /// Pop and dispatch one message. Returns `false` when the timeout
    /// elapsed with nothing to do (peer errors are still serviced).
    pub fn dispatch_next(&self, timeout: Duration) -> bool {
        match self.next_message(timeout) {
            Some(msg) => {
                self.dispatch(&msg);
                true
            }
            None => false,
        }
    }

    /// Pump messages until one matching `(kind, sub_kind)` shows up; that
    /// message is returned instead of being dispatched through the table.
    /// Control traffic is still handled internally along the way; other
    /// messages dispatch as usual. `None` on timeout.
    pub fn dispatch_until(
        &self,
        kind: u8,
        sub_kind: Option<u8>,
        timeout: Duration,
    ) -> Option<Message> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let msg = self.next_message(remaining)?;
            if msg.kind() == Some(PACKET_KIND_CONTROL) {
                handshake::handle_control(self, &msg);
                continue;
            }
            if msg.kind() == Some(kind) && (sub_kind.is_none() || msg.sub_kind() == sub_kind) {
                return Some(msg);
            }
            self.dispatch(&msg);
        }
    }

    /// Service pending peer failures now: flip each failed connection to
    /// the permanently-dead state and run the disconnect observers.
    /// Called automatically from the dispatch loop between messages.
    pub fn handle_peer_errors(&self) {
        while let Some(rank) = self.failed.pop() {
            let Some(conn) = self.registry.get(rank) else {
                continue;
            };
            // Already serviced (idempotent - a peer can fail only once).
            let Some(socket) = conn.take_socket() else {
                continue;
            };
            socket.close();
            let reason = conn.error_text();
            log::info!(
                "[SESSION] peer {} ({}) disconnected: {}",
                rank,
                conn.machine_name(),
                reason
            );
            let handlers: Vec<DisconnectHandler> = self.disconnect_handlers.lock().clone();
            for handler in &handlers {
                handler(self, rank, &reason);
            }
        }
    }

    /// Next dispatchable message, with grouped envelopes expanded at the
    /// queue head so their contents keep their place in line.
    fn next_message(&self, timeout: Duration) -> Option<Message> {
        let deadline = Instant::now() + timeout;
        loop {
            self.handle_peer_errors();
            match self.inbox.pop_until(deadline) {
                PopOutcome::Message(msg) => {
                    if control::is_grouped(&msg.bytes) {
                        match control::split_grouped(&msg.bytes) {
                            Ok(subs) => {
                                let rank = msg.source_rank;
                                self.inbox.push_front_all(
                                    subs.into_iter()
                                        .map(|bytes| Message {
                                            source_rank: rank,
                                            bytes,
                                        })
                                        .collect(),
                                );
                            }
                            Err(e) => log::warn!(
                                "[DISPATCH] dropping malformed grouped packet from rank {}: {}",
                                msg.source_rank,
                                e
                            ),
                        }
                        continue;
                    }
                    self.stats.count_received(msg.bytes.len());
                    return Some(msg);
                }
                PopOutcome::Interrupted => continue,
                PopOutcome::TimedOut => {
                    self.handle_peer_errors();
                    return None;
                }
            }
        }
    }

    /// Route one message: built-in control handling for the reserved
    /// kind, the registered handler otherwise. Never raises into the
    /// loop - a bad message from one peer must not take down the rest.
    fn dispatch(&self, msg: &Message) {
        let Some(kind) = msg.kind() else {
            log::warn!("[DISPATCH] empty message from rank {}", msg.source_rank);
            return;
        };
        if kind == PACKET_KIND_CONTROL {
            handshake::handle_control(self, msg);
            return;
        }
        if let Some(handler) = self.dispatch.get(kind) {
            handler(self, msg);
            return;
        }
        let from_downloader = self
            .registry
            .get(msg.source_rank)
            .is_some_and(|c| c.is_downloader_only());
        if !from_downloader {
            log::warn!(
                "[DISPATCH] no handler for packet kind {} from rank {}",
                kind,
                msg.source_rank
            );
        }
    }

    // ------------------------------------------------------------------
    // Send paths
    // ------------------------------------------------------------------

    /// Send one message to one peer. `Ok(false)` means the peer is
    /// permanently dead (no I/O happened); `InvalidRank` means the rank
    /// never existed.
    pub fn send_to(&self, rank: usize, bytes: &[u8]) -> Result<bool> {
        self.send_to_opts(rank, bytes, SendOpts::default())
    }

    /// [`send_to`](Self::send_to) with routing options.
    pub fn send_to_opts(&self, rank: usize, bytes: &[u8], opts: SendOpts) -> Result<bool> {
        let conn = self.connection(rank)?;
        Ok(self.send_to_conn(&conn, bytes, opts))
    }

    /// Send to every currently known peer. Connections admitted while the
    /// broadcast is in flight are not retroactively included.
    pub fn send_to_all(&self, bytes: &[u8]) {
        self.send_to_all_opts(bytes, SendOpts::default());
    }

    /// [`send_to_all`](Self::send_to_all) with routing options.
    pub fn send_to_all_opts(&self, bytes: &[u8], opts: SendOpts) {
        let guard = self.registry.guard();
        for conn in guard.iter() {
            self.send_to_conn(conn, bytes, opts);
        }
    }

    /// Send to every current peer *and* record the payload for verbatim
    /// replay to every future peer, in original send order.
    ///
    /// Holding the admission lock across both steps is what guarantees a
    /// joining peer sees the message exactly once: admission either
    /// happened before (live copy) or after (replay copy), never during.
    pub fn send_persistent(&self, bytes: &[u8]) {
        let guard = self.registry.guard();
        for conn in guard.iter() {
            self.send_to_conn(conn, bytes, SendOpts::default());
        }
        self.persistent.lock().push(bytes.to_vec());
    }

    /// Queue `bytes` into `rank`'s outbound batch unconditionally. The
    /// accumulated batch leaves as one grouped envelope on the next
    /// [`flush_batches`](Self::flush_batches); receivers cannot tell the
    /// difference from individual sends. Same dead-peer and downloader
    /// semantics as [`send_to`](Self::send_to).
    pub fn batch_to(&self, rank: usize, bytes: &[u8]) -> Result<bool> {
        let conn = self.connection(rank)?;
        if downloader_filtered(&conn, bytes) {
            return Ok(true);
        }
        if !conn.is_connected() {
            return Ok(false);
        }
        self.stats.count_sent(bytes.len());
        conn.push_batch(bytes.to_vec());
        Ok(true)
    }

    /// Wrap each peer's accumulated batch into one grouped envelope and
    /// send it. With `min_interval` set, the call is a no-op until that
    /// long since the previous flush (cheap to call from a hot loop).
    pub fn flush_batches(&self, min_interval: Option<Duration>) {
        if let Some(interval) = min_interval {
            let mut last = self.last_flush.lock();
            if last.elapsed() < interval {
                return;
            }
            *last = Instant::now();
        }

        let guard = self.registry.guard();
        for conn in guard.iter() {
            let subs = conn.take_batch();
            if subs.is_empty() {
                continue;
            }
            let Some(socket) = conn.socket() else {
                continue;
            };
            let envelope = control::build_grouped(&subs);
            log::debug!(
                "[SESSION] flushing {} grouped messages to rank {}",
                subs.len(),
                conn.rank()
            );
            socket.send(&envelope);
        }
    }

    /// The one place bytes head toward a peer. Filters downloader-only
    /// destinations, batches when asked to, counts stats on success.
    pub(crate) fn send_to_conn(&self, conn: &Connection, bytes: &[u8], opts: SendOpts) -> bool {
        if downloader_filtered(conn, bytes) {
            // Filtered to nothing - by contract, not a failure.
            return true;
        }
        let Some(socket) = conn.socket() else {
            return false;
        };
        if self.group_packets && opts.group {
            self.stats.count_sent(bytes.len());
            conn.push_batch(bytes.to_vec());
            return true;
        }
        if socket.send(bytes) {
            self.stats.count_sent(bytes.len());
            true
        } else {
            false
        }
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Close every socket and drop queued state. Stop the broadcaster
    /// (drop it) before calling this on the master.
    pub fn finalize(&self) {
        let conns: Vec<Arc<Connection>> = self.registry.guard().clone();
        for conn in conns {
            if let Some(socket) = conn.take_socket() {
                socket.close();
            }
        }
        self.inbox.clear();
        self.persistent.lock().clear();
        log::debug!("[SESSION] finalized");
    }
}

// ============================================================================
// Socket-to-inbox glue
// ============================================================================

/// Per-connection receiver running on that socket's reader thread. Only
/// ever enqueues: messages into the inbox, failures into the error queue.
pub(crate) struct PeerHandler {
    pub(crate) rank: usize,
    pub(crate) inbox: Arc<Inbox>,
    pub(crate) failed: Arc<SegQueue<usize>>,
    pub(crate) conn: Weak<Connection>,
}

impl SocketHandler for PeerHandler {
    fn on_message(&self, payload: Vec<u8>) {
        self.inbox.push(Message {
            source_rank: self.rank,
            bytes: payload,
        });
    }

    fn on_error(&self, reason: &str) {
        if let Some(conn) = self.conn.upgrade() {
            conn.set_error_text(reason);
        }
        self.failed.push(self.rank);
        // The dispatch thread drains failures between messages.
        self.inbox.interrupt();
    }
}

/// True when `bytes` must never be queued toward a downloader-only peer.
/// Downloaders receive control, shared, and file-transfer traffic only.
fn downloader_filtered(conn: &Connection, bytes: &[u8]) -> bool {
    conn.is_downloader_only()
        && !matches!(
            bytes.first(),
            Some(&PACKET_KIND_CONTROL | &PACKET_KIND_SHARED | &PACKET_KIND_FILE_TRANSFER)
        )
}

/// Best-effort host name for peer announcements.
fn local_machine_name() -> String {
    for var in ["HOSTNAME", "COMPUTERNAME"] {
        if let Ok(name) = std::env::var(var) {
            if !name.is_empty() {
                return name;
            }
        }
    }
    local_ip_address::local_ip()
        .map(|ip| ip.to_string())
        .unwrap_or_else(|_| "unknown-host".to_string())
}
