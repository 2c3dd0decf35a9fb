// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 jobfab contributors

//! Master-side discovery and admission.
//!
//! A dedicated thread advertises the job over UDP broadcast every
//! [`BROADCAST_INTERVAL`] and polls the worker/downloader listeners in
//! between. Admission happens under the registry's lock: the cap is
//! checked, the slot created, and every persistent record replayed to the
//! newcomer before any concurrent persistent send can interleave.
//!
//! The thread observes shutdown within one poll tick; `Broadcaster::drop`
//! stops and joins it.

use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::{
    ARG_NO_TIMEOUT, BROADCAST_ACCEPT_BUDGET, BROADCAST_POLL_TICK, DOWNLOADER_CAP_SLACK,
    MAX_CONNECTIONS,
};
use crate::protocol::{generate_job_id, AdvertKind, Advertisement};
use crate::session::handshake::current_exe_basename;
use crate::session::registry::{ConnectionRegistry, RegistryGuard};
use crate::session::{Error, MasterConfig, PeerHandler, Result, SendOpts, Session};
use crate::transport::{DatagramSocket, SocketHandler, StreamListener, StreamSocket};

/// Handle to the running discovery thread. Dropping it stops discovery
/// and admission; existing connections live on.
pub struct Broadcaster {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

struct Shared {
    session: Arc<Session>,
    shutdown: AtomicBool,
    /// Mutated only while the registry's admission lock is held, so cap
    /// changes can't race the cap check in [`Shared::tick`].
    state: Mutex<AdvertState>,
    listener: StreamListener,
    downloader_listener: Option<StreamListener>,
    datagram: DatagramSocket,
    broadcast_ports: (u16, u16),
    broadcast_interval: Duration,
    patching: bool,
}

struct AdvertState {
    advert: Advertisement,
    /// Cached datagram; `None` after a mutator dirtied the advert.
    encoded: Option<Vec<u8>>,
    max_workers: usize,
    last_send: Option<Instant>,
    patch_ips: Vec<std::net::Ipv4Addr>,
}

impl Broadcaster {
    /// Bind the listen sockets, build the advertisement, and start the
    /// discovery thread. Failing to bind any port in a configured range
    /// is fatal.
    pub(crate) fn start(session: Arc<Session>, config: &MasterConfig) -> Result<Broadcaster> {
        let (first, last) = config.listen_ports;
        let listener = StreamListener::bind_in_range(first, last).map_err(|source| {
            Error::BindRange {
                first,
                last,
                source,
            }
        })?;

        let downloader_listener = match config.downloader_ports {
            Some((first, last)) => Some(StreamListener::bind_in_range(first, last).map_err(
                |source| Error::BindRange {
                    first,
                    last,
                    source,
                },
            )?),
            None => None,
        };

        let datagram = DatagramSocket::bind_any()?;

        let mut args = vec![current_exe_basename()];
        args.extend(config.job_args.iter().cloned());

        let advert = Advertisement {
            password: config.password.clone(),
            kind: if config.patch.is_some() {
                AdvertKind::ServicePatch
            } else {
                AdvertKind::LookForWorkers
            },
            patch_version: config
                .patch
                .as_ref()
                .map(|p| p.version.clone())
                .unwrap_or_default(),
            listen_port: i32::from(listener.port()),
            job_id: generate_job_id(),
            args,
            force_patch: config.patch.as_ref().is_some_and(|p| p.force),
            downloader_port: downloader_listener
                .as_ref()
                .map_or(-1, |l| l.port() as i16),
        };
        // Encode once up front so an oversized command line fails setup
        // instead of silently dropping broadcasts later.
        let encoded = advert.encode()?;

        log::info!(
            "[BCAST] job {:?} listening on {} (downloaders: {:?})",
            advert.job_id,
            listener.port(),
            downloader_listener.as_ref().map(StreamListener::port)
        );

        let shared = Arc::new(Shared {
            session,
            shutdown: AtomicBool::new(false),
            state: Mutex::new(AdvertState {
                advert,
                encoded: Some(encoded),
                max_workers: config.max_workers,
                last_send: None,
                patch_ips: config
                    .patch
                    .as_ref()
                    .map(|p| p.worker_ips.clone())
                    .unwrap_or_default(),
            }),
            listener,
            downloader_listener,
            datagram,
            broadcast_ports: config.broadcast_ports,
            broadcast_interval: config.broadcast_interval,
            patching: config.patch.is_some(),
        });

        let thread_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("jobfab-bcast".to_string())
            .spawn(move || thread_shared.run())
            .map_err(Error::Io)?;

        Ok(Broadcaster {
            shared,
            thread: Some(thread),
        })
    }

    /// Port the job listener ended up on.
    pub fn listen_port(&self) -> u16 {
        self.shared.listener.port()
    }

    /// Port of the downloader listener, when one is up.
    pub fn downloader_listen_port(&self) -> Option<u16> {
        self.shared
            .downloader_listener
            .as_ref()
            .map(StreamListener::port)
    }

    /// Current worker admission cap.
    pub fn max_workers(&self) -> usize {
        let _admission = self.shared.session.registry.guard();
        self.shared.state.lock().max_workers
    }

    /// Let `delta` more workers in (takes effect on the next tick).
    pub fn increase_max_workers(&self, delta: usize) {
        let _admission = self.shared.session.registry.guard();
        let mut state = self.shared.state.lock();
        state.max_workers = (state.max_workers + delta).min(MAX_CONNECTIONS);
    }

    /// Change the advertised password; next broadcast carries it.
    pub fn set_password(&self, password: &str) {
        let _admission = self.shared.session.registry.guard();
        let mut state = self.shared.state.lock();
        state.advert.password = password.to_string();
        state.encoded = None;
    }

    /// Add the no-timeout option to the advertised worker command line
    /// (idempotent).
    pub fn set_no_timeout_option(&self) {
        let _admission = self.shared.session.registry.guard();
        let mut state = self.shared.state.lock();
        if state.advert.args.iter().any(|a| a == ARG_NO_TIMEOUT) {
            return;
        }
        state.advert.args.insert(1, ARG_NO_TIMEOUT.to_string());
        state.encoded = None;
    }

    /// Open the job to debugger-driven workers: password `debugworker`,
    /// timeouts off, and room for 25 more.
    pub fn invite_debug_workers(&self) {
        self.set_password("debugworker");
        self.set_no_timeout_option();
        self.increase_max_workers(25);
    }

    /// Stop the discovery thread. Observed within one poll tick.
    pub fn stop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Broadcaster {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    fn run(&self) {
        log::debug!(
            "[BCAST] thread up, advertising on ports {}..={}",
            self.broadcast_ports.0,
            self.broadcast_ports.1
        );
        while !self.shutdown.load(Ordering::Acquire) {
            let tick_start = Instant::now();
            // Keep admitting while peers are queued up, within a budget
            // so broadcasts never starve.
            while self.tick() && tick_start.elapsed() < BROADCAST_ACCEPT_BUDGET {}
            thread::sleep(BROADCAST_POLL_TICK);
        }
        log::debug!("[BCAST] thread stopped");
    }

    /// One broadcast-and-accept pass. Returns true when a peer was
    /// admitted (caller loops to drain the backlog).
    fn tick(&self) -> bool {
        let mut registry = self.session.registry.guard();
        let (workers, downloaders) = ConnectionRegistry::count_active_in(&registry);
        let mut state = self.state.lock();

        // Full house: stop advertising and stop answering the door.
        if workers >= state.max_workers {
            return false;
        }

        if state
            .last_send
            .is_none_or(|t| t.elapsed() >= self.broadcast_interval)
        {
            self.send_advertisement(&mut state);
            state.last_send = Some(Instant::now());
        }

        let downloader_cap = (state.max_workers - workers) + DOWNLOADER_CAP_SLACK;
        drop(state);

        // Workers first, then downloaders (with their looser cap).
        match self.listener.poll_accept() {
            Ok(Some((stream, addr))) => {
                self.admit(&mut registry, stream, addr, false);
                return true;
            }
            Ok(None) => {}
            Err(e) => log::warn!("[BCAST] worker accept failed: {}", e),
        }
        if let Some(listener) = &self.downloader_listener {
            if downloaders < downloader_cap {
                match listener.poll_accept() {
                    Ok(Some((stream, addr))) => {
                        self.admit(&mut registry, stream, addr, true);
                        return true;
                    }
                    Ok(None) => {}
                    Err(e) => log::warn!("[BCAST] downloader accept failed: {}", e),
                }
            }
        }
        false
    }

    fn send_advertisement(&self, state: &mut AdvertState) {
        if state.encoded.is_none() {
            match state.advert.encode() {
                Ok(payload) => state.encoded = Some(payload),
                Err(e) => {
                    log::warn!("[BCAST] advertisement rebuild failed: {}", e);
                    return;
                }
            }
        }
        let payload = state.encoded.as_deref().expect("just rebuilt");

        for port in self.broadcast_ports.0..=self.broadcast_ports.1 {
            if self.patching {
                for ip in &state.patch_ips {
                    if let Err(e) = self.datagram.send_to(payload, *ip, port) {
                        log::debug!("[BCAST] patch send to {}:{} failed: {}", ip, port, e);
                    }
                }
            } else if let Err(e) = self.datagram.broadcast_to_port(payload, port) {
                log::debug!("[BCAST] broadcast to port {} failed: {}", port, e);
            }
        }

        // A forced patch goes out once per machine, not forever.
        if self.patching && state.advert.force_patch && !state.patch_ips.is_empty() {
            state.patch_ips.clear();
        }
    }

    /// Create the slot, wire the socket into the inbox, and replay every
    /// persistent record. Runs with the admission lock held, so no
    /// persistent send and no other admission can interleave.
    fn admit(
        &self,
        registry: &mut RegistryGuard<'_>,
        stream: TcpStream,
        addr: SocketAddr,
        downloader: bool,
    ) {
        let conn = ConnectionRegistry::create_in(registry);
        if downloader {
            conn.set_downloader_only();
        }

        let handler: Arc<dyn SocketHandler> = Arc::new(PeerHandler {
            rank: conn.rank(),
            inbox: Arc::clone(&self.session.inbox),
            failed: Arc::clone(&self.session.failed),
            conn: Arc::downgrade(&conn),
        });
        match StreamSocket::start(stream, handler) {
            Ok(socket) => conn.attach_socket(socket),
            Err(e) => {
                // The slot stays dead; ranks are never recycled.
                log::warn!("[BCAST] socket setup for {} failed: {}", addr, e);
                return;
            }
        }
        log::info!(
            "[BCAST] admitted {} as rank {}{}",
            addr,
            conn.rank(),
            if downloader { " (downloader)" } else { "" }
        );

        let records = self.session.persistent.lock();
        for record in records.iter() {
            self.session.send_to_conn(&conn, record, SendOpts::default());
        }
    }
}
