// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 jobfab contributors

//! Connection slots and the admission lock.
//!
//! Every peer occupies one rank in an append-only slot list; ranks are
//! handed out monotonically and never recycled, so a rank stays a valid
//! address for the whole process even after its peer vanished. Rank 0 is
//! seeded at construction: the master's virtual self-entry on the master,
//! the link back to the master on a worker.
//!
//! The slot list's mutex doubles as the admission lock - persistent sends
//! and new-peer admission serialize on it, which is what makes the
//! replay-exactly-once guarantee hold (see `Session::send_persistent`).

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use parking_lot::{Mutex, MutexGuard};

use crate::config::MAX_CONNECTIONS;
use crate::transport::StreamSocket;

/// Job-layer worker id sentinel: not assigned yet.
const JOB_WORKER_UNASSIGNED: u32 = u32::MAX;

/// One peer (or the local self-entry at rank 0).
pub struct Connection {
    rank: usize,
    /// Machine name; starts as the rank rendered as digits until the peer
    /// announces its real name.
    machine_name: Mutex<MachineName>,
    job_worker_id: AtomicU32,
    downloader_only: AtomicBool,
    /// Reason recorded by the I/O thread that saw the stream break.
    error_text: Mutex<String>,
    /// Not-yet-flushed grouped sub-messages bound for this peer.
    batch: Mutex<Vec<Vec<u8>>>,
    /// Live transport, or `None` once the peer is permanently dead.
    /// ArcSwap so I/O threads never observe a torn pointer.
    socket: ArcSwapOption<StreamSocket>,
}

struct MachineName {
    name: String,
    announced: bool,
}

impl Connection {
    fn new(rank: usize) -> Self {
        Self {
            rank,
            machine_name: Mutex::new(MachineName {
                name: rank.to_string(),
                announced: false,
            }),
            job_worker_id: AtomicU32::new(JOB_WORKER_UNASSIGNED),
            downloader_only: AtomicBool::new(false),
            error_text: Mutex::new(String::new()),
            batch: Mutex::new(Vec::new()),
            socket: ArcSwapOption::empty(),
        }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn machine_name(&self) -> String {
        self.machine_name.lock().name.clone()
    }

    /// True once the peer announced a real name (vs. the rank default).
    pub fn has_machine_name(&self) -> bool {
        self.machine_name.lock().announced
    }

    pub fn set_machine_name(&self, name: &str) {
        let mut guard = self.machine_name.lock();
        guard.name = name.to_string();
        guard.announced = true;
    }

    /// Job-layer worker id, if one was assigned.
    pub fn job_worker_id(&self) -> Option<u32> {
        match self.job_worker_id.load(Ordering::Relaxed) {
            JOB_WORKER_UNASSIGNED => None,
            id => Some(id),
        }
    }

    pub fn set_job_worker_id(&self, id: u32) {
        debug_assert!(id != JOB_WORKER_UNASSIGNED);
        self.job_worker_id.store(id, Ordering::Relaxed);
    }

    /// A peer that only wants staged files, never job traffic.
    pub fn is_downloader_only(&self) -> bool {
        self.downloader_only.load(Ordering::Relaxed)
    }

    pub fn set_downloader_only(&self) {
        self.downloader_only.store(true, Ordering::Relaxed);
    }

    pub(crate) fn attach_socket(&self, socket: Arc<StreamSocket>) {
        self.socket.store(Some(socket));
    }

    /// Current transport, when the peer is alive.
    pub(crate) fn socket(&self) -> Option<Arc<StreamSocket>> {
        self.socket.load_full()
    }

    /// Flip to the permanently-dead state; returns the socket so the
    /// caller can close it. Idempotent.
    pub(crate) fn take_socket(&self) -> Option<Arc<StreamSocket>> {
        self.socket.swap(None)
    }

    /// Alive means "has a transport attached".
    pub fn is_connected(&self) -> bool {
        self.socket.load().is_some()
    }

    pub(crate) fn set_error_text(&self, text: &str) {
        *self.error_text.lock() = text.to_string();
    }

    pub(crate) fn error_text(&self) -> String {
        self.error_text.lock().clone()
    }

    pub(crate) fn push_batch(&self, payload: Vec<u8>) {
        self.batch.lock().push(payload);
    }

    pub(crate) fn take_batch(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.batch.lock())
    }
}

/// Guard over the slot list; holding it blocks admission and persistent
/// sends.
pub type RegistryGuard<'a> = MutexGuard<'a, Vec<Arc<Connection>>>;

/// The single source of truth for "who is connected".
pub struct ConnectionRegistry {
    slots: Mutex<Vec<Arc<Connection>>>,
}

impl ConnectionRegistry {
    /// Create the registry with rank 0 pre-seeded.
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(vec![Arc::new(Connection::new(0))]),
        }
    }

    /// Take the admission lock.
    pub fn guard(&self) -> RegistryGuard<'_> {
        self.slots.lock()
    }

    /// Allocate the next rank. Caller must hold the admission lock.
    pub fn create_in(guard: &mut RegistryGuard<'_>) -> Arc<Connection> {
        assert!(guard.len() < MAX_CONNECTIONS, "connection slots exhausted");
        let conn = Arc::new(Connection::new(guard.len()));
        guard.push(Arc::clone(&conn));
        conn
    }

    /// Slot for `rank`, dead or alive.
    pub fn get(&self, rank: usize) -> Option<Arc<Connection>> {
        self.slots.lock().get(rank).cloned()
    }

    /// Total slots ever created (dead ones included - ranks are never
    /// recycled).
    pub fn count(&self) -> usize {
        self.slots.lock().len()
    }

    /// Live regular workers and live downloader-only peers, counted under
    /// an already-held admission lock.
    pub fn count_active_in(guard: &RegistryGuard<'_>) -> (usize, usize) {
        let mut workers = 0;
        let mut downloaders = 0;
        for conn in guard.iter() {
            if conn.is_connected() {
                if conn.is_downloader_only() {
                    downloaders += 1;
                } else {
                    workers += 1;
                }
            }
        }
        (workers, downloaders)
    }

    /// Convenience wrapper around [`Self::count_active_in`].
    pub fn count_active(&self) -> (usize, usize) {
        Self::count_active_in(&self.guard())
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rank_zero_is_seeded() {
        let registry = ConnectionRegistry::new();
        assert_eq!(registry.count(), 1);
        let master = registry.get(0).unwrap();
        assert_eq!(master.rank(), 0);
        assert!(!master.is_connected());
    }

    #[test]
    fn ranks_are_monotonic() {
        let registry = ConnectionRegistry::new();
        let mut guard = registry.guard();
        let a = ConnectionRegistry::create_in(&mut guard);
        let b = ConnectionRegistry::create_in(&mut guard);
        assert_eq!(a.rank(), 1);
        assert_eq!(b.rank(), 2);
        drop(guard);
        assert_eq!(registry.count(), 3);
    }

    #[test]
    fn out_of_range_rank_is_none() {
        let registry = ConnectionRegistry::new();
        assert!(registry.get(7).is_none());
    }

    #[test]
    fn default_machine_name_is_the_rank() {
        let registry = ConnectionRegistry::new();
        let mut guard = registry.guard();
        let conn = ConnectionRegistry::create_in(&mut guard);
        assert_eq!(conn.machine_name(), "1");
        assert!(!conn.has_machine_name());

        conn.set_machine_name("build-box-12");
        assert_eq!(conn.machine_name(), "build-box-12");
        assert!(conn.has_machine_name());
    }

    #[test]
    fn job_worker_id_starts_unassigned() {
        let registry = ConnectionRegistry::new();
        let conn = registry.get(0).unwrap();
        assert_eq!(conn.job_worker_id(), None);
        conn.set_job_worker_id(42);
        assert_eq!(conn.job_worker_id(), Some(42));
    }

    #[test]
    fn batch_take_drains() {
        let registry = ConnectionRegistry::new();
        let conn = registry.get(0).unwrap();
        conn.push_batch(vec![1, 2]);
        conn.push_batch(vec![3]);
        assert_eq!(conn.take_batch(), vec![vec![1, 2], vec![3]]);
        assert!(conn.take_batch().is_empty());
    }
}
