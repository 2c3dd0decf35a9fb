// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 jobfab contributors

//! Packet-kind to handler mapping.
//!
//! A fixed table of `MAX_PACKET_KINDS` slots, filled once during startup
//! and read by the single dispatch thread afterwards. Registration
//! mistakes (kind out of range, double registration, claiming the
//! reserved control kind) are programming errors and panic.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::{MAX_PACKET_KINDS, PACKET_KIND_CONTROL};
use crate::engine::inbox::Message;
use crate::session::Session;

/// An application packet handler. Runs synchronously on the dispatch
/// thread, so it needs no locking of its own for dispatch state; it must
/// take the registry lock when touching connection fields.
pub type Handler = Arc<dyn Fn(&Session, &Message) + Send + Sync>;

/// Fixed-size packet-kind dispatch table.
pub struct DispatchTable {
    slots: RwLock<[Option<Handler>; MAX_PACKET_KINDS]>,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(std::array::from_fn(|_| None)),
        }
    }

    /// Register the handler for `kind`. Must happen before the dispatch
    /// loop starts; each kind is registered at most once.
    ///
    /// # Panics
    ///
    /// On an out-of-range kind, the reserved control kind, or a kind that
    /// already has a handler.
    pub fn register<F>(&self, kind: u8, handler: F)
    where
        F: Fn(&Session, &Message) + Send + Sync + 'static,
    {
        assert!(
            (kind as usize) < MAX_PACKET_KINDS,
            "packet kind {} out of range",
            kind
        );
        assert!(
            kind != PACKET_KIND_CONTROL,
            "packet kind {} is reserved for the fabric",
            kind
        );
        let mut slots = self.slots.write();
        assert!(
            slots[kind as usize].is_none(),
            "packet kind {} registered twice",
            kind
        );
        slots[kind as usize] = Some(Arc::new(handler));
    }

    /// Handler for `kind`, if one was registered.
    pub fn get(&self, kind: u8) -> Option<Handler> {
        self.slots
            .read()
            .get(kind as usize)
            .and_then(|slot| slot.clone())
    }
}

impl Default for DispatchTable {
    fn default() -> Self {
        Self::new()
    }
}
