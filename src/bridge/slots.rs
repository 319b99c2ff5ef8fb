//! Callback Slot Table
//!
//! One slot per logical event kind, holding at most one live subscriber
//! callback. Installing a callback supersedes the previous one atomically;
//! a removed slot is observed as dead by any in-flight delivery. The liveness
//! check and the handle fetch are a single step under the slot lock, and the
//! callback itself always runs (and superseded callbacks are always dropped)
//! with no slot lock held, so a callback's own teardown path can never
//! deadlock against delivery.

use log::debug;
use parking_lot::Mutex;
use std::sync::Arc;

use super::events::{BridgeEvent, EventCallback, EventKind};

type SharedCallback = Arc<dyn Fn(BridgeEvent) + Send + Sync>;

/// Fixed-size table of per-event-kind callback slots
pub struct CallbackSlotTable {
    slots: [Mutex<Option<SharedCallback>>; EventKind::COUNT],
}

impl CallbackSlotTable {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| Mutex::new(None)),
        }
    }

    /// Install a callback for `kind`, superseding any previous one. Returns
    /// whether a previous callback was superseded.
    ///
    /// The swap happens under the slot lock; the superseded callback is
    /// dropped only after the lock is released. A delivery racing with the
    /// install either completes with the old callback or runs the new one,
    /// never neither.
    pub fn install(&self, kind: EventKind, callback: EventCallback) -> bool {
        let shared: SharedCallback = Arc::from(callback);
        let superseded = {
            let mut slot = self.slots[kind.index()].lock();
            slot.replace(shared)
        };
        if superseded.is_some() {
            debug!("superseded {} callback", kind);
        }
        superseded.is_some()
    }

    /// Mark the slot for `kind` dead and release its callback. Returns
    /// whether a live callback was removed.
    ///
    /// Take-then-release: the slot is empty before the old callback is
    /// dropped, so no delivery can observe a half-released slot.
    pub fn remove(&self, kind: EventKind) -> bool {
        let removed = {
            let mut slot = self.slots[kind.index()].lock();
            slot.take()
        };
        removed.is_some()
    }

    /// Deliver `event` to the callback for `kind`; no-op if the slot is dead.
    ///
    /// Safe to call concurrently with `install`/`remove` for the same kind
    /// from any thread.
    pub fn invoke(&self, kind: EventKind, event: BridgeEvent) {
        let callback = {
            let slot = self.slots[kind.index()].lock();
            slot.clone()
        };
        match callback {
            Some(cb) => cb(event),
            None => debug!("dropped {} event: no live callback", kind),
        }
    }

    /// Whether a live callback is installed for `kind`
    pub fn is_live(&self, kind: EventKind) -> bool {
        self.slots[kind.index()].lock().is_some()
    }

    /// Every kind that currently has a live callback
    pub fn live_kinds(&self) -> Vec<EventKind> {
        EventKind::ALL
            .into_iter()
            .filter(|kind| self.is_live(*kind))
            .collect()
    }

    /// Release every slot; used only during bridge teardown
    pub fn clear(&self) {
        for kind in EventKind::ALL {
            self.remove(kind);
        }
    }
}

impl Default for CallbackSlotTable {
    fn default() -> Self {
        Self::new()
    }
}
