// =============================================================================
// Listener registry — RAII subscriptions to series updates
// =============================================================================
//
// Each listener sits behind a reentrant lock that is held for the duration of
// its callback. Unsubscribing takes the same lock before flipping the slot
// off, so once `unsubscribe` returns the callback is neither running on
// another thread nor invoked again. Reentrancy lets a callback drop its own
// subscription.
// =============================================================================

use std::cell::Cell;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{ReentrantMutex, RwLock};
use tracing::trace;

use crate::market_data::Candle;
use crate::types::SeriesKey;

/// Payload delivered to listeners after every accepted upsert.
#[derive(Debug, Clone)]
pub struct SeriesUpdate {
    pub key: SeriesKey,
    pub latest: Candle,
    /// Full series, oldest first.
    pub snapshot: Arc<Vec<Candle>>,
    pub synthetic: bool,
}

pub type Listener = Box<dyn Fn(&SeriesUpdate) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

struct ListenerSlot {
    callback: Listener,
    active: ReentrantMutex<Cell<bool>>,
}

type SlotMap = RwLock<HashMap<ListenerId, Arc<ListenerSlot>>>;

#[derive(Default)]
pub struct ListenerRegistry {
    slots: Arc<SlotMap>,
    next_id: AtomicU64,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&SeriesUpdate) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let slot = Arc::new(ListenerSlot {
            callback: Box::new(callback),
            active: ReentrantMutex::new(Cell::new(true)),
        });
        self.slots.write().insert(id, slot);
        trace!(listener = %id, "listener added");

        Subscription {
            id,
            slots: Some(Arc::downgrade(&self.slots)),
        }
    }

    /// Invoke every current listener with `update`. Listeners added during
    /// the call are not invoked for this update.
    pub fn notify(&self, update: &SeriesUpdate) {
        let current: Vec<Arc<ListenerSlot>> = self.slots.read().values().cloned().collect();
        for slot in current {
            let active = slot.active.lock();
            if active.get() {
                (slot.callback)(update);
            }
        }
    }

    /// Remove every listener. Outstanding `Subscription`s become no-ops.
    pub fn clear(&self) {
        let drained: Vec<Arc<ListenerSlot>> =
            self.slots.write().drain().map(|(_, slot)| slot).collect();
        for slot in drained {
            slot.active.lock().set(false);
        }
    }

    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }
}

/// Handle to one registered listener. Dropping it unsubscribes.
pub struct Subscription {
    id: ListenerId,
    slots: Option<Weak<SlotMap>>,
}

impl Subscription {
    /// Remove the listener now. Equivalent to dropping the handle.
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        let Some(slots) = self.slots.take().and_then(|weak| weak.upgrade()) else {
            return;
        };
        let removed = slots.write().remove(&self.id);
        if let Some(slot) = removed {
            // Waits for an in-flight callback on another thread.
            slot.active.lock().set(false);
            trace!(listener = %self.id, "listener removed");
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
