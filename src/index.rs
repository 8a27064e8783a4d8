//! Handle index: 32-bit handles to refcounted slots.
//!
//! The registry hands out non-zero `u32` handles whose low bits address a
//! slot in a power-of-two table; the counter keeps climbing so a reaped
//! handle is not immediately re-issued. A slot is live iff its refcount is
//! positive. [`Index::grab`] takes a reference under the reader lock;
//! [`Index::release`] drops one and, on the transition to zero, re-checks
//! under the writer lock and reaps the slot. The stored value is an `Arc`,
//! so a grabbed clone stays usable even after the slot is gone.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use crate::lock::RwLock;

pub type Handle = u32;

const INITIAL_SLOTS: usize = 16;

struct Slot<T> {
    id: Handle,
    refc: AtomicI32,
    val: Option<Arc<T>>,
}

impl<T> Slot<T> {
    fn vacant() -> Slot<T> {
        Slot {
            id: 0,
            refc: AtomicI32::new(0),
            val: None,
        }
    }
}

struct Inner<T> {
    last: Handle,
    count: usize,
    slots: Vec<Slot<T>>,
}

pub struct Index<T> {
    inner: RwLock<Inner<T>>,
}

impl<T> Index<T> {
    pub fn new() -> Index<T> {
        let mut slots = Vec::with_capacity(INITIAL_SLOTS);
        slots.resize_with(INITIAL_SLOTS, Slot::vacant);
        Index {
            inner: RwLock::new(Inner {
                last: 0,
                count: 0,
                slots,
            }),
        }
    }

    /// Register a new entry, constructing it once its handle is known.
    /// The slot starts with refcount 1: the registry's own reference.
    pub fn register(&self, make: impl FnOnce(Handle) -> Arc<T>) -> Handle {
        let mut inner = self.inner.write();
        if inner.count >= inner.slots.len() * 3 / 4 {
            expand(&mut inner);
        }
        let mask = inner.slots.len() as Handle - 1;
        loop {
            inner.last = inner.last.wrapping_add(1);
            if inner.last == 0 {
                inner.last = 1;
            }
            let id = inner.last;
            let at = (id & mask) as usize;
            if inner.slots[at].id != 0 {
                continue;
            }
            inner.slots[at].id = id;
            inner.slots[at].refc.store(1, Ordering::Relaxed);
            inner.slots[at].val = Some(make(id));
            inner.count += 1;
            return id;
        }
    }

    /// Take a reference: bump the refcount and clone the value out.
    pub fn grab(&self, id: Handle) -> Option<Arc<T>> {
        if id == 0 {
            return None;
        }
        let inner = self.inner.read();
        let at = (id as usize) & (inner.slots.len() - 1);
        let slot = &inner.slots[at];
        if slot.id != id {
            return None;
        }
        slot.refc.fetch_add(1, Ordering::AcqRel);
        slot.val.clone()
    }

    /// Drop a reference. Returns the value only on the call that actually
    /// reaps the slot; that caller owns teardown.
    pub fn release(&self, id: Handle) -> Option<Arc<T>> {
        if id == 0 {
            return None;
        }
        {
            let inner = self.inner.read();
            let at = (id as usize) & (inner.slots.len() - 1);
            let slot = &inner.slots[at];
            if slot.id != id {
                return None;
            }
            if slot.refc.fetch_sub(1, Ordering::AcqRel) > 1 {
                return None;
            }
        }
        // We saw the count hit zero; re-verify with the table locked, since
        // a grab may have revived the slot in the window.
        let mut inner = self.inner.write();
        let at = (id as usize) & (inner.slots.len() - 1);
        let slot = &mut inner.slots[at];
        if slot.id != id || slot.refc.load(Ordering::Acquire) > 0 {
            return None;
        }
        slot.id = 0;
        let val = slot.val.take();
        inner.count -= 1;
        val
    }

    /// Copy up to `limit` live handles.
    pub fn list(&self, limit: usize) -> Vec<Handle> {
        let inner = self.inner.read();
        inner
            .slots
            .iter()
            .filter(|s| s.id != 0)
            .take(limit)
            .map(|s| s.id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for Index<T> {
    fn default() -> Self {
        Index::new()
    }
}

/// Double the table. Live handles occupy distinct `id & (cap-1)` positions,
/// so in the doubled table `id & (2cap-1)` sends them to distinct slots;
/// vacant slots are not copied.
fn expand<T>(inner: &mut Inner<T>) {
    let cap = inner.slots.len() * 2;
    let mask = cap as Handle - 1;
    let mut slots: Vec<Slot<T>> = Vec::with_capacity(cap);
    slots.resize_with(cap, Slot::vacant);
    for old in inner.slots.drain(..) {
        if old.id != 0 {
            let at = (old.id & mask) as usize;
            slots[at] = old;
        }
    }
    inner.slots = slots;
}
