//! Environment frames
//!
//! One frame per binding construct (`let`, `with`, lambda application).
//! A frame owns a fixed slot array; the slot count is pinned at allocation
//! by the boxed slice, which is what lets the environment hasher walk
//! parent chains purely by content, with no allocator involvement.
//!
//! Slots are write-once: recursive scopes allocate the frame first and fill
//! the slots with thunks that capture it.

use std::sync::{Arc, OnceLock};

use crate::value::ValuePtr;

/// What kind of scope allocated the frame. `with` frames hold their
/// attribute set as a single slot-0 thunk and are searched by name during
/// dynamic lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvKind {
    Plain,
    With,
}

#[derive(Debug)]
pub struct Env {
    up: Option<Arc<Env>>,
    kind: EnvKind,
    slots: Box<[OnceLock<ValuePtr>]>,
}

impl Env {
    pub fn new(up: Option<Arc<Env>>, size: usize) -> Arc<Env> {
        let mut slots = Vec::with_capacity(size);
        slots.resize_with(size, OnceLock::new);
        Arc::new(Env {
            up,
            kind: EnvKind::Plain,
            slots: slots.into_boxed_slice(),
        })
    }

    pub fn root(size: usize) -> Arc<Env> {
        Env::new(None, size)
    }

    /// A `with` frame: slot 0 holds the (usually unevaluated) attribute
    /// set the scope exposes.
    pub fn with_scope(up: Arc<Env>, attrs: ValuePtr) -> Arc<Env> {
        let slots: Box<[OnceLock<ValuePtr>]> = Box::new([OnceLock::new()]);
        let _ = slots[0].set(attrs);
        Arc::new(Env {
            up: Some(up),
            kind: EnvKind::With,
            slots,
        })
    }

    pub fn up(&self) -> Option<&Arc<Env>> {
        self.up.as_ref()
    }

    pub fn kind(&self) -> EnvKind {
        self.kind
    }

    /// Slot count, fixed at allocation.
    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// Fill a slot. Returns false if the slot was already set.
    pub fn set_slot(&self, displ: usize, value: ValuePtr) -> bool {
        self.slots
            .get(displ)
            .map(|slot| slot.set(value).is_ok())
            .unwrap_or(false)
    }

    pub fn slot(&self, displ: usize) -> Option<&ValuePtr> {
        self.slots.get(displ).and_then(|slot| slot.get())
    }

    /// Walk `level` frames up the chain.
    pub fn ancestor(self: &Arc<Env>, level: u32) -> Option<Arc<Env>> {
        let mut cur = self.clone();
        for _ in 0..level {
            cur = cur.up.as_ref()?.clone();
        }
        Some(cur)
    }
}
