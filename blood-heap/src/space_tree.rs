//! Address index.
//!
//! A trie over the bytes of an address, most significant byte first, with a
//! fan-out of 256 and a depth of at most the pointer width in bytes. A slot
//! is empty, a branch to the next level, or a leaf naming the region that
//! owns every address under it. Lookup therefore costs at most one load per
//! address byte regardless of how many regions exist.
//!
//! ```text
//!  addr = 0x00007f3a_12345678
//!  root[0x00] -> [0x00] -> [0x7f] -> [0x3a] -> [0x12] -> leaf(Space)
//! ```
//!
//! Mutations are serialised by the index lock. Lookups take no lock: slots
//! are `crossbeam-epoch` atomics and unlinked nodes are reclaimed only once
//! every pinned reader has finished, so a concurrent lookup sees either the
//! old or the new state, never freed memory. A reader must still only ask
//! about addresses in regions it knows to be live.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use parking_lot::Mutex;

use crate::error::{invariant, MemError, MemResult};
use crate::space::Space;
use crate::Address;

const FANOUT: usize = 256;

/// Shift that brings the most significant byte down to the bottom.
const SHIFT: u32 = usize::BITS - 8;

enum Entry {
    Branch(Node),
    Leaf(Arc<Space>),
}

struct Node {
    slots: Box<[Atomic<Entry>]>,
}

impl Node {
    fn new() -> MemResult<Self> {
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(FANOUT)
            .map_err(|_| MemError::OutOfMemory { what: "address index node" })?;
        slots.extend((0..FANOUT).map(|_| Atomic::null()));
        Ok(Self { slots: slots.into_boxed_slice() })
    }

    fn is_empty(&self, guard: &Guard) -> bool {
        self.slots
            .iter()
            .all(|slot| slot.load(Ordering::Acquire, guard).is_null())
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        // SAFETY: we have exclusive access, and anything still linked here
        // has not been handed to the epoch collector.
        unsafe {
            let guard = epoch::unprotected();
            for slot in self.slots.iter() {
                let entry = slot.swap(Shared::null(), Ordering::Relaxed, guard);
                if !entry.is_null() {
                    drop(entry.into_owned());
                }
            }
        }
    }
}

/// The address index.
pub struct SpaceTree {
    root: Node,
    lock: Mutex<()>,
    nodes: AtomicUsize,
}

impl SpaceTree {
    /// Create an empty index.
    pub fn new() -> MemResult<Self> {
        Ok(Self {
            root: Node::new()?,
            lock: Mutex::new(()),
            nodes: AtomicUsize::new(0),
        })
    }

    /// Register `[start, end)` as owned by `space`.
    ///
    /// On failure any partially installed entries are removed again, leaving
    /// the index exactly as it was.
    pub fn insert(&self, space: &Arc<Space>, start: Address, end: Address) -> MemResult<()> {
        check_range(start, end)?;
        let _lock = self.lock.lock();
        let guard = epoch::pin();
        if let Err(err) = self.add_range(&self.root, space, start, end, &guard) {
            let _ = self.remove_range(&self.root, space, start, end, &guard);
            return Err(err);
        }
        Ok(())
    }

    /// Remove `[start, end)`, which must have been registered for `space`.
    pub fn remove(&self, space: &Arc<Space>, start: Address, end: Address) -> MemResult<()> {
        check_range(start, end)?;
        let _lock = self.lock.lock();
        let guard = epoch::pin();
        self.remove_range(&self.root, space, start, end, &guard)
    }

    /// Hand `[start, end)` over from `old` to `new` in place.
    ///
    /// Every entry is checked before any is changed, so on failure the range
    /// still resolves to `old`. No nodes are allocated or freed, and a
    /// concurrent lookup finds one region or the other.
    pub fn replace(&self, old: &Arc<Space>, new: &Arc<Space>, start: Address, end: Address) -> MemResult<()> {
        check_range(start, end)?;
        let _lock = self.lock.lock();
        let guard = epoch::pin();
        let check = Handover { old, new, commit: false };
        self.replace_range(&self.root, &check, start, end, &guard)?;
        let commit = Handover { commit: true, ..check };
        self.replace_range(&self.root, &commit, start, end, &guard)
    }

    /// Find the region owning `addr`.
    pub fn lookup(&self, addr: Address) -> Option<Arc<Space>> {
        let guard = epoch::pin();
        let mut slots: &[Atomic<Entry>] = &self.root.slots;
        let mut key = addr;
        loop {
            let entry = slots[key >> SHIFT].load(Ordering::Acquire, &guard);
            // SAFETY: entries are reclaimed only after every reader pinned
            // before their removal has unpinned.
            match unsafe { entry.as_ref() }? {
                Entry::Leaf(space) => return Some(Arc::clone(space)),
                Entry::Branch(node) => {
                    slots = &node.slots;
                    key <<= 8;
                }
            }
        }
    }

    /// Number of interior nodes below the root.
    pub fn node_count(&self) -> usize {
        self.nodes.load(Ordering::Relaxed)
    }

    fn add_range(
        &self,
        node: &Node,
        space: &Arc<Space>,
        start: usize,
        end: usize,
        guard: &Guard,
    ) -> MemResult<()> {
        let mut r = start >> SHIFT;
        // An end of zero means the range runs to the end of this slot's span.
        let s = if end == 0 { FANOUT } else { end >> SHIFT };
        debug_assert!(r < FANOUT && s >= r);

        if r == s {
            return self.add_in_slot(&node.slots[r], space, start << 8, end << 8, guard);
        }

        if r << SHIFT != start {
            self.add_in_slot(&node.slots[r], space, start << 8, 0, guard)?;
            r += 1;
        }

        while r < s {
            let slot = &node.slots[r];
            if !slot.load(Ordering::Acquire, guard).is_null() {
                return Err(invariant("address range overlaps a registered region"));
            }
            slot.store(Owned::new(Entry::Leaf(Arc::clone(space))), Ordering::Release);
            r += 1;
        }

        if end != 0 && s << SHIFT != end {
            self.add_in_slot(&node.slots[s], space, 0, end << 8, guard)?;
        }
        Ok(())
    }

    fn add_in_slot(
        &self,
        slot: &Atomic<Entry>,
        space: &Arc<Space>,
        start: usize,
        end: usize,
        guard: &Guard,
    ) -> MemResult<()> {
        let mut current = slot.load(Ordering::Acquire, guard);
        if current.is_null() {
            let branch = Owned::new(Entry::Branch(Node::new()?)).into_shared(guard);
            slot.store(branch, Ordering::Release);
            self.nodes.fetch_add(1, Ordering::Relaxed);
            current = branch;
        }
        // SAFETY: only the lock holder unlinks entries, and that is us.
        match unsafe { current.as_ref() } {
            Some(Entry::Branch(child)) => self.add_range(child, space, start, end, guard),
            _ => Err(invariant("address range overlaps a registered region")),
        }
    }

    fn remove_range(
        &self,
        node: &Node,
        space: &Arc<Space>,
        start: usize,
        end: usize,
        guard: &Guard,
    ) -> MemResult<()> {
        let mut r = start >> SHIFT;
        let s = if end == 0 { FANOUT } else { end >> SHIFT };

        if r == s {
            return self.remove_in_slot(&node.slots[r], space, start << 8, end << 8, guard);
        }

        if r << SHIFT != start {
            self.remove_in_slot(&node.slots[r], space, start << 8, 0, guard)?;
            r += 1;
        }

        while r < s {
            let slot = &node.slots[r];
            let current = slot.load(Ordering::Acquire, guard);
            // SAFETY: as in add_in_slot.
            match unsafe { current.as_ref() } {
                // Only reachable while unwinding a partial insert.
                None => {}
                Some(Entry::Leaf(owner)) if Arc::ptr_eq(owner, space) => {
                    slot.store(Shared::null(), Ordering::Release);
                    // SAFETY: unlinked above; readers may still hold it.
                    unsafe { guard.defer_destroy(current) };
                }
                Some(_) => {
                    return Err(invariant("address index entry belongs to another region"));
                }
            }
            r += 1;
        }

        if end != 0 && s << SHIFT != end {
            self.remove_in_slot(&node.slots[s], space, 0, end << 8, guard)?;
        }
        Ok(())
    }

    fn remove_in_slot(
        &self,
        slot: &Atomic<Entry>,
        space: &Arc<Space>,
        start: usize,
        end: usize,
        guard: &Guard,
    ) -> MemResult<()> {
        let current = slot.load(Ordering::Acquire, guard);
        // SAFETY: as in add_in_slot.
        match unsafe { current.as_ref() } {
            None => Ok(()),
            Some(Entry::Branch(child)) => {
                let result = self.remove_range(child, space, start, end, guard);
                if child.is_empty(guard) {
                    slot.store(Shared::null(), Ordering::Release);
                    self.nodes.fetch_sub(1, Ordering::Relaxed);
                    // SAFETY: unlinked above; readers may still hold it.
                    unsafe { guard.defer_destroy(current) };
                }
                result
            }
            Some(Entry::Leaf(_)) => Err(invariant("partial range removal hit a whole-slot entry")),
        }
    }

    fn replace_range(
        &self,
        node: &Node,
        handover: &Handover<'_>,
        start: usize,
        end: usize,
        guard: &Guard,
    ) -> MemResult<()> {
        let mut r = start >> SHIFT;
        let s = if end == 0 { FANOUT } else { end >> SHIFT };

        if r == s {
            return self.replace_in_slot(&node.slots[r], handover, start << 8, end << 8, guard);
        }

        if r << SHIFT != start {
            self.replace_in_slot(&node.slots[r], handover, start << 8, 0, guard)?;
            r += 1;
        }

        while r < s {
            let slot = &node.slots[r];
            let current = slot.load(Ordering::Acquire, guard);
            // SAFETY: as in add_in_slot.
            match unsafe { current.as_ref() } {
                Some(Entry::Leaf(owner)) if Arc::ptr_eq(owner, handover.old) => {
                    if handover.commit {
                        slot.store(Owned::new(Entry::Leaf(Arc::clone(handover.new))), Ordering::Release);
                        // SAFETY: unlinked above; readers may still hold it.
                        unsafe { guard.defer_destroy(current) };
                    }
                }
                _ => return Err(not_owned(r)),
            }
            r += 1;
        }

        if end != 0 && s << SHIFT != end {
            self.replace_in_slot(&node.slots[s], handover, 0, end << 8, guard)?;
        }
        Ok(())
    }

    fn replace_in_slot(
        &self,
        slot: &Atomic<Entry>,
        handover: &Handover<'_>,
        start: usize,
        end: usize,
        guard: &Guard,
    ) -> MemResult<()> {
        // SAFETY: as in add_in_slot.
        match unsafe { slot.load(Ordering::Acquire, guard).as_ref() } {
            Some(Entry::Branch(child)) => self.replace_range(child, handover, start, end, guard),
            _ => Err(not_owned(start >> SHIFT)),
        }
    }
}

/// Owners for [`SpaceTree::replace`]; with `commit` unset only checks.
struct Handover<'a> {
    old: &'a Arc<Space>,
    new: &'a Arc<Space>,
    commit: bool,
}

fn not_owned(slot: usize) -> MemError {
    MemError::InvariantViolation(format!(
        "address index slot {:#x} does not belong to the replaced region",
        slot
    ))
}

fn check_range(start: Address, end: Address) -> MemResult<()> {
    if start >= end {
        return Err(MemError::InvariantViolation(format!(
            "empty address range {:#x}..{:#x}",
            start, end
        )));
    }
    Ok(())
}

impl fmt::Debug for SpaceTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpaceTree")
            .field("nodes", &self.node_count())
            .finish()
    }
}
