//! # Snapshot Layering
//!
//! Persisted snapshots are layered: a snapshot at hierarchy level `L` may
//! refer to anything in levels below `L`, and replacing level `L` discards
//! every level at or above it. Level 0 is the initial heap and always stays.
//!
//! ```text
//!   level 2   ┌────────┐
//!   level 1   ├────────┤ ┌────────┐     promote(1): levels ≥ 1 become
//!   level 0   └────────┘ └────────┘     local/code; exports become level 1
//!             permanent    export
//! ```
//!
//! Regions that leave the permanent set are not copied: a data region
//! becomes a full local region whose contents count as old generation, and
//! a code region becomes a code region with its header map rebuilt. The
//! collector reclaims whatever is no longer reachable.
//!
//! None of these operations lock anything beyond the catalog containers;
//! the caller must have stopped all allocation and collection.

use std::sync::Arc;

use tracing::debug;

use crate::error::{MemError, MemResult};
use crate::memmgr::{reserve_slot, MemMgr};
use crate::object::{fill_unused_space, ObjectModel};
use crate::osmem::Permissions;
use crate::space::{Space, SpaceFlags, SpaceType};
use crate::{Address, WORD};

impl MemMgr {
    /// Register a permanent region over memory supplied by the caller, as
    /// the snapshot importer does for every region it reconstructs.
    ///
    /// `index` and `hierarchy` are the values the region had when it was
    /// exported. The memory is not unmapped by the manager.
    pub fn new_permanent_space(
        &self,
        base: Address,
        words: usize,
        flags: SpaceFlags,
        index: u32,
        hierarchy: u32,
    ) -> MemResult<Arc<Space>> {
        if words == 0 {
            return Err(MemError::InvariantViolation(format!(
                "empty permanent space {} at {:#x}",
                index, base
            )));
        }
        let space = Arc::new(Space::new_permanent(
            SpaceType::Permanent,
            base,
            base + words * WORD,
            flags,
            index,
            hierarchy,
            false,
        ));
        let mut permanent = self.permanent_spaces.write();
        reserve_slot(&mut permanent)?;
        self.register(&space)?;
        permanent.push(Arc::clone(&space));
        self.reserve_index(index);
        debug!(
            "New permanent space {} at {:#x}..{:#x}, level {}",
            index,
            space.bottom(),
            space.top(),
            hierarchy
        );
        Ok(space)
    }

    /// Map an export region of at least `words` words for a snapshot in
    /// progress. The region is empty: its `top_pointer` is at the bottom.
    pub fn new_export_space(
        &self,
        words: usize,
        mutable: bool,
        no_overwrite: bool,
        code: bool,
    ) -> MemResult<Arc<Space>> {
        let perms = if code { self.code_permissions() } else { Permissions::READ_WRITE };
        let mapping = self.map_words(words, perms)?;

        let mut flags = SpaceFlags::empty();
        flags.set(SpaceFlags::WRITEABLE, mutable);
        flags.set(SpaceFlags::NO_OVERWRITE, no_overwrite);
        flags.set(SpaceFlags::EXECUTABLE, code);
        let index = self.allocate_index();
        let space = Arc::new(Space::new_permanent(
            SpaceType::Export,
            mapping.base,
            mapping.end(),
            flags,
            index,
            0,
            true,
        ));

        let mut exports = self.export_spaces.write();
        let registered = reserve_slot(&mut exports).and_then(|()| self.register(&space));
        if let Err(err) = registered {
            self.unmap(mapping);
            return Err(err);
        }
        exports.push(Arc::clone(&space));
        debug!(
            "New export space {} at {:#x}..{:#x}",
            index,
            space.bottom(),
            space.top()
        );
        Ok(space)
    }

    /// Drop every export region of an abandoned or finished export.
    pub fn delete_export_spaces(&self) -> MemResult<()> {
        let mut exports = self.export_spaces.write();
        while let Some(space) = exports.pop() {
            if let Err(err) = self.unregister(&space) {
                exports.push(space);
                return Err(err);
            }
            self.release(&space);
        }
        Ok(())
    }

    /// Commit the export regions as permanent regions at `level`.
    ///
    /// Every permanent region at `level` or above is first turned back into
    /// a local or code region. Export regions have their unused tail filled
    /// so that they are tiled end to end.
    pub fn promote_export_spaces(&self, level: u32) -> MemResult<()> {
        let mut permanent = self.permanent_spaces.write();
        let mut exports = self.export_spaces.write();

        let mut kept = Vec::new();
        kept.try_reserve(permanent.len() + exports.len())
            .map_err(|_| MemError::OutOfMemory { what: "region table" })?;

        let mut old = std::mem::take(&mut *permanent).into_iter();
        while let Some(space) = old.next() {
            if space.hierarchy() < level {
                kept.push(space);
                continue;
            }
            if let Err(err) = self.demote_permanent(&space) {
                debug!("Unable to demote permanent space {}: {}", space.index(), err);
                kept.push(space);
                kept.extend(old);
                *permanent = kept;
                return Err(err);
            }
        }

        for space in exports.drain(..) {
            if let Some(state) = space.permanent() {
                let top_pointer = state.top_pointer();
                if top_pointer < space.top() {
                    // SAFETY: the tail above the high-water mark is unused
                    // memory owned by the region.
                    unsafe {
                        fill_unused_space(self.model(), top_pointer, (space.top() - top_pointer) / WORD)
                    };
                    state.set_top_pointer(space.top());
                }
            }
            space.set_hierarchy(level);
            space.set_kind(SpaceType::Permanent);
            debug!("Export space {} is now permanent at level {}", space.index(), level);
            kept.push(space);
        }

        *permanent = kept;
        Ok(())
    }

    /// Turn every permanent region above level 0 back into local or code
    /// regions, before loading a new layer on top of the current state.
    pub fn demote_import_spaces(&self) -> MemResult<()> {
        self.promote_export_spaces(1)
    }

    /// The permanent region with the given index.
    pub fn space_for_index(&self, index: u32) -> Option<Arc<Space>> {
        self.permanent_spaces
            .read()
            .iter()
            .find(|space| space.index() == index)
            .cloned()
    }

    /// Replace a permanent region by a local or code region over the same
    /// memory. On failure the permanent region is left registered.
    fn demote_permanent(&self, old: &Arc<Space>) -> MemResult<()> {
        let bottom = old.bottom();
        let top = old.top();

        if old.is_code() {
            let space = Arc::new(Space::new_code(bottom, top, old.index())?);
            space.set_owns_mapping(old.owns_mapping());
            // SAFETY: the caller guarantees exclusive access to the region.
            unsafe { restore_length_words(self.model(), bottom, top) };
            self.rebuild_header_map(&space)?;

            self.replace_with_code_space(old, space)?;
            debug!("Converted permanent space {} into a code space", old.index());
        } else {
            let space = Arc::new(Space::new_full_local(bottom, top, old.is_mutable(), old.index())?);
            space.set_owns_mapping(old.owns_mapping());

            self.replace_with_local_space(old, space)?;
            debug!(
                "Converted permanent space {} into a local {}mutable space",
                old.index(),
                if old.is_mutable() { "" } else { "im" }
            );
        }
        Ok(())
    }
}

/// Replace tombstones left by a collection with the length word of the
/// object they point at, so the region can be walked by length alone.
unsafe fn restore_length_words(model: &dyn ObjectModel, bottom: Address, top: Address) {
    let mut ptr = bottom;
    while ptr < top {
        let obj = ptr + WORD;
        let mut word = model.length_word(obj);
        if word.is_forwarded() {
            word = model.length_word(model.follow_forwarding_chain(obj));
            model.set_length_word(obj, word);
        }
        ptr += (word.length() + 1) * WORD;
    }
}
