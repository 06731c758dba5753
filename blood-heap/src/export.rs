//! Region table handed to snapshot writers.
//!
//! A writer lays the regions out one after another in the image. The table
//! lists them in that order; [`MemoryTable::classify`] maps a heap address to
//! the entry holding it and [`MemoryTable::image_offset`] to its position in
//! the image.

use std::sync::Arc;

use crate::memmgr::MemMgr;
use crate::space::{Space, SpaceFlags, SpaceType};
use crate::Address;

/// One region as seen by a snapshot writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemTableEntry {
    /// Address of the region in the running heap.
    pub address: Address,
    /// Length in bytes. For an export region, only the populated part.
    pub length: usize,
    /// Region flags.
    pub flags: SpaceFlags,
    /// Region index.
    pub index: u32,
}

impl MemTableEntry {
    fn from_space(space: &Space) -> Self {
        let end = match (space.kind(), space.permanent()) {
            (SpaceType::Export, Some(state)) => state.top_pointer(),
            _ => space.top(),
        };
        Self {
            address: space.bottom(),
            length: end - space.bottom(),
            flags: space.flags(),
            index: space.index(),
        }
    }

    /// Whether `addr` lies inside the entry.
    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.address && addr < self.address + self.length
    }
}

/// Ordered region table plus the root object of the snapshot.
#[derive(Debug)]
pub struct MemoryTable<'a> {
    heap: &'a MemMgr,
    entries: Vec<MemTableEntry>,
    root: Address,
}

impl<'a> MemoryTable<'a> {
    /// Build a table over `spaces`, in the given order.
    pub fn from_spaces(heap: &'a MemMgr, spaces: &[Arc<Space>], root: Address) -> Self {
        Self {
            heap,
            entries: spaces.iter().map(|s| MemTableEntry::from_space(s)).collect(),
            root,
        }
    }

    /// The entries in image order.
    pub fn entries(&self) -> &[MemTableEntry] {
        &self.entries
    }

    /// The root object.
    pub fn root(&self) -> Address {
        self.root
    }

    /// The position of the entry holding `addr` and the byte offset of
    /// `addr` within it.
    ///
    /// The owning region is found through the address index, so this costs
    /// the same whatever the size of the table.
    pub fn classify(&self, addr: Address) -> Option<(usize, usize)> {
        let space = self.heap.space_for_address(addr)?;
        let bottom = space.bottom();
        let pos = self.entries.iter().position(|e| e.address == bottom)?;
        let entry = &self.entries[pos];
        entry.contains(addr).then_some((pos, addr - entry.address))
    }

    /// Byte offset of `addr` in an image that stores the entries back to
    /// back in table order.
    pub fn image_offset(&self, addr: Address) -> Option<usize> {
        let (pos, offset) = self.classify(addr)?;
        let preceding: usize = self.entries[..pos].iter().map(|e| e.length).sum();
        Some(preceding + offset)
    }
}

impl MemMgr {
    /// Table over the export regions of the snapshot in progress.
    pub fn export_table(&self, root: Address) -> MemoryTable<'_> {
        MemoryTable::from_spaces(self, &self.export_spaces(), root)
    }
}
