//! # Heap-Region Manager
//!
//! [`MemMgr`] owns every region of the heap. Each region lives in exactly one
//! catalog list for its kind and, while registered, in the address index.
//! Creation maps first and registers second; destruction unregisters from
//! the index first, then drops the catalog entry, then unmaps, so a
//! concurrent lookup either finds a live region or finds nothing.
//!
//! ## Locks
//!
//! | Lock | Guards |
//! |------|--------|
//! | allocation | local list, nursery cursor, occupancy counters |
//! | code space | code list, `first_free`/`largest_free`, header maps |
//! | stack space | stack list and stack bounds |
//! | index | the address index (inside [`SpaceTree`]) |
//! | bitmap | lazy creation of permanent-region profile maps |
//!
//! The permanent and export lists sit behind `RwLock`s only so the type is
//! `Sync`; promotion, demotion and the export lifecycle expect the caller to
//! have stopped every other thread.
//!
//! ## Nursery allocation
//!
//! Requests are spread over the nursery regions round robin so that the
//! most recently allocated (and most likely to survive) objects are not all
//! in one region when a parallel minor collection starts. The cursor is used
//! and then advanced modulo the nursery count; the first request after
//! start-up goes to the first nursery.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::HeapConfig;
use crate::error::{invariant, MemError, MemResult};
use crate::object::{ObjectModel, StandardObjectModel};
use crate::osmem::{Mapping, OsMemory, Permissions, SystemMemory};
use crate::space::{Space, SpaceType};
use crate::space_tree::SpaceTree;
use crate::{Address, WORD};

/// A span handed out by [`MemMgr::alloc_heap_space`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapSpan {
    /// First word of the span.
    pub start: Address,
    /// Length in words.
    pub words: usize,
}

impl HeapSpan {
    /// One past the last byte of the span.
    pub fn end(&self) -> Address {
        self.start + self.words * WORD
    }
}

/// Heap size counters, in words.
#[derive(Debug, Default)]
pub struct HeapStats {
    /// Total size of all local regions.
    pub total_heap_words: AtomicUsize,
    /// Total size of all nursery regions.
    pub alloc_space_words: AtomicUsize,
    /// Free words in nursery regions. Refreshed whenever the manager changes
    /// the nursery; a collector resetting allocation pointers must call
    /// [`MemMgr::get_free_alloc_space`] afterwards.
    pub alloc_free_words: AtomicUsize,
    /// Total size of all code regions.
    pub code_space_words: AtomicUsize,
    /// Total size of all stack regions.
    pub stack_space_words: AtomicUsize,
}

/// Heap occupancy at one point of a collection, in words.
#[derive(Debug, Clone, PartialEq)]
pub struct HeapReport {
    /// Label given by the caller, e.g. "before" or "after".
    pub phase: String,
    /// Words in use in non-nursery local regions.
    pub major_used: usize,
    /// Size of non-nursery local regions.
    pub major_size: usize,
    /// Words in use in nursery regions.
    pub alloc_used: usize,
    /// Size of nursery regions.
    pub alloc_size: usize,
    /// Size of code regions.
    pub code_size: usize,
    /// Size of stack regions.
    pub stack_size: usize,
    /// Size of permanent regions.
    pub permanent_size: usize,
    /// Configured heap size, zero if unlimited.
    pub heap_limit: usize,
}

impl HeapReport {
    /// Percentage of the major heap in use.
    pub fn major_percent(&self) -> f64 {
        percent(self.major_used, self.major_size)
    }

    /// Percentage of the nursery in use.
    pub fn alloc_percent(&self) -> f64 {
        percent(self.alloc_used, self.alloc_size)
    }
}

fn percent(used: usize, size: usize) -> f64 {
    if size == 0 {
        0.0
    } else {
        used as f64 / size as f64 * 100.0
    }
}

/// The local region list and the counters that go with it.
#[derive(Debug, Default)]
pub(crate) struct LocalSpaces {
    /// Ordered: immutable, then mutable non-nursery, then nursery.
    pub(crate) spaces: Vec<Arc<Space>>,
    next_allocator: usize,
    current_alloc_space: usize,
    current_heap_size: usize,
}

impl LocalSpaces {
    fn nursery_start(&self) -> usize {
        self.spaces
            .iter()
            .position(|s| s.is_nursery())
            .unwrap_or(self.spaces.len())
    }

    fn nurseries(&self) -> &[Arc<Space>] {
        &self.spaces[self.nursery_start()..]
    }

    fn nursery_free(&self) -> usize {
        self.nurseries().iter().map(|s| s.free_space()).sum()
    }

    fn position(&self, space: &Arc<Space>) -> Option<usize> {
        self.spaces.iter().position(|s| Arc::ptr_eq(s, space))
    }
}

fn local_rank(space: &Space) -> u8 {
    if space.is_nursery() {
        2
    } else if space.is_mutable() {
        1
    } else {
        0
    }
}

/// Insert keeping the immutable / mutable / nursery ordering. The caller has
/// reserved room.
fn insert_ordered(spaces: &mut Vec<Arc<Space>>, space: Arc<Space>) {
    let rank = local_rank(&space);
    let pos = spaces
        .iter()
        .position(|s| local_rank(s) > rank)
        .unwrap_or(spaces.len());
    spaces.insert(pos, space);
}

/// Reserve room for one more entry in a catalog list.
pub(crate) fn reserve_slot(list: &mut Vec<Arc<Space>>) -> MemResult<()> {
    list.try_reserve(1)
        .map_err(|_| MemError::OutOfMemory { what: "region table" })
}

/// The heap-region manager.
pub struct MemMgr {
    config: HeapConfig,
    os: Arc<dyn OsMemory>,
    model: Box<dyn ObjectModel>,
    tree: SpaceTree,
    pub(crate) locals: Mutex<LocalSpaces>,
    pub(crate) code_spaces: Mutex<Vec<Arc<Space>>>,
    pub(crate) stack_spaces: Mutex<Vec<Arc<Space>>>,
    pub(crate) permanent_spaces: RwLock<Vec<Arc<Space>>>,
    pub(crate) export_spaces: RwLock<Vec<Arc<Space>>>,
    pub(crate) bitmap_lock: Mutex<()>,
    next_index: AtomicU32,
    stats: HeapStats,
}

impl MemMgr {
    /// Create a manager with no regions.
    pub fn new(config: HeapConfig, os: Arc<dyn OsMemory>, model: Box<dyn ObjectModel>) -> MemResult<Self> {
        Ok(Self {
            config,
            os,
            model,
            tree: SpaceTree::new()?,
            locals: Mutex::new(LocalSpaces::default()),
            code_spaces: Mutex::new(Vec::new()),
            stack_spaces: Mutex::new(Vec::new()),
            permanent_spaces: RwLock::new(Vec::new()),
            export_spaces: RwLock::new(Vec::new()),
            bitmap_lock: Mutex::new(()),
            next_index: AtomicU32::new(0),
            stats: HeapStats::default(),
        })
    }

    /// Create a manager over system memory and the standard object layout.
    pub fn with_defaults(config: HeapConfig) -> MemResult<Self> {
        Self::new(config, Arc::new(SystemMemory::new()), Box::new(StandardObjectModel))
    }

    /// The configuration.
    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    /// The OS mapper.
    pub fn os(&self) -> &dyn OsMemory {
        self.os.as_ref()
    }

    /// The object model.
    pub fn model(&self) -> &dyn ObjectModel {
        self.model.as_ref()
    }

    /// The address index.
    pub fn index(&self) -> &SpaceTree {
        &self.tree
    }

    /// Size counters.
    pub fn stats(&self) -> &HeapStats {
        &self.stats
    }

    // Registration and mapping helpers shared by the region kinds.

    pub(crate) fn register(&self, space: &Arc<Space>) -> MemResult<()> {
        self.tree.insert(space, space.bottom(), space.top())
    }

    /// Register `space`, or hand the range of `previous` over to it when it
    /// covers the same memory.
    pub(crate) fn register_in_place_of(&self, space: &Arc<Space>, previous: Option<&Arc<Space>>) -> MemResult<()> {
        match previous {
            Some(old) => self.tree.replace(old, space, space.bottom(), space.top()),
            None => self.register(space),
        }
    }

    pub(crate) fn unregister(&self, space: &Arc<Space>) -> MemResult<()> {
        self.tree.remove(space, space.bottom(), space.top())
    }

    pub(crate) fn map_words(&self, words: usize, perms: Permissions) -> MemResult<Mapping> {
        let bytes = words
            .checked_mul(WORD)
            .ok_or(MemError::OutOfMemory { what: "region" })?;
        self.os.map(bytes, perms)
    }

    pub(crate) fn unmap(&self, mapping: Mapping) {
        // SAFETY: callers only pass mappings they obtained from `self.os`
        // that are no longer reachable through the index.
        if let Err(err) = unsafe { self.os.unmap(mapping.base, mapping.size) } {
            warn!("Failed to release {:#x} ({} bytes): {}", mapping.base, mapping.size, err);
        }
    }

    /// Unmap a region that has already been unregistered.
    pub(crate) fn release(&self, space: &Space) {
        if space.owns_mapping() {
            self.unmap(Mapping { base: space.bottom(), size: space.size_bytes() });
        }
    }

    pub(crate) fn code_permissions(&self) -> Permissions {
        if self.config.executable_code {
            Permissions::ALL
        } else {
            Permissions::READ_WRITE
        }
    }

    pub(crate) fn allocate_index(&self) -> u32 {
        self.next_index.fetch_add(1, Ordering::Relaxed)
    }

    /// Keep the next index above `index`.
    pub(crate) fn reserve_index(&self, index: u32) {
        self.next_index.fetch_max(index.saturating_add(1), Ordering::Relaxed);
    }

    /// Size of a default nursery once rounded to whole pages.
    fn default_nursery_words(&self) -> usize {
        self.os.round_up(self.config.default_space_size * WORD) / WORD
    }

    // Lookup

    /// The region owning `addr`, if any.
    ///
    /// Only ask about addresses in regions known to be live.
    pub fn space_for_address(&self, addr: Address) -> Option<Arc<Space>> {
        self.tree.lookup(addr)
    }

    /// The local region owning `addr`, if any.
    pub fn local_space_for_address(&self, addr: Address) -> Option<Arc<Space>> {
        self.tree
            .lookup(addr)
            .filter(|space| space.kind() == SpaceType::Local)
    }

    // Catalog snapshots

    /// All local regions in collection order.
    pub fn local_spaces(&self) -> Vec<Arc<Space>> {
        self.locals.lock().spaces.clone()
    }

    /// Nursery regions in round-robin order.
    pub fn nursery_spaces(&self) -> Vec<Arc<Space>> {
        self.locals.lock().nurseries().to_vec()
    }

    /// Code regions in creation order.
    pub fn code_spaces(&self) -> Vec<Arc<Space>> {
        self.code_spaces.lock().clone()
    }

    /// Stack regions.
    pub fn stack_spaces(&self) -> Vec<Arc<Space>> {
        self.stack_spaces.lock().clone()
    }

    /// Permanent regions.
    pub fn permanent_spaces(&self) -> Vec<Arc<Space>> {
        self.permanent_spaces.read().clone()
    }

    /// Export regions of the snapshot in progress.
    pub fn export_spaces(&self) -> Vec<Arc<Space>> {
        self.export_spaces.read().clone()
    }

    /// Total size of local regions in words.
    pub fn current_heap_size(&self) -> usize {
        self.locals.lock().current_heap_size
    }

    /// Total size of nursery regions in words.
    pub fn current_alloc_space(&self) -> usize {
        self.locals.lock().current_alloc_space
    }

    // Local regions

    /// Create a local region of at least `words` words and register it.
    pub fn new_local_space(&self, words: usize, mutable: bool) -> MemResult<Arc<Space>> {
        let mut locals = self.locals.lock();
        self.create_local_locked(&mut locals, words, mutable, false)
    }

    /// Create a nursery region of at least `words` words and register it.
    pub fn create_allocation_space(&self, words: usize) -> MemResult<Arc<Space>> {
        let mut locals = self.locals.lock();
        self.create_local_locked(&mut locals, words, true, true)
    }

    fn create_local_locked(
        &self,
        locals: &mut LocalSpaces,
        words: usize,
        mutable: bool,
        nursery: bool,
    ) -> MemResult<Arc<Space>> {
        // Hold the reserve while mapping so that it stays obtainable for
        // native stacks and the native heap.
        let reservation = if self.config.reserved_space != 0 {
            match self.map_words(self.config.reserved_space, Permissions::READ) {
                Ok(mapping) => Some(mapping),
                Err(err) => {
                    debug!("New local space: insufficient reservation space: {}", err);
                    return Err(err);
                }
            }
        } else {
            None
        };

        let result = self.map_local(words, mutable, nursery);
        if let Some(mapping) = reservation {
            self.unmap(mapping);
        }
        let space = match result {
            Ok(space) => space,
            Err(err) => {
                debug!("New local space of {} words failed: {}", words, err);
                return Err(err);
            }
        };

        if let Err(err) = self.add_local_locked(locals, Arc::clone(&space), None) {
            self.release(&space);
            return Err(err);
        }

        debug!(
            "New local {}mutable {}space at {:#x}..{:#x} ({} words)",
            if mutable { "" } else { "im" },
            if nursery { "allocation " } else { "" },
            space.bottom(),
            space.top(),
            space.size_words()
        );
        Ok(space)
    }

    fn map_local(&self, words: usize, mutable: bool, nursery: bool) -> MemResult<Arc<Space>> {
        let mapping = self.map_words(words, Permissions::READ_WRITE)?;
        match Space::new_local(mapping.base, mapping.end(), mutable, nursery) {
            Ok(space) => Ok(Arc::new(space)),
            Err(err) => {
                self.unmap(mapping);
                Err(err)
            }
        }
    }

    /// Insert a local region that takes over the memory of `old`, which
    /// stays registered if this fails.
    pub(crate) fn replace_with_local_space(&self, old: &Arc<Space>, space: Arc<Space>) -> MemResult<()> {
        let mut locals = self.locals.lock();
        self.add_local_locked(&mut locals, space, Some(old))
    }

    fn add_local_locked(
        &self,
        locals: &mut LocalSpaces,
        space: Arc<Space>,
        previous: Option<&Arc<Space>>,
    ) -> MemResult<()> {
        reserve_slot(&mut locals.spaces)?;
        self.register_in_place_of(&space, previous)?;

        let words = space.size_words();
        locals.current_heap_size += words;
        self.stats.total_heap_words.fetch_add(words, Ordering::Relaxed);
        if space.is_nursery() {
            locals.current_alloc_space += words;
            self.stats.alloc_space_words.fetch_add(words, Ordering::Relaxed);
        }
        insert_ordered(&mut locals.spaces, space);
        self.refresh_alloc_free(locals);
        Ok(())
    }

    /// Unregister, drop and unmap a local region.
    pub fn delete_local_space(&self, space: &Arc<Space>) -> MemResult<()> {
        let mut locals = self.locals.lock();
        let pos = locals.position(space).ok_or(MemError::UnknownSpace {
            bottom: space.bottom(),
            expected: "local spaces",
        })?;
        self.delete_local_locked(&mut locals, pos)
    }

    fn delete_local_locked(&self, locals: &mut LocalSpaces, pos: usize) -> MemResult<()> {
        let space = Arc::clone(&locals.spaces[pos]);
        self.unregister(&space)?;
        locals.spaces.remove(pos);

        let words = space.size_words();
        locals.current_heap_size -= words;
        self.stats.total_heap_words.fetch_sub(words, Ordering::Relaxed);
        if space.is_nursery() {
            locals.current_alloc_space -= words;
            self.stats.alloc_space_words.fetch_sub(words, Ordering::Relaxed);
        }
        self.refresh_alloc_free(locals);
        debug!("Deleted local space at {:#x} ({} words)", space.bottom(), words);
        self.release(&space);
        Ok(())
    }

    /// Delete local regions left empty by a collection.
    ///
    /// Empty nursery regions are kept while the nursery is within the
    /// minor-collection ceiling. Returns the number of regions deleted.
    pub fn remove_empty_locals(&self) -> MemResult<usize> {
        let mut locals = self.locals.lock();
        let mut removed = 0;
        let mut i = 0;
        while i < locals.spaces.len() {
            let space = &locals.spaces[i];
            let delete = space.allocated_space() == 0
                && (!space.is_nursery()
                    || locals.current_alloc_space > self.config.space_before_minor_gc);
            if delete {
                self.delete_local_locked(&mut locals, i)?;
                removed += 1;
            } else {
                i += 1;
            }
        }
        Ok(removed)
    }

    /// Shrink the nursery towards `words` words by deleting empty nursery
    /// regions, odd-sized ones first.
    pub fn remove_excess_allocation(&self, words: usize) -> MemResult<()> {
        let mut locals = self.locals.lock();
        self.remove_excess_locked(&mut locals, words)
    }

    fn remove_excess_locked(&self, locals: &mut LocalSpaces, words: usize) -> MemResult<()> {
        let default_words = self.default_nursery_words();
        let mut i = locals.spaces.len();
        while i > 0 {
            i -= 1;
            let space = &locals.spaces[i];
            if space.is_nursery() && space.allocated_space() == 0 && space.size_words() != default_words {
                self.delete_local_locked(locals, i)?;
            }
        }

        let mut i = locals.spaces.len();
        while locals.current_alloc_space > words && i > 0 {
            i -= 1;
            let space = &locals.spaces[i];
            if space.is_nursery() && space.allocated_space() == 0 {
                self.delete_local_locked(locals, i)?;
            }
        }
        Ok(())
    }

    /// Turn a nursery region holding long-lived data into an ordinary
    /// mutable local region.
    pub fn convert_allocation_space_to_local(&self, space: &Arc<Space>) -> MemResult<()> {
        let mut locals = self.locals.lock();
        let pos = locals.position(space).ok_or(MemError::UnknownSpace {
            bottom: space.bottom(),
            expected: "local spaces",
        })?;
        let local = space
            .local()
            .filter(|l| l.is_nursery())
            .ok_or_else(|| invariant("converted region is not a nursery"))?;

        local.set_nursery(false);
        let words = space.size_words();
        locals.current_alloc_space -= words;
        self.stats.alloc_space_words.fetch_sub(words, Ordering::Relaxed);

        // Move it in front of the nurseries. The removal leaves capacity for
        // the reinsertion.
        let space = locals.spaces.remove(pos);
        insert_ordered(&mut locals.spaces, space);
        self.refresh_alloc_free(&locals);
        Ok(())
    }

    // Nursery allocation

    /// Allocate between `min_words` and `max_words` words from a nursery.
    ///
    /// Returns `None` when the nursery is full and may not grow; the caller
    /// should collect and retry.
    pub fn alloc_heap_space(&self, min_words: usize, max_words: usize) -> Option<HeapSpan> {
        debug_assert!(min_words <= max_words);
        let mut locals = self.locals.lock();

        let start = locals.nursery_start();
        let count = locals.spaces.len() - start;
        if count > 0 {
            if locals.next_allocator >= count {
                locals.next_allocator = 0;
            }
            for _ in 0..count {
                let space = Arc::clone(&locals.spaces[start + locals.next_allocator]);
                locals.next_allocator = (locals.next_allocator + 1) % count;
                if let Some(span) = take_span(&space, min_words, max_words) {
                    self.refresh_alloc_free(&locals);
                    return Some(span);
                }
            }
        }

        let ceiling = self.config.space_before_minor_gc;
        if min_words > self.config.default_space_size && min_words < ceiling {
            if let Err(err) = self.remove_excess_locked(&mut locals, ceiling - min_words) {
                warn!("Unable to trim the nursery: {}", err);
            }
        }

        // Going over the ceiling is allowed so that very large objects can
        // still be allocated.
        if locals.current_alloc_space < ceiling {
            let words = self.config.default_space_size.max(min_words);
            match self.create_local_locked(&mut locals, words, true, true) {
                Ok(space) => {
                    let span = take_span(&space, min_words, max_words);
                    self.refresh_alloc_free(&locals);
                    return span;
                }
                Err(err) => debug!("Unable to grow the nursery: {}", err),
            }
        }
        None
    }

    /// Whether a request for `words` words could be satisfied, without
    /// changing anything.
    pub fn check_for_allocation(&self, words: usize) -> bool {
        let locals = self.locals.lock();
        let nurseries = locals.nurseries();
        if nurseries.iter().any(|s| {
            let free = s.free_space();
            free > 0 && free >= words
        }) {
            return true;
        }

        let ceiling = self.config.space_before_minor_gc;
        let mut occupancy = locals.current_alloc_space;
        if words > self.config.default_space_size && words < ceiling {
            // What remove_excess_allocation could give back.
            let empty: usize = nurseries
                .iter()
                .filter(|s| s.allocated_space() == 0)
                .map(|s| s.size_words())
                .sum();
            occupancy = occupancy.saturating_sub(empty);
        }
        occupancy < ceiling
    }

    /// Free words across all nursery regions.
    pub fn get_free_alloc_space(&self) -> usize {
        let locals = self.locals.lock();
        self.refresh_alloc_free(&locals)
    }

    fn refresh_alloc_free(&self, locals: &LocalSpaces) -> usize {
        let free = locals.nursery_free();
        self.stats.alloc_free_words.store(free, Ordering::Relaxed);
        free
    }

    /// Allocated words across all nursery regions.
    pub fn allocated_in_alloc(&self) -> usize {
        let locals = self.locals.lock();
        locals.nurseries().iter().map(|s| s.allocated_space()).sum()
    }

    // Diagnostics

    /// Write-protect immutable local regions outside collection, or lift
    /// the protection again. Does nothing unless `check_objects` is set.
    pub fn protect_immutable(&self, on: bool) -> MemResult<()> {
        if !self.config.check_objects {
            return Ok(());
        }
        let perms = if on { Permissions::READ } else { Permissions::READ_WRITE };
        let locals = self.locals.lock();
        for space in locals.spaces.iter().filter(|s| !s.is_mutable()) {
            // SAFETY: the region is live and mapped by us; immutable regions
            // are only written by the collector, which lifts this first.
            unsafe { self.os.set_permissions(space.bottom(), space.size_bytes(), perms)? };
        }
        Ok(())
    }

    /// Measure heap occupancy and log it.
    pub fn report_heap_sizes(&self, phase: &str) -> HeapReport {
        let mut report = HeapReport {
            phase: phase.to_string(),
            major_used: 0,
            major_size: 0,
            alloc_used: 0,
            alloc_size: 0,
            code_size: 0,
            stack_size: 0,
            permanent_size: 0,
            heap_limit: self.config.heap_size,
        };

        {
            let locals = self.locals.lock();
            let mut alloc_free = 0;
            for space in &locals.spaces {
                if space.is_nursery() {
                    report.alloc_size += space.size_words();
                    report.alloc_used += space.allocated_space();
                    alloc_free += space.free_space();
                } else {
                    report.major_size += space.size_words();
                    report.major_used += space.allocated_space();
                }
            }
            self.stats.alloc_free_words.store(alloc_free, Ordering::Relaxed);
        }
        report.code_size = self.code_spaces.lock().iter().map(|s| s.size_words()).sum();
        report.stack_size = self.stack_spaces.lock().iter().map(|s| s.size_words()).sum();
        report.permanent_size = self.permanent_spaces.read().iter().map(|s| s.size_words()).sum();

        info!(
            "Heap: {} Major heap used {} of {} words ({:.0}%). Alloc space used {} of {} words ({:.0}%). Code {} words",
            report.phase,
            report.major_used,
            report.major_size,
            report.major_percent(),
            report.alloc_used,
            report.alloc_size,
            report.alloc_percent(),
            report.code_size
        );
        report
    }
}

fn take_span(space: &Space, min_words: usize, max_words: usize) -> Option<HeapSpan> {
    let local = space.local()?;
    let available = space.free_space();
    if available == 0 || available < min_words {
        return None;
    }
    let words = max_words.min(available);
    let start = local.lower_alloc();
    local.set_lower_alloc(start + words * WORD);
    Some(HeapSpan { start, words })
}

impl fmt::Debug for MemMgr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemMgr")
            .field("locals", &self.locals.lock().spaces.len())
            .field("code", &self.code_spaces.lock().len())
            .field("stacks", &self.stack_spaces.lock().len())
            .field("permanent", &self.permanent_spaces.read().len())
            .field("export", &self.export_spaces.read().len())
            .field("index", &self.tree)
            .finish()
    }
}

impl Drop for MemMgr {
    fn drop(&mut self) {
        let mut spaces = std::mem::take(&mut self.locals.get_mut().spaces);
        spaces.append(self.code_spaces.get_mut());
        spaces.append(self.stack_spaces.get_mut());
        spaces.append(self.permanent_spaces.get_mut());
        spaces.append(self.export_spaces.get_mut());
        for space in &spaces {
            self.release(space);
        }
    }
}
