//! # Code Space
//!
//! Compiled code is never moved. Code regions are tiled by live code
//! objects and holes (byte objects); allocation takes the first hole that
//! is large enough and splits it, and the collector turns dead code back
//! into holes in place. There is no free list.
//!
//! ```text
//!  bottom                first_free
//!  ┌──────┬──────┬──────┬─────┬────────────┬──────┬─────────────────────┐
//!  │ code │ code │ hole │code │    hole    │ code │        hole         │
//!  │      │      │ (<8) │     │            │      │                     │
//!  └──────┴──────┴──────┴─────┴────────────┴──────┴─────────────────────┘
//! ```
//!
//! Each region keeps two hints: `first_free`, before which nothing is worth
//! scanning, and `largest_free`, the largest hole above `first_free` as of
//! the last scan, so that regions that cannot satisfy a request are skipped
//! without a scan. Holes the collector opens later may exceed it. A
//! header bitmap marks the length word of every live code object so that
//! any address inside code can be mapped back to its object.

use std::ptr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::debug;

use crate::bitmap::Bitmap;
use crate::error::{MemError, MemResult};
use crate::memmgr::{reserve_slot, MemMgr};
use crate::object::{self, flags, fill_unused_space, LengthWord, ObjectModel, MAX_OBJECT_SIZE};
use crate::space::{Space, SpaceType};
use crate::{Address, WORD};

/// Holes shorter than this are not worth revisiting when advancing
/// `first_free`.
const SMALL_HOLE: usize = 8;

/// A code object handed out by [`MemMgr::alloc_code_space`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeAllocation {
    /// Address of the object; its length word is the word before.
    pub object: Address,
    /// Length of the object in words, excluding the length word.
    pub words: usize,
}

/// Length of the object at `obj`, looking through a forwarding pointer.
unsafe fn object_length(model: &dyn ObjectModel, obj: Address) -> LengthWord {
    let word = model.length_word(obj);
    if word.is_forwarded() {
        model.length_word(model.follow_forwarding_chain(obj))
    } else {
        word
    }
}

impl MemMgr {
    /// Allocate a code object of `words` words, not counting its length word,
    /// and copy `initial` into the start of it.
    ///
    /// The object is written with a code, mutable length word and its region
    /// is marked mutable so the collector scans it. Returns `None` if no
    /// region has room and a new one cannot be mapped.
    pub fn alloc_code_space(&self, words: usize, initial: &[usize]) -> Option<CodeAllocation> {
        debug_assert!(words > 0 && words <= MAX_OBJECT_SIZE);
        debug_assert!(initial.len() <= words);
        if words == 0 || words > MAX_OBJECT_SIZE {
            return None;
        }

        let mut code = self.code_spaces.lock();
        for space in code.iter() {
            if let Some(object) = self.alloc_in_code_space(space, words, initial) {
                return Some(CodeAllocation { object, words });
            }
        }

        let size = (words + 1).max(self.config().code_space_size);
        match self.new_code_space_locked(&mut code, size) {
            Ok(space) => self
                .alloc_in_code_space(&space, words, initial)
                .map(|object| CodeAllocation { object, words }),
            Err(err) => {
                debug!("Unable to allocate {} words of code: {}", words, err);
                None
            }
        }
    }

    fn alloc_in_code_space(&self, space: &Space, words: usize, initial: &[usize]) -> Option<Address> {
        let state = space.code()?;
        if state.largest_free() < words {
            return None;
        }
        let model = self.model();
        let top = space.top();

        // SAFETY: the region is live, tiled by valid objects, and the code
        // lock keeps other allocators out.
        unsafe {
            let mut first_free = state.first_free();
            while first_free < top {
                let word = object_length(model, first_free + WORD);
                if word.is_code_object() || word.length() < SMALL_HOLE {
                    first_free += (word.length() + 1) * WORD;
                } else {
                    break;
                }
            }
            state.set_first_free(first_free);

            let mut largest = 0;
            let mut found = None;
            let mut pt = first_free;
            while pt < top {
                let obj = pt + WORD;
                let word = object_length(model, obj);
                let length = word.length();
                if word.is_byte_object() {
                    if found.is_none() && length >= words {
                        let spare = length - words;
                        if spare != 0 {
                            fill_unused_space(model, pt + (words + 1) * WORD, spare);
                        }
                        space.set_mutable(true);
                        state.header_map.set((pt - space.bottom()) / WORD);
                        // The code bit must be in place before the lock is
                        // released so that no other thread takes this hole.
                        model.set_length_word(obj, LengthWord::new(words, flags::CODE_OBJ | flags::MUTABLE));
                        let count = initial.len().min(words);
                        ptr::copy_nonoverlapping(initial.as_ptr(), obj as *mut usize, count);
                        found = Some(obj);
                        // Keep going over the rest so the bound covers the
                        // leftover of the split.
                        pt += (words + 1) * WORD;
                        continue;
                    }
                    largest = largest.max(length);
                }
                pt += (length + 1) * WORD;
            }
            state.set_largest_free(largest);
            found
        }
    }

    /// Map a code region of at least `words` words, tile it with a single
    /// hole and register it.
    pub fn new_code_space(&self, words: usize) -> MemResult<Arc<Space>> {
        let mut code = self.code_spaces.lock();
        self.new_code_space_locked(&mut code, words)
    }

    fn new_code_space_locked(&self, code: &mut Vec<Arc<Space>>, words: usize) -> MemResult<Arc<Space>> {
        let mapping = self.map_words(words, self.code_permissions())?;
        let space = match Space::new_code(mapping.base, mapping.end(), 0) {
            Ok(space) => Arc::new(space),
            Err(err) => {
                self.unmap(mapping);
                return Err(err);
            }
        };
        // SAFETY: freshly mapped and writable.
        unsafe { fill_unused_space(self.model(), space.bottom(), space.size_words()) };

        if let Err(err) = self.add_code_space_locked(code, Arc::clone(&space), None) {
            self.release(&space);
            return Err(err);
        }
        debug!(
            "New code space at {:#x}..{:#x} ({} words)",
            space.bottom(),
            space.top(),
            space.size_words()
        );
        Ok(space)
    }

    /// Register a code region and append it to the code list.
    /// Add a code region that takes over the memory of `old`, which stays
    /// registered if this fails.
    pub(crate) fn replace_with_code_space(&self, old: &Arc<Space>, space: Arc<Space>) -> MemResult<()> {
        let mut code = self.code_spaces.lock();
        self.add_code_space_locked(&mut code, space, Some(old))
    }

    fn add_code_space_locked(
        &self,
        code: &mut Vec<Arc<Space>>,
        space: Arc<Space>,
        previous: Option<&Arc<Space>>,
    ) -> MemResult<()> {
        reserve_slot(code)?;
        self.register_in_place_of(&space, previous)?;
        self.stats()
            .code_space_words
            .fetch_add(space.size_words(), Ordering::Relaxed);
        code.push(space);
        Ok(())
    }

    /// Find the code object containing `addr`.
    ///
    /// Works for code regions, through their header maps, and for executable
    /// permanent regions, whose header maps are built on first use and
    /// extended as lookups walk forward.
    pub fn find_code_object(&self, addr: Address) -> Option<Address> {
        let space = self.space_for_address(addr)?;
        if !space.is_code() {
            return None;
        }
        let word_addr = addr & !(WORD - 1);
        let bottom = space.bottom();
        let top = space.top();
        let model = self.model();

        match space.kind() {
            SpaceType::Code => {
                let map = &space.code()?.header_map;
                let ptr = bottom + map.find_last_set((word_addr - bottom) / WORD) * WORD;
                if ptr >= top {
                    return None;
                }
                let obj = ptr + WORD;
                // SAFETY: the region is live and tiled; the bit marks a
                // length word.
                let last = unsafe { model.length_word(model.follow_forwarding_chain(obj)) };
                let end = ptr + (last.length() + 1) * WORD;
                (word_addr > ptr && word_addr < end && last.is_code_object()).then_some(obj)
            }
            SpaceType::Permanent => {
                let map = self.profile_map(&space)?;
                let mut bit = map.find_last_set((word_addr - bottom) / WORD);
                loop {
                    let ptr = bottom + bit * WORD;
                    if ptr >= top {
                        return None;
                    }
                    let obj = ptr + WORD;
                    // SAFETY: permanent regions are fully tiled.
                    let length = unsafe { object_length(model, obj) }.length();
                    if word_addr > ptr && word_addr < ptr + (length + 1) * WORD {
                        return Some(obj);
                    }
                    bit += length + 1;
                    if bit < map.len() {
                        map.set(bit);
                    }
                }
            }
            _ => None,
        }
    }

    /// The profile map of a permanent code region, created on first use.
    fn profile_map<'a>(&self, space: &'a Space) -> Option<&'a Bitmap> {
        let state = space.permanent()?;
        if let Some(map) = state.profile_map.get() {
            return Some(map);
        }
        let _lock = self.bitmap_lock.lock();
        if state.profile_map.get().is_none() {
            let map = match Bitmap::new(space.size_words()) {
                Ok(map) => map,
                Err(err) => {
                    debug!("Unable to build profile map: {}", err);
                    return None;
                }
            };
            // The first object starts at the bottom.
            map.set(0);
            let _ = state.profile_map.set(map);
        }
        state.profile_map.get()
    }

    /// Release code regions that the collector has emptied completely.
    ///
    /// Returns the number of regions released.
    pub fn remove_empty_code_areas(&self) -> MemResult<usize> {
        let mut code = self.code_spaces.lock();
        let model = self.model();
        let mut removed = 0;
        let mut i = 0;
        while i < code.len() {
            let space = Arc::clone(&code[i]);
            // SAFETY: the region is live and tiled.
            let first = unsafe { model.length_word(space.bottom() + WORD) };
            if first.is_byte_object() && first.length() == space.size_words() - 1 {
                self.unregister(&space)?;
                code.remove(i);
                self.stats()
                    .code_space_words
                    .fetch_sub(space.size_words(), Ordering::Relaxed);
                debug!("Deleted empty code space at {:#x}", space.bottom());
                self.release(&space);
                removed += 1;
            } else {
                i += 1;
            }
        }
        Ok(removed)
    }

    /// Rebuild the header map of a code region from its contents.
    pub(crate) fn rebuild_header_map(&self, space: &Space) -> MemResult<()> {
        let state = space.code().ok_or(MemError::UnknownSpace {
            bottom: space.bottom(),
            expected: "code spaces",
        })?;
        let bottom = space.bottom();
        state.header_map.clear_all();
        // SAFETY: the caller has exclusive access and the region is tiled.
        unsafe {
            object::for_each_object(self.model(), bottom, space.top(), |obj, word| {
                if word.is_code_object() {
                    state.header_map.set((obj - WORD - bottom) / WORD);
                }
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memmgr::tests::{test_config, test_heap};
    use crate::object::read_word;
    use crate::space::SpaceFlags;

    fn length_at(heap: &MemMgr, obj: Address) -> LengthWord {
        unsafe { heap.model().length_word(obj) }
    }

    #[test]
    fn test_alloc_writes_header_and_content() {
        let heap = test_heap();
        let alloc = heap.alloc_code_space(4, &[1, 2, 3]).unwrap();
        assert_eq!(alloc.words, 4);

        let word = length_at(&heap, alloc.object);
        assert!(word.is_code_object());
        assert!(word.is_mutable());
        assert_eq!(word.length(), 4);
        unsafe {
            assert_eq!(read_word(alloc.object), 1);
            assert_eq!(read_word(alloc.object + WORD), 2);
            assert_eq!(read_word(alloc.object + 2 * WORD), 3);
        }

        let space = heap.space_for_address(alloc.object).unwrap();
        assert_eq!(space.kind(), SpaceType::Code);
        assert!(space.is_mutable());
        let state = space.code().unwrap();
        assert!(state.header_map.test((alloc.object - WORD - space.bottom()) / WORD));
        assert!(space.size_words() >= heap.config().code_space_size);
    }

    #[test]
    fn test_region_stays_tiled_after_split() {
        let heap = test_heap();
        let a = heap.alloc_code_space(10, &[]).unwrap();
        let b = heap.alloc_code_space(20, &[]).unwrap();
        assert_eq!(b.object, a.object + 11 * WORD);

        let space = heap.space_for_address(a.object).unwrap();
        let mut objects = Vec::new();
        unsafe {
            object::for_each_object(heap.model(), space.bottom(), space.top(), |obj, word| {
                objects.push((obj, word));
            });
        }
        assert_eq!(objects.len(), 3);
        assert!(objects[0].1.is_code_object());
        assert!(objects[1].1.is_code_object());
        assert!(objects[2].1.is_byte_object());
        assert_eq!(objects[2].1.length(), space.size_words() - 32 - 1);
    }

    #[test]
    fn test_hole_is_reused_exactly() {
        let mut config = test_config();
        config.code_space_size = 64;
        let heap = MemMgr::with_defaults(config).unwrap();

        let first = heap.alloc_code_space(10, &[]).unwrap();
        let space = heap.space_for_address(first.object).unwrap();
        let state = space.code().unwrap();

        // What a collection does when the object dies.
        unsafe {
            heap.model()
                .set_length_word(first.object, LengthWord::new(10, flags::BYTE_OBJ));
        }
        state.header_map.clear((first.object - WORD - space.bottom()) / WORD);

        let second = heap.alloc_code_space(8, &[]).unwrap();
        assert_eq!(second.object, first.object);
        assert_eq!(heap.code_spaces().len(), 1);

        // The two spare words become a filler up to the untouched hole.
        let filler = length_at(&heap, second.object + 9 * WORD);
        assert!(filler.is_byte_object());
        assert_eq!(filler.length(), 1);
        assert!(length_at(&heap, second.object + 11 * WORD).is_byte_object());
    }

    #[test]
    fn test_first_free_skips_code_and_small_holes() {
        let heap = test_heap();
        let a = heap.alloc_code_space(3, &[]).unwrap();
        let b = heap.alloc_code_space(3, &[]).unwrap();
        let space = heap.space_for_address(a.object).unwrap();
        let state = space.code().unwrap();

        // Free `a`: a hole of 3 words is below the small-hole threshold.
        unsafe {
            heap.model().set_length_word(a.object, LengthWord::new(3, flags::BYTE_OBJ));
        }
        state.header_map.clear(0);

        let c = heap.alloc_code_space(4, &[]).unwrap();
        assert_eq!(state.first_free(), b.object + 3 * WORD);
        assert_eq!(c.object, b.object + 4 * WORD);
    }

    #[test]
    fn test_largest_free_follows_packing() {
        let heap = test_heap();
        let mut objects = Vec::new();
        for words in [10, 20, 30] {
            objects.push(heap.alloc_code_space(words, &[]).unwrap());
        }
        let space = heap.space_for_address(objects[0].object).unwrap();
        assert!(objects.iter().all(|a| space.contains(a.object)));

        // Three length words plus the trailing hole's own.
        let remaining = space.size_words() - 60 - 3 - 1;
        assert_eq!(space.code().unwrap().largest_free(), remaining);
    }

    #[test]
    fn test_failed_scan_refreshes_largest_free() {
        let heap = test_heap();
        let first = heap.alloc_code_space(8, &[]).unwrap();
        let space = heap.space_for_address(first.object).unwrap();
        let state = space.code().unwrap();
        let remaining = space.size_words() - 9 - 1;
        assert_eq!(state.largest_free(), remaining);

        // A stale bound above the real hole: the region is scanned, found
        // wanting, and a second region is mapped.
        state.set_largest_free(space.size_words());
        let big = heap.alloc_code_space(remaining + 1, &[]).unwrap();
        assert!(!space.contains(big.object));
        assert_eq!(heap.code_spaces().len(), 2);
        assert_eq!(state.largest_free(), remaining);
    }

    #[test]
    fn test_find_code_object() {
        let heap = test_heap();
        let a = heap.alloc_code_space(6, &[]).unwrap();
        let b = heap.alloc_code_space(12, &[]).unwrap();

        assert_eq!(heap.find_code_object(a.object), Some(a.object));
        assert_eq!(heap.find_code_object(a.object + 5 * WORD + 3), Some(a.object));
        assert_eq!(heap.find_code_object(b.object + 11 * WORD), Some(b.object));
        // The length word is not part of the object.
        assert_eq!(heap.find_code_object(b.object - WORD), None);
        // Trailing hole.
        assert_eq!(heap.find_code_object(b.object + 13 * WORD), None);
    }

    #[test]
    fn test_find_code_object_in_dead_code() {
        let heap = test_heap();
        let a = heap.alloc_code_space(6, &[]).unwrap();
        let space = heap.space_for_address(a.object).unwrap();
        unsafe {
            heap.model().set_length_word(a.object, LengthWord::new(6, flags::BYTE_OBJ));
        }
        assert_eq!(heap.find_code_object(a.object + WORD), None);
        // A stale bit on a hole is rejected too.
        assert!(space.code().unwrap().header_map.test(0));
    }

    #[test]
    fn test_find_code_object_in_permanent_space() {
        let heap = test_heap();
        let words = 64;
        let mut memory = vec![0usize; words];
        let base = memory.as_mut_ptr() as Address;
        unsafe {
            let model = heap.model();
            model.set_length_word(base + WORD, LengthWord::new(9, flags::CODE_OBJ));
            model.set_length_word(base + 11 * WORD, LengthWord::new(19, flags::CODE_OBJ));
            fill_unused_space(model, base + 30 * WORD, words - 30);
        }
        let space = heap
            .new_permanent_space(base, words, SpaceFlags::EXECUTABLE, 1, 0)
            .unwrap();
        assert!(space.permanent().unwrap().profile_map().is_none());

        assert_eq!(heap.find_code_object(base + 20 * WORD), Some(base + 11 * WORD));
        assert_eq!(heap.find_code_object(base + 3 * WORD), Some(base + WORD));
        let map = space.permanent().unwrap().profile_map().unwrap();
        assert!(map.test(0));
        assert!(map.test(10));
    }

    #[test]
    fn test_remove_empty_code_areas() {
        let heap = test_heap();
        let live = heap.alloc_code_space(4, &[]).unwrap();
        let empty = heap.new_code_space(256).unwrap();
        assert_eq!(heap.code_spaces().len(), 2);
        let words_before = heap.stats().code_space_words.load(Ordering::Relaxed);

        assert_eq!(heap.remove_empty_code_areas().unwrap(), 1);
        assert_eq!(heap.code_spaces().len(), 1);
        assert!(heap.space_for_address(empty.bottom()).is_none());
        assert!(heap.space_for_address(live.object).is_some());
        assert_eq!(
            heap.stats().code_space_words.load(Ordering::Relaxed),
            words_before - empty.size_words()
        );
    }

    #[test]
    fn test_rebuild_header_map() {
        let heap = test_heap();
        let a = heap.alloc_code_space(5, &[]).unwrap();
        let b = heap.alloc_code_space(7, &[]).unwrap();
        let space = heap.space_for_address(a.object).unwrap();
        let map = &space.code().unwrap().header_map;
        map.clear_all();

        heap.rebuild_header_map(&space).unwrap();
        assert_eq!(map.count_set(), 2);
        assert!(map.test(0));
        assert!(map.test((b.object - WORD - space.bottom()) / WORD));
    }
}
