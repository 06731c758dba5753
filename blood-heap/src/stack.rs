//! # Stack Regions
//!
//! Each execution context runs on a stack region of its own. Stacks grow
//! downwards, so the live frames sit at the top of the region. Resizing maps
//! a replacement, registers it alongside the old range, copies the frames
//! across, unregisters the old range and only then unmaps it; a lookup
//! during the switch finds the stack under either range and never lands in
//! freed memory.

use std::ptr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{MemError, MemResult};
use crate::memmgr::{reserve_slot, MemMgr};
use crate::osmem::{Mapping, Permissions};
use crate::space::Space;
use crate::{Address, WORD};

/// Per-context capability used when a stack is resized.
pub trait TaskContext {
    /// The stack region of this context.
    fn stack_space(&self) -> Arc<Space>;

    /// Copy the live frames of the old stack into the new one.
    ///
    /// The default copies the top `min(old_words, new_words)` words, which
    /// is enough for contexts whose frames hold no absolute stack addresses.
    /// Contexts that keep frame or stack pointers must override this and
    /// relocate them.
    ///
    /// # Safety
    ///
    /// Both ranges must be mapped, writable and disjoint.
    unsafe fn copy_stack_frame(&self, old_base: Address, old_words: usize, new_base: Address, new_words: usize) {
        let words = old_words.min(new_words);
        let src = old_base + (old_words - words) * WORD;
        let dst = new_base + (new_words - words) * WORD;
        ptr::copy_nonoverlapping(src as *const usize, dst as *mut usize, words);
    }
}

impl MemMgr {
    /// Map and register a stack of at least `words` words.
    pub fn new_stack_space(&self, words: usize) -> MemResult<Arc<Space>> {
        let mut stacks = self.stack_spaces.lock();
        let mapping = self.map_words(words, Permissions::READ_WRITE).map_err(|err| {
            debug!("New stack space: insufficient space: {}", err);
            err
        })?;
        let space = Arc::new(Space::new_stack(mapping.base, mapping.end()));

        let registered = reserve_slot(&mut stacks).and_then(|()| self.register(&space));
        if let Err(err) = registered {
            debug!("New stack space: unable to register: {}", err);
            self.unmap(mapping);
            return Err(err);
        }
        stacks.push(Arc::clone(&space));
        self.stats()
            .stack_space_words
            .fetch_add(space.size_words(), Ordering::Relaxed);

        debug!(
            "New stack space at {:#x}..{:#x} ({} words)",
            space.bottom(),
            space.top(),
            space.size_words()
        );
        Ok(space)
    }

    /// Replace the stack of `task` by one of at least `new_words` words,
    /// keeping its live frames.
    ///
    /// On failure the old stack is left exactly as it was.
    pub fn grow_or_shrink_stack(&self, task: &dyn TaskContext, new_words: usize) -> MemResult<()> {
        let stacks = self.stack_spaces.lock();
        let space = task.stack_space();
        if !stacks.iter().any(|s| Arc::ptr_eq(s, &space)) {
            return Err(MemError::UnknownSpace { bottom: space.bottom(), expected: "stack spaces" });
        }

        let mapping = self.map_words(new_words, Permissions::READ_WRITE).map_err(|err| {
            debug!(
                "Unable to change size of stack at {:#x} from {} to {} words: {}",
                space.bottom(),
                space.size_words(),
                new_words,
                err
            );
            err
        })?;
        if let Err(err) = self.index().insert(&space, mapping.base, mapping.end()) {
            self.unmap(mapping);
            return Err(err);
        }

        let old = Mapping { base: space.bottom(), size: space.size_bytes() };
        let mapped_words = mapping.size / WORD;
        // SAFETY: both mappings are live, writable and distinct, and the
        // stack lock keeps other resizers away.
        unsafe { task.copy_stack_frame(old.base, old.size / WORD, mapping.base, mapped_words) };

        // Unregister the old range before unmapping it: another thread may
        // map the same addresses as soon as they are released.
        if let Err(err) = self.index().remove(&space, old.base, old.end()) {
            self.discard_replacement(&space, mapping);
            return Err(err);
        }
        space.set_bounds(mapping.base, mapping.end());

        let stats = self.stats();
        stats.stack_space_words.fetch_add(mapped_words, Ordering::Relaxed);
        stats.stack_space_words.fetch_sub(old.size / WORD, Ordering::Relaxed);
        debug!(
            "Size of stack changed from {} to {} words, now at {:#x}",
            old.size / WORD,
            mapped_words,
            mapping.base
        );
        self.unmap(old);
        Ok(())
    }

    /// Unregister and unmap a replacement stack that was never switched to.
    /// If it cannot be unregistered the mapping is leaked rather than freed
    /// under a live index entry.
    fn discard_replacement(&self, space: &Arc<Space>, mapping: Mapping) {
        match self.index().remove(space, mapping.base, mapping.end()) {
            Ok(()) => self.unmap(mapping),
            Err(err) => warn!("Leaking stack mapping at {:#x}: {}", mapping.base, err),
        }
    }

    /// Unregister and unmap a stack whose context has finished.
    pub fn delete_stack_space(&self, space: &Arc<Space>) -> MemResult<()> {
        let mut stacks = self.stack_spaces.lock();
        let pos = stacks
            .iter()
            .position(|s| Arc::ptr_eq(s, space))
            .ok_or(MemError::UnknownSpace { bottom: space.bottom(), expected: "stack spaces" })?;
        self.unregister(space)?;
        stacks.remove(pos);
        self.stats()
            .stack_space_words
            .fetch_sub(space.size_words(), Ordering::Relaxed);
        debug!("Deleted stack space at {:#x}", space.bottom());
        self.release(space);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memmgr::tests::{test_config, test_heap};
    use crate::object::{read_word, write_word, StandardObjectModel};
    use crate::osmem::testing::LimitedMemory;
    use crate::space::SpaceType;

    struct Task {
        stack: Arc<Space>,
    }

    impl TaskContext for Task {
        fn stack_space(&self) -> Arc<Space> {
            Arc::clone(&self.stack)
        }
    }

    fn write_top(space: &Space, values: &[usize]) {
        let top = space.top();
        for (i, v) in values.iter().enumerate() {
            unsafe { write_word(top - (i + 1) * WORD, *v) };
        }
    }

    fn read_top(space: &Space, count: usize) -> Vec<usize> {
        let top = space.top();
        (0..count).map(|i| unsafe { read_word(top - (i + 1) * WORD) }).collect()
    }

    #[test]
    fn test_new_stack_space() {
        let heap = test_heap();
        let stack = heap.new_stack_space(1000).unwrap();
        assert_eq!(stack.kind(), SpaceType::Stack);
        assert!(stack.is_mutable());
        assert!(stack.size_words() >= 1000);
        let found = heap.space_for_address(stack.top() - WORD).unwrap();
        assert!(Arc::ptr_eq(&found, &stack));
        assert!(heap.local_space_for_address(stack.bottom()).is_none());
    }

    #[test]
    fn test_grow_preserves_frames() {
        let heap = test_heap();
        let task = Task { stack: heap.new_stack_space(512).unwrap() };
        let old_bottom = task.stack.bottom();
        let old_words = task.stack.size_words();
        write_top(&task.stack, &[11, 22, 33]);

        heap.grow_or_shrink_stack(&task, old_words * 4).unwrap();
        assert!(task.stack.size_words() >= old_words * 4);
        assert_eq!(read_top(&task.stack, 3), vec![11, 22, 33]);

        assert!(heap.space_for_address(old_bottom).is_none());
        let found = heap.space_for_address(task.stack.bottom()).unwrap();
        assert!(Arc::ptr_eq(&found, &task.stack));
        assert_eq!(
            heap.stats().stack_space_words.load(Ordering::Relaxed),
            task.stack.size_words()
        );
    }

    #[test]
    fn test_shrink_keeps_top() {
        let heap = test_heap();
        let task = Task { stack: heap.new_stack_space(4096).unwrap() };
        let old_words = task.stack.size_words();
        write_top(&task.stack, &[1, 2, 3, 4]);

        heap.grow_or_shrink_stack(&task, 512).unwrap();
        assert!(task.stack.size_words() <= old_words);
        assert_eq!(read_top(&task.stack, 4), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_failed_resize_keeps_old_stack() {
        let os = Arc::new(LimitedMemory::new(1));
        let heap = MemMgr::new(test_config(), os.clone(), Box::new(StandardObjectModel)).unwrap();
        let task = Task { stack: heap.new_stack_space(512).unwrap() };
        let bottom = task.stack.bottom();
        write_top(&task.stack, &[9]);

        assert!(heap.grow_or_shrink_stack(&task, 2048).unwrap_err().is_out_of_memory());
        assert_eq!(task.stack.bottom(), bottom);
        assert_eq!(read_top(&task.stack, 1), vec![9]);
        assert!(heap.space_for_address(bottom).is_some());
        assert_eq!(os.live.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_discarded_replacement_is_unregistered_and_unmapped() {
        let os = Arc::new(LimitedMemory::new(2));
        let heap = MemMgr::new(test_config(), os.clone(), Box::new(StandardObjectModel)).unwrap();
        let stack = heap.new_stack_space(512).unwrap();
        let nodes = heap.index().node_count();

        // A replacement registered next to the old range, as a resize does
        // before copying frames.
        let mapping = heap.map_words(2048, Permissions::READ_WRITE).unwrap();
        heap.index().insert(&stack, mapping.base, mapping.end()).unwrap();
        assert_eq!(os.live.load(Ordering::SeqCst), 2);

        heap.discard_replacement(&stack, mapping);
        assert!(heap.space_for_address(mapping.base).is_none());
        assert!(heap.space_for_address(mapping.end() - WORD).is_none());
        let found = heap.space_for_address(stack.bottom()).unwrap();
        assert!(Arc::ptr_eq(&found, &stack));
        assert_eq!(heap.index().node_count(), nodes);
        assert_eq!(os.live.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_delete_stack_space() {
        let heap = test_heap();
        let stack = heap.new_stack_space(512).unwrap();
        let bottom = stack.bottom();
        heap.delete_stack_space(&stack).unwrap();
        assert!(heap.space_for_address(bottom).is_none());
        assert!(heap.stack_spaces().is_empty());
        assert!(matches!(
            heap.delete_stack_space(&stack),
            Err(MemError::UnknownSpace { .. })
        ));
    }

    #[test]
    fn test_resize_unknown_stack() {
        let heap = test_heap();
        let other = test_heap();
        let task = Task { stack: other.new_stack_space(512).unwrap() };
        assert!(matches!(
            heap.grow_or_shrink_stack(&task, 1024),
            Err(MemError::UnknownSpace { .. })
        ));
    }
}
