//! Property-based tests for the heap-region manager.
//!
//! Uses proptest to generate random request sequences and verify the
//! region invariants hold after each of them.

use std::sync::Arc;

use blood_heap::object::{fill_unused_space, for_each_object};
use blood_heap::{Address, HeapConfig, MemMgr, SpaceFlags, SpaceType, WORD};
use proptest::prelude::*;

fn heap() -> MemMgr {
    let config = HeapConfig::builder()
        .default_space_size(1024)
        .space_before_minor_gc(4096)
        .code_space_size(512)
        .executable_code(false)
        .build()
        .unwrap();
    MemMgr::with_defaults(config).unwrap()
}

/// Strategy for nursery requests as (min, max) word counts
fn nursery_request() -> impl Strategy<Value = (usize, usize)> {
    (1usize..64, 0usize..64).prop_map(|(min, extra)| (min, min + extra))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Nursery spans are disjoint and each lies inside one nursery region
    #[test]
    fn nursery_spans_are_disjoint(requests in prop::collection::vec(nursery_request(), 1..200)) {
        let heap = heap();
        let mut spans = Vec::new();
        for (min, max) in requests {
            let Some(span) = heap.alloc_heap_space(min, max) else { break };
            prop_assert!(span.words >= min && span.words <= max);
            let space = heap.space_for_address(span.start).unwrap();
            prop_assert!(space.is_nursery());
            prop_assert!(span.end() <= space.top());
            spans.push(span);
        }

        spans.sort_by_key(|s| s.start);
        for pair in spans.windows(2) {
            prop_assert!(pair[0].end() <= pair[1].start);
        }
        let handed_out: usize = spans.iter().map(|s| s.words).sum();
        prop_assert_eq!(heap.allocated_in_alloc(), handed_out);
    }

    /// Requests are spread evenly over the nurseries
    #[test]
    fn round_robin_is_fair(nurseries in 1usize..5, requests in 1usize..80) {
        let heap = heap();
        for _ in 0..nurseries {
            heap.create_allocation_space(1024).unwrap();
        }
        let regions = heap.nursery_spaces();
        let mut counts = vec![0usize; regions.len()];
        for i in 0..requests {
            let span = heap.alloc_heap_space(1, 1).unwrap();
            let pos = regions.iter().position(|r| r.contains(span.start)).unwrap();
            prop_assert_eq!(pos, i % regions.len());
            counts[pos] += 1;
        }
        let most = counts.iter().max().copied().unwrap_or(0);
        let least = counts.iter().min().copied().unwrap_or(0);
        prop_assert!(most - least <= 1);
    }

    /// Code objects never overlap and every one can be found again
    #[test]
    fn code_objects_are_packed(sizes in prop::collection::vec(1usize..200, 1..40)) {
        let heap = heap();
        let mut objects = Vec::new();
        for words in sizes {
            let alloc = heap.alloc_code_space(words, &[]).unwrap();
            objects.push((alloc.object, alloc.words));
        }

        for &(object, words) in &objects {
            prop_assert_eq!(heap.find_code_object(object), Some(object));
            prop_assert_eq!(heap.find_code_object(object + (words - 1) * WORD), Some(object));

            let space = heap.space_for_address(object).unwrap();
            prop_assert_eq!(space.kind(), SpaceType::Code);
            prop_assert!(object + words * WORD <= space.top());
            let bit = (object - WORD - space.bottom()) / WORD;
            prop_assert!(space.code().unwrap().header_map.test(bit));
        }

        let mut sorted = objects.clone();
        sorted.sort();
        for pair in sorted.windows(2) {
            // The next length word starts after the previous object.
            prop_assert!(pair[0].0 + pair[0].1 * WORD < pair[1].0);
        }

        // Every region is still tiled exactly, and its cached bound is the
        // largest hole left above the cursor.
        for space in heap.code_spaces() {
            let state = space.code().unwrap();
            let mut end = space.bottom();
            let mut largest = 0;
            unsafe {
                for_each_object(heap.model(), space.bottom(), space.top(), |obj, word| {
                    if obj > state.first_free() && word.is_byte_object() {
                        largest = largest.max(word.length());
                    }
                    end = obj + word.length() * WORD;
                });
            }
            prop_assert_eq!(end, space.top());
            prop_assert_eq!(state.largest_free(), largest);
        }
    }

    /// Replacing any level keeps level 0 and demotes everything above it
    #[test]
    fn demotion_keeps_level_zero(layers in 1u32..5, replace in 1u32..5) {
        let heap = heap();
        let mut base_layer = vec![0usize; 64];
        let base = base_layer.as_mut_ptr() as Address;
        unsafe { fill_unused_space(heap.model(), base, 64) };
        let root = heap.new_permanent_space(base, 64, SpaceFlags::empty(), 0, 0).unwrap();

        for level in 1..=layers {
            heap.new_export_space(128, false, false, false).unwrap();
            heap.promote_export_spaces(level).unwrap();
        }
        prop_assert_eq!(heap.permanent_spaces().len(), layers as usize + 1);

        let replace = replace.min(layers + 1);
        let export = heap.new_export_space(128, false, false, false).unwrap();
        heap.promote_export_spaces(replace).unwrap();

        let permanent = heap.permanent_spaces();
        prop_assert_eq!(permanent.len(), replace as usize + 1);
        prop_assert!(Arc::ptr_eq(&permanent[0], &root));
        prop_assert!(Arc::ptr_eq(permanent.last().unwrap(), &export));
        prop_assert!(permanent.iter().all(|s| s.hierarchy() <= replace));
        prop_assert_eq!(heap.local_spaces().len(), (layers + 1 - replace) as usize);

        heap.demote_import_spaces().unwrap();
        let permanent = heap.permanent_spaces();
        prop_assert_eq!(permanent.len(), 1);
        prop_assert!(Arc::ptr_eq(&permanent[0], &root));
        prop_assert!(Arc::ptr_eq(&heap.space_for_address(base).unwrap(), &root));
    }
}
