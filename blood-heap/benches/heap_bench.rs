//! Heap-region manager benchmarks using criterion.
//!
//! Run with: cargo bench --bench heap_bench

use blood_heap::{HeapConfig, MemMgr, WORD};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

fn config() -> HeapConfig {
    HeapConfig::builder()
        .default_space_size(64 * 1024)
        .space_before_minor_gc(1024 * 1024)
        .code_space_size(64 * 1024)
        .executable_code(false)
        .build()
        .unwrap()
}

fn bench_address_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("address_lookup");

    for regions in [1usize, 16, 128] {
        let heap = MemMgr::with_defaults(config()).unwrap();
        let spaces: Vec<_> = (0..regions)
            .map(|i| heap.new_local_space(1024, i % 2 == 0).unwrap())
            .collect();
        let targets: Vec<usize> = spaces.iter().map(|s| s.bottom() + 17 * WORD).collect();

        group.throughput(Throughput::Elements(targets.len() as u64));
        group.bench_with_input(BenchmarkId::new("hit", regions), &targets, |b, targets| {
            b.iter(|| {
                for &addr in targets {
                    black_box(heap.space_for_address(addr));
                }
            });
        });
    }

    let heap = MemMgr::with_defaults(config()).unwrap();
    heap.new_local_space(1024, true).unwrap();
    group.bench_function("miss", |b| {
        b.iter(|| black_box(heap.space_for_address(black_box(0x1000))));
    });

    group.finish();
}

fn bench_nursery_allocation(c: &mut Criterion) {
    let mut group = c.benchmark_group("nursery_allocation");

    for words in [2usize, 16, 256] {
        group.bench_with_input(BenchmarkId::new("alloc_heap_space", words), &words, |b, &words| {
            let heap = MemMgr::with_defaults(config()).unwrap();
            b.iter(|| {
                if heap.alloc_heap_space(words, words).is_none() {
                    // Stand in for a minor collection.
                    for space in heap.nursery_spaces() {
                        if let Some(local) = space.local() {
                            local.set_lower_alloc(space.bottom());
                        }
                    }
                }
            });
        });
    }

    group.finish();
}

fn bench_code_allocation(c: &mut Criterion) {
    let mut group = c.benchmark_group("code_allocation");

    group.bench_function("alloc_code_space", |b| {
        b.iter_with_setup(
            || MemMgr::with_defaults(config()).unwrap(),
            |heap| {
                for i in 0..64 {
                    black_box(heap.alloc_code_space(8 + i, &[]));
                }
                heap
            },
        );
    });

    let heap = MemMgr::with_defaults(config()).unwrap();
    let objects: Vec<_> = (0..256)
        .filter_map(|i| heap.alloc_code_space(4 + i % 32, &[]))
        .collect();
    group.bench_function("find_code_object", |b| {
        b.iter(|| {
            for alloc in &objects {
                black_box(heap.find_code_object(alloc.object + (alloc.words / 2) * WORD));
            }
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_address_lookup,
    bench_nursery_allocation,
    bench_code_allocation,
);
criterion_main!(benches);
