//! Allocator benchmarks.

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use lmem_core::config::{AllocatorConfig, CheckMode};
use lmem_core::malloc::{MMAP_THRESHOLD, MallocState, SimulatedMemory};

fn fresh_state(mode: CheckMode) -> MallocState<SimulatedMemory> {
    MallocState::with_config(
        SimulatedMemory::new(),
        AllocatorConfig::new().with_mode(mode).with_mmap(true),
    )
}

fn bench_alloc_free_cycle(c: &mut Criterion) {
    let sizes: &[usize] = &[16, 64, 256, 1024, 4096, 32768, MMAP_THRESHOLD];
    let mut group = c.benchmark_group("alloc_free_cycle");

    for &size in sizes {
        let mut state = fresh_state(CheckMode::Compat);
        group.bench_with_input(BenchmarkId::new("sim", size), &size, |b, &sz| {
            b.iter(|| {
                let ptr = state.malloc(sz).unwrap();
                state.free(criterion::black_box(ptr));
            });
        });
    }
    group.finish();
}

// First-fit walks the list, so search cost grows with the number of live
// blocks ahead of the first fit.
fn bench_first_fit_depth(c: &mut Criterion) {
    let mut group = c.benchmark_group("first_fit_depth");

    for &depth in &[16usize, 256, 2048] {
        let mut state = fresh_state(CheckMode::Compat);
        let pinned: Vec<usize> = (0..depth).map(|_| state.malloc(48).unwrap()).collect();
        criterion::black_box(&pinned);
        group.bench_with_input(BenchmarkId::new("sim", depth), &depth, |b, _| {
            b.iter(|| {
                let ptr = state.malloc(48).unwrap();
                state.free(criterion::black_box(ptr));
            });
        });
    }
    group.finish();
}

fn bench_realloc_growth(c: &mut Criterion) {
    let mut group = c.benchmark_group("realloc_growth");

    for mode in [CheckMode::Compat, CheckMode::Checked] {
        group.bench_function(mode.as_str(), |b| {
            b.iter(|| {
                let mut state = fresh_state(mode);
                let mut ptr = state.malloc(16).unwrap();
                let mut len = 16;
                while len < 4 * MMAP_THRESHOLD {
                    len *= 2;
                    ptr = state.realloc(ptr, len).unwrap();
                }
                state.free(ptr);
                criterion::black_box(state.audit().unwrap());
            });
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_alloc_free_cycle,
    bench_first_fit_depth,
    bench_realloc_growth
);
criterion_main!(benches);
