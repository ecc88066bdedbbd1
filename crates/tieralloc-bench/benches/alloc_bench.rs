//! Allocator benchmarks.

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use tieralloc_core::{AllocRequest, AllocatorConfig, AllocatorContext, BackingPool};

fn context() -> AllocatorContext {
    AllocatorContext::new(AllocatorConfig {
        background_reclaimer: false,
        ..AllocatorConfig::default()
    })
    .expect("context")
}

fn bench_alloc_free_cycle(c: &mut Criterion) {
    // One size per tier boundary: pocket, bump, buddy.
    let sizes: &[usize] = &[16, 120, 1024, 16 * 1024, 32 * 1024, 256 * 1024];
    let ctx = context();
    let mut group = c.benchmark_group("alloc_free_cycle");

    for &size in sizes {
        group.bench_with_input(BenchmarkId::new("tieralloc", size), &size, |b, &sz| {
            let req = AllocRequest::new(sz);
            b.iter(|| {
                let p = ctx.alloc(&req).expect("alloc");
                unsafe { ctx.free(criterion::black_box(p).as_ptr()) };
            });
        });
        group.bench_with_input(BenchmarkId::new("libc", size), &size, |b, &sz| {
            b.iter(|| unsafe {
                let p = libc::calloc(1, sz);
                libc::free(criterion::black_box(p));
            });
        });
    }
    group.finish();
}

fn bench_alloc_burst(c: &mut Criterion) {
    let mut group = c.benchmark_group("alloc_burst");
    let ctx = context();

    group.bench_function("1000x64B", |b| {
        let req = AllocRequest::new(64);
        b.iter(|| {
            let ptrs: Vec<_> = (0..1000).map(|_| ctx.alloc(&req).expect("alloc")).collect();
            for p in criterion::black_box(ptrs) {
                unsafe { ctx.free(p.as_ptr()) };
            }
        });
    });

    let pool = BackingPool::anonymous(16 << 20).expect("pool");
    let embedded = AllocatorContext::new(AllocatorConfig {
        background_reclaimer: false,
        ..AllocatorConfig::embedded(pool)
    })
    .expect("context");
    group.bench_function("embedded_1000x64B", |b| {
        let req = AllocRequest::new(64);
        b.iter(|| {
            let ptrs: Vec<_> = (0..1000)
                .map(|_| embedded.alloc(&req).expect("alloc"))
                .collect();
            for p in criterion::black_box(ptrs) {
                unsafe { embedded.free(p.as_ptr()) };
            }
        });
    });

    group.finish();
}

fn bench_access(c: &mut Criterion) {
    let ctx = context();
    let p = ctx.alloc(&AllocRequest::new(256)).expect("alloc");
    let mut now = 0u64;
    c.bench_function("access_checked", |b| {
        b.iter(|| {
            now += 1;
            unsafe { criterion::black_box(ctx.access(p.as_ptr(), now)) }
        });
    });
    unsafe { ctx.free(p.as_ptr()) };
}

criterion_group!(benches, bench_alloc_free_cycle, bench_alloc_burst, bench_access);
criterion_main!(benches);
