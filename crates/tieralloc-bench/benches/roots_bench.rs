//! Root tracking and sweep benchmarks.

use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use tieralloc_core::{AllocRequest, AllocatorConfig, AllocatorContext, Lifetime, ManualClock};

fn bench_root_lifecycle(c: &mut Criterion) {
    let ctx = AllocatorContext::new(AllocatorConfig {
        background_reclaimer: false,
        ..AllocatorConfig::default()
    })
    .expect("context");

    c.bench_function("root_alloc_retain_release_free", |b| {
        let req = AllocRequest::new(128).root();
        b.iter(|| {
            let p = ctx.alloc(&req).expect("alloc");
            unsafe {
                ctx.retain(p.as_ptr());
                ctx.release(p.as_ptr());
                ctx.free(criterion::black_box(p).as_ptr());
            }
        });
    });
}

fn bench_sweep(c: &mut Criterion) {
    let mut group = c.benchmark_group("cleanup_roots");
    for &count in &[100usize, 1_000, 10_000] {
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &n| {
            let clock = ManualClock::new(0);
            let ctx = AllocatorContext::new(
                AllocatorConfig {
                    background_reclaimer: false,
                    ..AllocatorConfig::default()
                }
                .with_clock(Arc::new(clock)),
            )
            .expect("context");
            let req = AllocRequest::new(64).root().lifetime(Lifetime::Ticks(1));
            b.iter(|| {
                for _ in 0..n {
                    let p = ctx.alloc(&req).expect("alloc");
                    unsafe { ctx.release(p.as_ptr()) };
                }
                criterion::black_box(ctx.cleanup_roots(10))
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_root_lifecycle, bench_sweep);
criterion_main!(benches);
