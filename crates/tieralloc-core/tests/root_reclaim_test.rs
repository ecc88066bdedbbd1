#![allow(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use tieralloc_core::{
    AllocRequest, AllocatorConfig, AllocatorContext, Clock, CorruptionPolicy, GcConfig, Lifetime,
    ManualClock, MemorySink, TraceEvent,
};

fn reclaiming(clock: &ManualClock, manual: bool) -> AllocatorContext {
    AllocatorContext::new(
        AllocatorConfig {
            gc: GcConfig {
                min_interval: Duration::from_millis(1),
                max_interval: Duration::from_millis(4),
                pressure_threshold: 1,
                manual,
            },
            corruption_policy: CorruptionPolicy::Panic,
            ..AllocatorConfig::default()
        }
        .with_clock(Arc::new(clock.clone())),
    )
    .expect("context")
}

fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    cond()
}

#[test]
fn expired_unreferenced_roots_are_reclaimed_in_the_background() {
    let clock = ManualClock::new(100);
    let ctx = reclaiming(&clock, false);
    let sink = Arc::new(MemorySink::new());
    ctx.set_trace_sink(sink.clone());
    ctx.set_trace(true);

    let req = AllocRequest::new(256).root().at(100).lifetime(Lifetime::Ticks(50));
    let held = ctx.alloc(&req).unwrap();
    let dropped = ctx.alloc(&req).unwrap();
    let forever = ctx.alloc(&AllocRequest::new(256).root().at(100)).unwrap();
    unsafe {
        assert_eq!(ctx.release(dropped.as_ptr()), Some(0));
        assert_eq!(ctx.release(forever.as_ptr()), Some(0));
    }
    assert_eq!(ctx.root_count(), 3);

    // Not yet expired: the reclaimer must leave everything alone.
    let cycles = ctx.reclaimer_cycles();
    assert!(wait_until(|| ctx.reclaimer_cycles() >= cycles + 3));
    assert_eq!(ctx.root_count(), 3);

    clock.set(151);
    assert!(
        wait_until(|| ctx.root_count() == 2),
        "expired root with no references was not reclaimed"
    );
    assert!(ctx.root_info(dropped.as_ptr()).is_none());
    assert!(ctx.root_info(held.as_ptr()).is_some(), "referenced root must survive");
    assert!(ctx.root_info(forever.as_ptr()).is_some(), "forever root must survive");
    assert_eq!(sink.count(TraceEvent::Reclaim), 1);
    assert_eq!(ctx.metrics().roots_reclaimed, 1);
    assert_eq!(ctx.reclaim_pressure(), 256);

    unsafe {
        ctx.free(held.as_ptr());
        ctx.free(forever.as_ptr());
    }
    assert_eq!(ctx.root_count(), 0);
    assert_eq!(ctx.reclaim_pressure(), 0);
    ctx.shutdown();
}

#[test]
fn manual_mode_never_reclaims_without_an_explicit_cleanup() {
    let clock = ManualClock::new(0);
    let ctx = reclaiming(&clock, true);
    let p = ctx
        .alloc(&AllocRequest::new(64).root().lifetime(Lifetime::Ticks(1)))
        .unwrap();
    unsafe { ctx.release(p.as_ptr()) };
    clock.set(1_000);

    let cycles = ctx.reclaimer_cycles();
    assert!(wait_until(|| ctx.reclaimer_cycles() >= cycles + 5));
    assert_eq!(ctx.root_count(), 1, "manual mode swept a root");

    assert_eq!(ctx.cleanup_roots(clock.now()), 1);
    assert_eq!(ctx.root_count(), 0);
    assert_eq!(ctx.bytes_in_use(), 0);
}

#[test]
fn switching_back_to_automatic_mode_resumes_sweeping() {
    let clock = ManualClock::new(0);
    let ctx = reclaiming(&clock, true);
    let p = ctx
        .alloc(&AllocRequest::new(64).root().lifetime(Lifetime::Ticks(1)))
        .unwrap();
    unsafe { ctx.release(p.as_ptr()) };
    clock.set(10);
    ctx.set_manual_cleanup(false);
    assert!(wait_until(|| ctx.root_count() == 0));
}

#[test]
fn pinned_roots_are_skipped_until_unpinned() {
    let clock = ManualClock::new(0);
    let ctx = reclaiming(&clock, false);
    let p = ctx
        .alloc(&AllocRequest::new(64).root().lifetime(Lifetime::Ticks(1)))
        .unwrap();
    unsafe {
        ctx.pin(p.as_ptr());
        ctx.release(p.as_ptr());
    }
    clock.set(10);
    let cycles = ctx.reclaimer_cycles();
    assert!(wait_until(|| ctx.reclaimer_cycles() >= cycles + 3));
    assert_eq!(ctx.root_count(), 1);
    unsafe { ctx.unpin(p.as_ptr()) };
    assert!(wait_until(|| ctx.root_count() == 0));
}

#[test]
fn dropping_the_context_releases_tracked_roots() {
    let clock = ManualClock::new(0);
    let ctx = reclaiming(&clock, false);
    for _ in 0..16 {
        ctx.alloc(&AllocRequest::new(512).root()).unwrap();
    }
    assert_eq!(ctx.root_count(), 16);
    ctx.shutdown();
    let cycles = ctx.reclaimer_cycles();
    std::thread::sleep(Duration::from_millis(10));
    assert_eq!(ctx.reclaimer_cycles(), cycles, "reclaimer still running after shutdown");
    drop(ctx);
}
