#![allow(unsafe_code)]

use std::collections::HashSet;

use tieralloc_core::{
    AllocRequest, AllocatorConfig, AllocatorContext, BackingPool, BuddyConfig, CorruptionPolicy,
    Tier,
};

fn embedded(pool_bytes: usize, buddy: BuddyConfig) -> AllocatorContext {
    let pool = BackingPool::anonymous(pool_bytes).expect("pool");
    AllocatorContext::new(AllocatorConfig {
        buddy,
        background_reclaimer: false,
        corruption_policy: CorruptionPolicy::Panic,
        ..AllocatorConfig::embedded(pool)
    })
    .expect("context")
}

#[test]
fn ten_thousand_blocks_grow_past_a_one_mib_pool() {
    const COUNT: usize = 10_000;
    let ctx = embedded(1 << 20, BuddyConfig::default());
    let initial = ctx.buddy_capacity();
    assert_eq!(initial, 1 << 20);

    let mut seen = HashSet::with_capacity(COUNT);
    let mut ptrs = Vec::with_capacity(COUNT);
    for i in 0..COUNT {
        let p = ctx
            .alloc(&AllocRequest::new(64))
            .unwrap_or_else(|e| panic!("step={i}: {e}"));
        assert!(seen.insert(p.as_ptr() as usize), "step={i}: pointer handed out twice");
        unsafe {
            p.as_ptr().cast::<u64>().write(i as u64);
            p.as_ptr().add(56).cast::<u64>().write(!(i as u64));
        }
        ptrs.push(p);
    }

    assert!(ctx.buddy_capacity() > initial, "zone never grew");
    assert!(ctx.buddy_segments() > 1);
    let m = ctx.metrics();
    assert!(m.buddy_growths >= 1);
    assert_eq!(m.buddy_hits, COUNT as u64);
    assert_eq!(m.exhaustion_failures, 0);

    for (i, p) in ptrs.iter().enumerate() {
        unsafe {
            assert_eq!(p.as_ptr().cast::<u64>().read(), i as u64, "step={i}");
            assert_eq!(p.as_ptr().add(56).cast::<u64>().read(), !(i as u64), "step={i}");
            assert_eq!(ctx.tier_of(p.as_ptr()), Some(Tier::Buddy), "step={i}");
        }
    }
    for p in &ptrs {
        unsafe { ctx.free(p.as_ptr()) };
    }
    let report = ctx.check_buddy_invariants().unwrap();
    assert_eq!(report.free_bytes, report.capacity);
    assert_eq!(report.segments, ctx.buddy_segments());
    assert_eq!(ctx.bytes_in_use(), 0);
}

#[test]
fn segment_cap_turns_growth_into_exhaustion() {
    let ctx = embedded(
        64 * 1024,
        BuddyConfig {
            max_segments: 1,
            ..BuddyConfig::default()
        },
    );
    let mut live = Vec::new();
    let err = loop {
        match ctx.alloc(&AllocRequest::new(1000)) {
            Ok(p) => live.push(p),
            Err(e) => break e,
        }
        assert!(live.len() <= 64, "allocated past the pool");
    };
    assert!(matches!(err, tieralloc_core::AllocError::Exhausted { size: 1000 }));
    // 1000 + header needs a 2 KiB block: 32 of them fill the pool.
    assert_eq!(live.len(), 32);
    assert_eq!(ctx.buddy_segments(), 1);
    let m = ctx.metrics();
    assert_eq!(m.exhaustion_failures, 1);
    assert_eq!(m.reclaim_retries, 1);

    // Freeing one block makes room again.
    let p = live.pop().unwrap();
    unsafe { ctx.free(p.as_ptr()) };
    let again = ctx.alloc(&AllocRequest::new(1000)).unwrap();
    live.push(again);
    for p in live {
        unsafe { ctx.free(p.as_ptr()) };
    }
}
