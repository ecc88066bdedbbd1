#![allow(unsafe_code)]

use std::ptr;

use tieralloc_core::{
    AllocFlags, AllocRequest, AllocatorConfig, AllocatorContext, BackingPool, BuddyConfig,
    CorruptionPolicy, Tier,
};

fn config() -> AllocatorConfig {
    AllocatorConfig {
        background_reclaimer: false,
        corruption_policy: CorruptionPolicy::Panic,
        ..AllocatorConfig::default()
    }
}

fn expected_tier(size: usize) -> Tier {
    match size {
        0..=120 => Tier::Pocket,
        121..=16_384 => Tier::Bump,
        _ => Tier::Buddy,
    }
}

#[test]
fn alloc_free_pairs_leave_bytes_in_use_unchanged() {
    let ctx = AllocatorContext::new(config()).unwrap();
    for size in [1usize, 64, 120, 121, 200, 16_384, 16_385, 1 << 20] {
        let before = ctx.bytes_in_use();
        let p = ctx.alloc(&AllocRequest::new(size)).unwrap();
        assert!(ctx.bytes_in_use() > before, "size={size}: charge missing");
        unsafe { ctx.free(p.as_ptr()) };
        assert_eq!(ctx.bytes_in_use(), before, "size={size}");
    }
    let m = ctx.metrics();
    assert_eq!(m.allocations, m.frees);
    assert!(m.peak_bytes_in_use >= 1 << 20);
}

#[test]
fn sizes_route_to_their_tier() {
    let ctx = AllocatorContext::new(config()).unwrap();
    let mut live = Vec::new();
    for size in [1usize, 64, 120, 121, 200, 16_384, 16_385, 1 << 20] {
        let p = ctx.alloc(&AllocRequest::new(size)).unwrap();
        let tier = unsafe { ctx.tier_of(p.as_ptr()) };
        assert_eq!(tier, Some(expected_tier(size)), "size={size}");
        assert!(ctx.owns(p.as_ptr()), "size={size}");
        live.push(p);
    }
    let m = ctx.metrics();
    assert_eq!((m.pocket_hits, m.bump_hits, m.buddy_hits), (3, 3, 2));
    for p in live {
        unsafe { ctx.free(p.as_ptr()) };
    }
}

#[test]
fn strict_small_blocks_still_fit_the_pocket_tier() {
    let ctx = AllocatorContext::new(config()).unwrap();
    let req = AllocRequest::new(120).flags(AllocFlags::STRICT_CHECK);
    let p = ctx.alloc(&req).unwrap();
    unsafe {
        assert_eq!(ctx.tier_of(p.as_ptr()), Some(Tier::Pocket));
        p.as_ptr().write_bytes(0xEE, 120);
        assert_eq!(ctx.access(p.as_ptr(), 0), Some(p));
        ctx.free(p.as_ptr());
    }
}

#[test]
fn blocks_past_the_segment_cap_fall_through_to_general() {
    let ctx = AllocatorContext::new(AllocatorConfig {
        buddy: BuddyConfig {
            max_segment_bytes: 1 << 20,
            ..BuddyConfig::default()
        },
        ..config()
    })
    .unwrap();
    let p = ctx.alloc(&AllocRequest::new(1 << 20)).unwrap();
    unsafe {
        assert_eq!(ctx.tier_of(p.as_ptr()), Some(Tier::General));
        p.as_ptr().write_bytes(1, 1 << 20);
        ctx.free(p.as_ptr());
    }
    assert_eq!(ctx.bytes_in_use(), 0);
    assert_eq!(ctx.metrics().general_hits, 1);
}

#[test]
fn huge_page_requests_use_the_general_tier() {
    let ctx = AllocatorContext::new(config()).unwrap();
    let p = ctx
        .alloc(&AllocRequest::new(4096).flags(AllocFlags::HUGE_PAGES))
        .unwrap();
    unsafe {
        assert_eq!(ctx.tier_of(p.as_ptr()), Some(Tier::General));
        p.as_ptr().write_bytes(0x11, 4096);
        ctx.free(p.as_ptr());
    }
    assert_eq!(ctx.bytes_in_use(), 0);
}

#[test]
fn repeated_free_of_a_general_block_is_counted() {
    let ctx = AllocatorContext::new(AllocatorConfig {
        buddy: BuddyConfig {
            max_segment_bytes: 64 * 1024,
            ..BuddyConfig::default()
        },
        ..config()
    })
    .unwrap();
    let p = ctx.alloc(&AllocRequest::new(100_000)).unwrap();
    unsafe {
        assert_eq!(ctx.tier_of(p.as_ptr()), Some(Tier::General));
        ctx.free(p.as_ptr());
        ctx.free(p.as_ptr());
    }
    let m = ctx.metrics();
    assert_eq!(m.frees, 1);
    assert_eq!(m.double_frees_ignored, 1);
    assert_eq!(ctx.bytes_in_use(), 0);
    assert_eq!(ctx.tier_usage().general_blocks, 0);
}

#[test]
fn repeated_free_of_a_huge_block_is_counted() {
    let ctx = AllocatorContext::new(config()).unwrap();
    let p = ctx
        .alloc(&AllocRequest::new(4096).flags(AllocFlags::HUGE_PAGES))
        .unwrap();
    unsafe {
        ctx.free(p.as_ptr());
        ctx.free(p.as_ptr());
    }
    assert_eq!(ctx.metrics().double_frees_ignored, 1);
    assert_eq!(ctx.bytes_in_use(), 0);
}

#[test]
fn embedded_contexts_route_everything_to_buddy() {
    let pool = BackingPool::anonymous(1 << 20).unwrap();
    let ctx = AllocatorContext::new(AllocatorConfig {
        background_reclaimer: false,
        corruption_policy: CorruptionPolicy::Panic,
        ..AllocatorConfig::embedded(pool)
    })
    .unwrap();
    assert!(ctx.is_embedded());
    for size in [1usize, 120, 121, 16_384, 16_385] {
        let p = ctx.alloc(&AllocRequest::new(size)).unwrap();
        unsafe {
            assert_eq!(ctx.tier_of(p.as_ptr()), Some(Tier::Buddy), "size={size}");
            ctx.free(p.as_ptr());
        }
    }
    assert_eq!(ctx.buddy_segments(), 1);
}

#[test]
fn double_free_leaves_neighbours_intact() {
    let ctx = AllocatorContext::new(config()).unwrap();
    for size in [32usize, 500, 20_000] {
        let victim = ctx.alloc(&AllocRequest::new(size)).unwrap();
        let neighbour = ctx.alloc(&AllocRequest::new(size)).unwrap();
        unsafe {
            neighbour.as_ptr().write_bytes(0xC3, size);
            ctx.free(victim.as_ptr());
            ctx.free(victim.as_ptr());
            assert_eq!(ctx.access(neighbour.as_ptr(), 0), Some(neighbour), "size={size}");
            let bytes = std::slice::from_raw_parts(neighbour.as_ptr(), size);
            assert!(bytes.iter().all(|&b| b == 0xC3), "size={size}");
            ctx.free(neighbour.as_ptr());
        }
    }
    assert_eq!(ctx.metrics().double_frees_ignored, 3);
    assert_eq!(ctx.bytes_in_use(), 0);
}

#[test]
fn null_and_foreign_pointers_are_harmless_to_queries() {
    let ctx = AllocatorContext::new(config()).unwrap();
    let local = [0u8; 16];
    assert!(!ctx.owns(local.as_ptr()));
    assert!(ctx.root_info(local.as_ptr()).is_none());
    unsafe {
        ctx.free(ptr::null_mut());
        assert_eq!(ctx.access(ptr::null_mut(), 0), None);
        assert_eq!(ctx.retain(ptr::null_mut()), None);
        assert_eq!(ctx.tier_of(ptr::null_mut()), None);
    }
    assert_eq!(ctx.metrics().frees, 0);
}

#[test]
fn pressure_flag_tracks_the_high_watermark() {
    let ctx = AllocatorContext::new(AllocatorConfig {
        high_watermark: 64 * 1024,
        ..config()
    })
    .unwrap();
    assert!(!ctx.is_pressure_high());
    let p = ctx.alloc(&AllocRequest::new(100_000)).unwrap();
    assert!(ctx.is_pressure_high());
    unsafe { ctx.free(p.as_ptr()) };
    assert!(!ctx.is_pressure_high());
}
