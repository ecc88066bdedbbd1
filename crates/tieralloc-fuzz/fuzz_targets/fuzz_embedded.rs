#![no_main]
use libfuzzer_sys::fuzz_target;
use tieralloc_core::{AllocRequest, AllocatorConfig, AllocatorContext, BackingPool, CorruptionPolicy};

// Alloc/free sequences against a small embedded pool. The zone must be
// consistent at every checkpoint and fully free at the end.
fuzz_target!(|data: &[u8]| {
    if data.len() < 3 {
        return;
    }

    let pool = BackingPool::anonymous(256 * 1024).expect("pool");
    let ctx = AllocatorContext::new(AllocatorConfig {
        background_reclaimer: false,
        corruption_policy: CorruptionPolicy::Panic,
        ..AllocatorConfig::embedded(pool)
    })
    .expect("context");
    let mut live = Vec::new();

    for (step, chunk) in data.chunks_exact(3).enumerate() {
        let size = u16::from_le_bytes([chunk[1], chunk[2]]) as usize;
        if chunk[0] & 1 == 0 {
            if let Ok(p) = ctx.alloc(&AllocRequest::new(size)) {
                live.push(p);
            }
        } else if !live.is_empty() {
            let p = live.swap_remove(chunk[0] as usize % live.len());
            unsafe { ctx.free(p.as_ptr()) };
        }
        if step % 64 == 63 {
            let report = ctx.check_buddy_invariants().expect("buddy invariants");
            assert!(report.free_bytes <= report.capacity);
        }
    }

    for p in live {
        unsafe { ctx.free(p.as_ptr()) };
    }
    let report = ctx.check_buddy_invariants().expect("buddy invariants");
    assert_eq!(report.free_bytes, report.capacity);
    assert_eq!(report.unmerged_pairs, 0);
});
