#![no_main]
use libfuzzer_sys::fuzz_target;
use tieralloc_core::{
    AllocFlags, AllocRequest, AllocatorConfig, AllocatorContext, CorruptionPolicy, Lifetime,
};

// Each 4-byte chunk is one operation: opcode, flag bits, little-endian size.
fuzz_target!(|data: &[u8]| {
    if data.len() < 4 {
        return;
    }

    let ctx = AllocatorContext::new(AllocatorConfig {
        background_reclaimer: false,
        corruption_policy: CorruptionPolicy::Panic,
        ..AllocatorConfig::default()
    })
    .expect("context");
    let mut live: Vec<(*mut u8, usize)> = Vec::new();

    for (step, chunk) in data.chunks_exact(4).enumerate() {
        let op = chunk[0] % 6;
        let bits = chunk[1];
        let size = (u16::from_le_bytes([chunk[2], chunk[3]]) as usize) << (bits >> 6);
        let now = step as u64;

        match op {
            0 => {
                let mut req = AllocRequest::new(size)
                    .at(now)
                    .flags(AllocFlags::from_bits_truncate(u32::from(bits & 0x07)));
                if bits & 0x08 != 0 {
                    req = req.root().lifetime(Lifetime::Ticks(u64::from(bits & 0x30) + 1));
                }
                if let Ok(p) = ctx.alloc(&req) {
                    unsafe { p.as_ptr().write_bytes(0xA5, size) };
                    live.push((p.as_ptr(), size));
                }
            }
            1 => {
                if let Some((p, _)) = live.pop() {
                    unsafe { ctx.free(p) };
                }
            }
            2 => {
                if let Some(slot) = live.last_mut() {
                    if let Ok(q) = unsafe { ctx.realloc(slot.0, &AllocRequest::new(size)) } {
                        unsafe { q.as_ptr().write_bytes(0x5A, size) };
                        *slot = (q.as_ptr(), size);
                    }
                }
            }
            3 => {
                if let Some(&(p, len)) = live.last() {
                    if let Ok(q) = unsafe { ctx.dup(p, &AllocRequest::new(len)) } {
                        live.push((q.as_ptr(), len));
                    }
                }
            }
            4 => {
                if let Some(&(p, _)) = live.first() {
                    let _ = unsafe { ctx.access(p, now) };
                }
            }
            _ => {
                // A root released to zero belongs to the reclaimer from here on.
                if let Some((p, _)) = live.pop() {
                    if unsafe { ctx.release(p) } != Some(0) {
                        unsafe { ctx.free(p) };
                    }
                }
                ctx.cleanup_roots(now);
            }
        }
    }

    for (p, _) in live {
        unsafe { ctx.free(p) };
    }
    ctx.cleanup_roots(u64::MAX - 1);
    assert_eq!(ctx.bytes_in_use(), 0);
    assert!(ctx.check_buddy_invariants().is_ok());
});
