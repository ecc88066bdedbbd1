//! Bump tier: one lazily reserved range carved by a lock-free cursor.
//!
//! Individual blocks are never reclaimed; the range goes back to the OS when
//! the tier is dropped.

#![allow(unsafe_code)]

use std::ptr::NonNull;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::os;
use crate::thread_ctx::BootstrapScope;

pub(crate) const BUMP_GRANULE: usize = 64;

struct BumpRegion {
    base: NonNull<u8>,
    len: usize,
    cursor: AtomicUsize,
}

// SAFETY: the region is plain memory; disjoint carves are handed out through
// the atomic cursor.
unsafe impl Send for BumpRegion {}
// SAFETY: as above.
unsafe impl Sync for BumpRegion {}

pub(crate) struct BumpTier {
    region_bytes: usize,
    region: OnceLock<Option<BumpRegion>>,
}

impl BumpTier {
    pub(crate) const fn new(region_bytes: usize) -> Self {
        Self {
            region_bytes,
            region: OnceLock::new(),
        }
    }

    fn region(&self) -> Option<&BumpRegion> {
        self.region
            .get_or_init(|| {
                let _scope = BootstrapScope::enter();
                os::map(self.region_bytes).map(|base| BumpRegion {
                    base,
                    len: self.region_bytes,
                    cursor: AtomicUsize::new(0),
                })
            })
            .as_ref()
    }

    /// Bytes a `total`-byte request consumes.
    pub(crate) const fn footprint(total: usize) -> usize {
        os::align_up(total, BUMP_GRANULE)
    }

    /// 64-byte aligned block of at least `total` bytes, or `None` once the
    /// range is exhausted.
    pub(crate) fn alloc(&self, total: usize) -> Option<NonNull<u8>> {
        let region = self.region()?;
        let size = os::checked_align_up(total, BUMP_GRANULE)?;
        let mut cur = region.cursor.load(Ordering::Relaxed);
        loop {
            let next = cur.checked_add(size)?;
            if next > region.len {
                return None;
            }
            match region
                .cursor
                .compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => {
                    // SAFETY: `cur + size <= len`, so the carve is in range.
                    return Some(unsafe { NonNull::new_unchecked(region.base.as_ptr().add(cur)) });
                }
                Err(actual) => cur = actual,
            }
        }
    }

    pub(crate) fn owns(&self, addr: usize) -> bool {
        match self.region.get() {
            Some(Some(region)) => {
                let base = region.base.as_ptr() as usize;
                addr >= base && addr < base + region.cursor.load(Ordering::Acquire)
            }
            _ => false,
        }
    }

    pub(crate) fn used(&self) -> usize {
        match self.region.get() {
            Some(Some(region)) => region.cursor.load(Ordering::Relaxed),
            _ => 0,
        }
    }
}

impl Drop for BumpTier {
    fn drop(&mut self) {
        if let Some(Some(region)) = self.region.get() {
            // SAFETY: mapped in `region()`; nothing outlives the tier.
            unsafe { os::unmap(region.base, region.len) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn carves_are_aligned_and_monotonic() {
        let t = BumpTier::new(64 * 1024);
        let a = t.alloc(200).unwrap();
        let b = t.alloc(1).unwrap();
        assert_eq!(a.as_ptr() as usize % 64, 0);
        assert_eq!(b.as_ptr() as usize - a.as_ptr() as usize, 256);
        assert_eq!(t.used(), 320);
        assert!(t.owns(a.as_ptr() as usize));
        assert!(!t.owns(b.as_ptr() as usize + 64));
    }

    #[test]
    fn exhaustion_returns_none() {
        let t = BumpTier::new(4096);
        assert!(t.alloc(4096).is_some());
        assert!(t.alloc(1).is_none());
    }

    #[test]
    fn concurrent_carves_never_overlap() {
        let t = Arc::new(BumpTier::new(1 << 20));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let t = Arc::clone(&t);
                std::thread::spawn(move || {
                    (0..500)
                        .filter_map(|_| t.alloc(100).map(|p| p.as_ptr() as usize))
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut seen = HashSet::new();
        for h in handles {
            for addr in h.join().unwrap() {
                assert!(seen.insert(addr), "duplicate carve at {addr:#x}");
            }
        }
        assert_eq!(seen.len(), 2000);
        assert_eq!(t.used(), 2000 * 128);
    }

    #[test]
    fn footprint_rounds_to_granule() {
        assert_eq!(BumpTier::footprint(129), 192);
        assert_eq!(BumpTier::footprint(192), 192);
    }
}
