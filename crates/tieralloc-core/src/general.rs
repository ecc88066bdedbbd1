//! General tier: blocks too large for the buddy zone, huge-page mappings and
//! bootstrap bypasses, served straight from the system allocator or the OS.
//!
//! Live blocks are tracked in a sharded address table so `free` can recover
//! the exact length the allocation path used, and `owns` can answer for them.

#![allow(unsafe_code)]

use std::collections::HashMap;
use std::ptr::NonNull;

use parking_lot::Mutex;

use crate::os;

/// Number of shards for the block table (power of 2).
const NUM_SHARDS: usize = 16;
const GENERAL_ALIGN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct GeneralBlock {
    pub(crate) len: usize,
    /// Backed by a `MAP_HUGETLB` mapping rather than the system allocator.
    pub(crate) huge: bool,
}

pub(crate) struct GeneralTier {
    shards: Box<[Mutex<HashMap<usize, GeneralBlock>>]>,
}

impl GeneralTier {
    pub(crate) fn new() -> Self {
        Self {
            shards: (0..NUM_SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn shard_for(addr: usize) -> usize {
        (addr >> 12) % NUM_SHARDS
    }

    /// 64-byte aligned block of at least `len` bytes. With `huge` a huge-page
    /// mapping is tried first; the returned flag says whether it was used.
    pub(crate) fn alloc(&self, len: usize, huge: bool) -> Option<(NonNull<u8>, GeneralBlock)> {
        if huge {
            if let Some(rounded) = os::checked_align_up(len, os::HUGE_PAGE_SIZE) {
                if let Some(base) = os::map_huge(rounded) {
                    let block = GeneralBlock { len: rounded, huge: true };
                    self.track(base, block);
                    return Some((base, block));
                }
            }
        }
        let base = os::aligned_alloc(len, GENERAL_ALIGN)?;
        let block = GeneralBlock { len, huge: false };
        self.track(base, block);
        Some((base, block))
    }

    fn track(&self, base: NonNull<u8>, block: GeneralBlock) {
        let addr = base.as_ptr() as usize;
        self.shards[Self::shard_for(addr)].lock().insert(addr, block);
    }

    /// Release a block; `None` when `base` is not a live block of this tier.
    ///
    /// # Safety
    ///
    /// Nothing may touch the block after this returns `Some`.
    pub(crate) unsafe fn free(&self, base: NonNull<u8>) -> Option<GeneralBlock> {
        let addr = base.as_ptr() as usize;
        let block = self.shards[Self::shard_for(addr)].lock().remove(&addr)?;
        // SAFETY: the entry was live until we removed it, so the block came
        // from the matching allocation call and is released once.
        unsafe { release(base, block) };
        Some(block)
    }

    /// True when `addr` falls inside any live block.
    pub(crate) fn owns(&self, addr: usize) -> bool {
        self.shards.iter().any(|shard| {
            shard
                .lock()
                .iter()
                .any(|(&base, b)| addr >= base && addr < base + b.len)
        })
    }

    /// True when `base` is the start of a live block.
    pub(crate) fn tracks(&self, base: usize) -> bool {
        self.shards[Self::shard_for(base)].lock().contains_key(&base)
    }

    pub(crate) fn live_count(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }
}

/// # Safety
///
/// `base`/`block` must describe a live, untracked block of this tier.
unsafe fn release(base: NonNull<u8>, block: GeneralBlock) {
    if block.huge {
        // SAFETY: forwarded.
        unsafe { os::unmap(base, block.len) };
    } else {
        // SAFETY: forwarded.
        unsafe { os::aligned_free(base) };
    }
}

impl Drop for GeneralTier {
    fn drop(&mut self) {
        for shard in self.shards.iter_mut() {
            for (addr, block) in shard.get_mut().drain() {
                if let Some(base) = NonNull::new(addr as *mut u8) {
                    // SAFETY: still tracked, so never released.
                    unsafe { release(base, block) };
                }
            }
        }
    }
}
