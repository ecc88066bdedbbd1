//! Atomic counters for allocator observability.
//!
//! All counters use relaxed ordering; they are diagnostic, not
//! synchronization primitives. `bytes_in_use` counts full block footprints
//! (header and padding included), so an alloc/free pair leaves it unchanged.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::header::Tier;

/// Per-context operation counters.
#[derive(Debug)]
pub struct AllocatorMetrics {
    pub allocations: AtomicU64,
    pub frees: AtomicU64,
    /// Second and later frees of the same block.
    pub double_frees_ignored: AtomicU64,
    pub pocket_hits: AtomicU64,
    pub bump_hits: AtomicU64,
    pub buddy_hits: AtomicU64,
    pub general_hits: AtomicU64,
    /// Bootstrap allocations that skipped every tier.
    pub raw_bypasses: AtomicU64,
    /// Emergency reclaim-and-retry passes.
    pub reclaim_retries: AtomicU64,
    pub exhaustion_failures: AtomicU64,
    pub friction_rejections: AtomicU64,
    pub buddy_growths: AtomicU64,
    pub defrag_passes: AtomicU64,
    pub defrag_merges: AtomicU64,
    /// Roots freed by the reclaimer, `cleanup_roots` or `autoclean`.
    pub roots_reclaimed: AtomicU64,
    pub bytes_in_use: AtomicU64,
    pub peak_bytes_in_use: AtomicU64,
}

impl AllocatorMetrics {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            allocations: AtomicU64::new(0),
            frees: AtomicU64::new(0),
            double_frees_ignored: AtomicU64::new(0),
            pocket_hits: AtomicU64::new(0),
            bump_hits: AtomicU64::new(0),
            buddy_hits: AtomicU64::new(0),
            general_hits: AtomicU64::new(0),
            raw_bypasses: AtomicU64::new(0),
            reclaim_retries: AtomicU64::new(0),
            exhaustion_failures: AtomicU64::new(0),
            friction_rejections: AtomicU64::new(0),
            buddy_growths: AtomicU64::new(0),
            defrag_passes: AtomicU64::new(0),
            defrag_merges: AtomicU64::new(0),
            roots_reclaimed: AtomicU64::new(0),
            bytes_in_use: AtomicU64::new(0),
            peak_bytes_in_use: AtomicU64::new(0),
        }
    }

    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    pub(crate) fn tier_hit(&self, tier: Tier) {
        let counter = match tier {
            Tier::Pocket => &self.pocket_hits,
            Tier::Bump => &self.bump_hits,
            Tier::Buddy => &self.buddy_hits,
            Tier::General => &self.general_hits,
            Tier::Raw => &self.raw_bypasses,
        };
        Self::inc(counter);
    }

    pub(crate) fn charge(&self, bytes: usize) {
        let now = self.bytes_in_use.fetch_add(bytes as u64, Ordering::Relaxed) + bytes as u64;
        self.peak_bytes_in_use.fetch_max(now, Ordering::Relaxed);
    }

    /// Saturates at zero.
    pub(crate) fn credit(&self, bytes: usize) {
        let _ = self
            .bytes_in_use
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |cur| {
                Some(cur.saturating_sub(bytes as u64))
            });
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            allocations: Self::get(&self.allocations),
            frees: Self::get(&self.frees),
            double_frees_ignored: Self::get(&self.double_frees_ignored),
            pocket_hits: Self::get(&self.pocket_hits),
            bump_hits: Self::get(&self.bump_hits),
            buddy_hits: Self::get(&self.buddy_hits),
            general_hits: Self::get(&self.general_hits),
            raw_bypasses: Self::get(&self.raw_bypasses),
            reclaim_retries: Self::get(&self.reclaim_retries),
            exhaustion_failures: Self::get(&self.exhaustion_failures),
            friction_rejections: Self::get(&self.friction_rejections),
            buddy_growths: Self::get(&self.buddy_growths),
            defrag_passes: Self::get(&self.defrag_passes),
            defrag_merges: Self::get(&self.defrag_merges),
            roots_reclaimed: Self::get(&self.roots_reclaimed),
            bytes_in_use: Self::get(&self.bytes_in_use),
            peak_bytes_in_use: Self::get(&self.peak_bytes_in_use),
        }
    }
}

impl Default for AllocatorMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of every counter.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub allocations: u64,
    pub frees: u64,
    pub double_frees_ignored: u64,
    pub pocket_hits: u64,
    pub bump_hits: u64,
    pub buddy_hits: u64,
    pub general_hits: u64,
    pub raw_bypasses: u64,
    pub reclaim_retries: u64,
    pub exhaustion_failures: u64,
    pub friction_rejections: u64,
    pub buddy_growths: u64,
    pub defrag_passes: u64,
    pub defrag_merges: u64,
    pub roots_reclaimed: u64,
    pub bytes_in_use: u64,
    pub peak_bytes_in_use: u64,
}

/// Occupancy of each tier's backing memory at one instant.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierUsage {
    /// 4 KiB pages carved for the pocket tier.
    pub pocket_pages: usize,
    /// Bump cursor offset; carved bytes are never given back.
    pub bump_carved: usize,
    pub buddy_used: usize,
    pub buddy_capacity: usize,
    pub buddy_segments: usize,
    /// Outstanding system or direct-mapped blocks.
    pub general_blocks: usize,
}
