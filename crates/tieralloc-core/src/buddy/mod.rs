//! Buddy tier: segmented power-of-two allocator with on-demand growth.
//!
//! Free blocks live on one intrusive list per order (6..=60). A bitmask with
//! one bit per order marks the non-empty lists so selection is a single
//! `trailing_zeros`/`leading_zeros`. Each bit is set and cleared under its
//! order's lock.
//!
//! Freed blocks are not recycled directly. They are marked retired and handed
//! to the [`Reclaim`] collaborator; its cleanup merges the block with its
//! buddy (offset XOR size, within the segment) while the buddy is free at the
//! same order, then pushes the result. The buddy check and the push happen in
//! one critical section on the order's lock, so two buddies freed at the same
//! time always meet.

#![allow(unsafe_code)]

pub mod block;
pub(crate) mod list;
pub mod segment;

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use self::block::{
    BLOCK_HEADER_SIZE, BlockHeader, BlockKind, BlockState, MAX_ORDER, MIN_ORDER, order_for,
};
use self::list::OrderList;
use self::segment::{MAX_SEGMENT_SLOTS, Segment, SegmentTable};
use crate::config::{BackingPool, BuddyConfig};
use crate::epoch::Reclaim;
use crate::error::CorruptionKind;
use crate::metrics::AllocatorMetrics;
use crate::os;
use crate::thread_ctx::BootstrapScope;

/// Races tolerated while taking a block off a list the bitmask said was
/// non-empty.
const TAKE_RETRIES: usize = 8;

/// Which non-empty order to split from.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FitPolicy {
    /// Lowest non-empty order at or above the target.
    #[default]
    BestFit,
    /// Highest non-empty order.
    WorstFit,
    /// Lowest non-empty order, without any preference bookkeeping.
    FirstFit,
}

impl FitPolicy {
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "worst" | "worst_fit" | "worst-fit" => Self::WorstFit,
            "first" | "first_fit" | "first-fit" => Self::FirstFit,
            _ => Self::BestFit,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuddyRequest {
    /// Usable bytes wanted after the block header.
    pub size: usize,
    pub policy: FitPolicy,
    /// Stored in the block header for diagnostics.
    pub owner_tag: u32,
}

impl BuddyRequest {
    #[must_use]
    pub const fn new(size: usize) -> Self {
        Self {
            size,
            policy: FitPolicy::BestFit,
            owner_tag: 0,
        }
    }

    #[must_use]
    pub const fn policy(mut self, policy: FitPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub const fn owner_tag(mut self, tag: u32) -> Self {
        self.owner_tag = tag;
        self
    }
}

/// Free-list summary from a successful invariant check.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuddyReport {
    pub free_blocks: usize,
    pub free_bytes: usize,
    pub capacity: usize,
    pub segments: usize,
    /// Free buddies of equal order that were never merged.
    pub unmerged_pairs: usize,
}

/// First broken invariant found by [`BuddyZone::check_invariants`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("buddy invariant broken in segment {segment} at offset {offset:#x} (order {order}): {reason}")]
pub struct BuddyViolation {
    pub segment: usize,
    pub offset: usize,
    pub order: u32,
    pub reason: &'static str,
}

pub struct BuddyZone {
    lists: Box<[OrderList]>,
    nonempty: AtomicU64,
    segments: SegmentTable,
    capacity: AtomicUsize,
    used: AtomicUsize,
    grow_lock: Mutex<()>,
    defrag_lock: Mutex<()>,
    config: BuddyConfig,
    _pool: Option<Arc<BackingPool>>,
    reclaim: Arc<dyn Reclaim>,
    metrics: Arc<AllocatorMetrics>,
    this: Weak<BuddyZone>,
}

impl std::fmt::Debug for BuddyZone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuddyZone")
            .field("segments", &self.segments.len())
            .field("capacity", &self.capacity())
            .field("used", &self.used())
            .finish_non_exhaustive()
    }
}

impl BuddyZone {
    /// Build a zone, seeded with `pool` when given. Without a pool the first
    /// allocation grows the zone.
    #[must_use]
    pub fn new(
        config: BuddyConfig,
        pool: Option<Arc<BackingPool>>,
        reclaim: Arc<dyn Reclaim>,
        metrics: Arc<AllocatorMetrics>,
    ) -> Arc<Self> {
        let zone = Arc::new_cyclic(|this| Self {
            lists: (MIN_ORDER..=MAX_ORDER).map(OrderList::for_order).collect(),
            nonempty: AtomicU64::new(0),
            segments: SegmentTable::new(),
            capacity: AtomicUsize::new(0),
            used: AtomicUsize::new(0),
            grow_lock: Mutex::new(()),
            defrag_lock: Mutex::new(()),
            config,
            _pool: pool.clone(),
            reclaim,
            metrics,
            this: this.clone(),
        });
        if let Some(pool) = pool {
            let start = os::align_up(pool.base().as_ptr() as usize, BLOCK_HEADER_SIZE);
            let end = (pool.base().as_ptr() as usize + pool.len()) & !(BLOCK_HEADER_SIZE - 1);
            if end > start {
                let _guard = zone.grow_lock.lock();
                zone.install(start, end - start, false);
            }
        }
        zone
    }

    fn list(&self, order: u32) -> &OrderList {
        &self.lists[(order - MIN_ORDER) as usize]
    }

    /// Bytes a request for `size` usable bytes consumes.
    #[must_use]
    pub fn block_size_for(size: usize) -> Option<usize> {
        order_for(size.checked_add(BLOCK_HEADER_SIZE)?).map(|o| 1usize << o)
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    #[must_use]
    pub fn segment(&self, idx: usize) -> Option<Segment> {
        self.segments.get(idx)
    }

    #[must_use]
    pub fn owns(&self, addr: usize) -> bool {
        self.segments.find(addr).is_some()
    }

    // -----------------------------------------------------------------------
    // Allocation
    // -----------------------------------------------------------------------

    /// Returns the usable region (just past the block header).
    pub fn alloc(&self, req: &BuddyRequest) -> Option<NonNull<u8>> {
        let order = order_for(req.size.checked_add(BLOCK_HEADER_SIZE)?)?;
        if self.needs_growth(order) {
            self.grow(order);
        }
        if let Some(block) = self.take(order, req) {
            return Some(block);
        }
        if self.grow(order) {
            if let Some(block) = self.take(order, req) {
                return Some(block);
            }
        }
        self.reclaim.flush();
        self.defragment();
        self.take(order, req)
    }

    fn needs_growth(&self, order: u32) -> bool {
        let largest = self.segments.iter().map(|(_, s)| s.max_order).max();
        if largest.is_none_or(|m| m < order) {
            return true;
        }
        let cap = self.capacity() as u128;
        let used = self.used() as u128;
        used * 1000 > cap * u128::from(self.config.growth_utilization_permille)
    }

    fn take(&self, order: u32, req: &BuddyRequest) -> Option<NonNull<u8>> {
        for _ in 0..TAKE_RETRIES {
            let mask = self.nonempty.load(Ordering::Acquire) & !((1u64 << order) - 1);
            if mask == 0 {
                return None;
            }
            let from = match req.policy {
                FitPolicy::BestFit | FitPolicy::FirstFit => mask.trailing_zeros(),
                FitPolicy::WorstFit => 63 - mask.leading_zeros(),
            };
            let popped = self.list(from).with(|list| {
                let block = list.pop()?;
                if list.is_empty() {
                    self.nonempty.fetch_and(!(1u64 << from), Ordering::AcqRel);
                }
                // SAFETY: members of a free list are valid headers.
                unsafe { (*block).set_state(BlockState::new(BlockKind::InUse, from)) };
                Some(block)
            });
            let Some(block) = popped else {
                continue;
            };
            // SAFETY: the block was just taken off a list and is ours.
            let header = unsafe { &*block };
            let segment = header.segment;
            let mut current = from;
            while current > order {
                current -= 1;
                let upper = (block as usize + (1usize << current)) as *mut BlockHeader;
                header.set_state(BlockState::new(BlockKind::InUse, current));
                // SAFETY: the upper half lies inside our block and is unseen.
                unsafe {
                    BlockHeader::init(upper, BlockState::new(BlockKind::Free, current), segment);
                    self.push_free(upper, current);
                }
            }
            // SAFETY: other threads only ever read this header's state.
            unsafe { (*block).owner_tag = req.owner_tag };
            self.used.fetch_add(1usize << order, Ordering::Relaxed);
            // SAFETY: the usable region follows the block header.
            return Some(unsafe { NonNull::new_unchecked((block as *mut u8).add(BLOCK_HEADER_SIZE)) });
        }
        None
    }

    /// # Safety
    ///
    /// `block` must be a valid header already stamped `Free(order)` and on no
    /// list.
    unsafe fn push_free(&self, block: *mut BlockHeader, order: u32) {
        self.list(order).with(|list| {
            // SAFETY: forwarded.
            unsafe { list.push(block) };
            self.nonempty.fetch_or(1u64 << order, Ordering::AcqRel);
        });
    }

    // -----------------------------------------------------------------------
    // Growth
    // -----------------------------------------------------------------------

    fn grow(&self, order: u32) -> bool {
        let _guard = self.grow_lock.lock();
        if !self.needs_growth(order) && self.nonempty.load(Ordering::Acquire) >> order != 0 {
            return true;
        }
        let count = self.segments.len();
        if count >= self.config.max_segments.min(MAX_SEGMENT_SLOTS) {
            return false;
        }
        let Some(wanted) = self
            .capacity()
            .saturating_mul(2)
            .max(self.config.min_growth_chunk)
            .max(1usize << order)
            .checked_next_power_of_two()
        else {
            return false;
        };
        let len = wanted.min(self.config.max_segment_bytes);
        if len < (1usize << order) {
            return false;
        }
        let base = {
            let _scope = BootstrapScope::enter();
            os::map(len)
        };
        let Some(base) = base else {
            return false;
        };
        if self.install(base.as_ptr() as usize, len, true) {
            AllocatorMetrics::inc(&self.metrics.buddy_growths);
            true
        } else {
            // SAFETY: mapped just above and never published.
            unsafe { os::unmap(base, len) };
            false
        }
    }

    /// Publish a segment and put its top-level blocks on the free lists.
    /// Caller holds `grow_lock`.
    fn install(&self, base: usize, len: usize, owned: bool) -> bool {
        let carved = Segment::carve(len);
        let Some(&(_, max_order)) = carved.first() else {
            return false;
        };
        if max_order > MAX_ORDER {
            return false;
        }
        let seg = Segment {
            base,
            len,
            owned,
            max_order,
        };
        let Some(idx) = self.segments.publish(seg) else {
            return false;
        };
        for (offset, order) in carved {
            let at = (base + offset) as *mut BlockHeader;
            // SAFETY: fresh, exclusively owned segment memory.
            unsafe {
                BlockHeader::init(at, BlockState::new(BlockKind::Free, order), idx);
                self.push_free(at, order);
            }
        }
        self.capacity.fetch_add(len, Ordering::AcqRel);
        true
    }

    // -----------------------------------------------------------------------
    // Free and coalescing
    // -----------------------------------------------------------------------

    /// Retire a block; it becomes reusable after the reclamation grace period.
    /// Returns the block size.
    ///
    /// # Safety
    ///
    /// `usable` must have been returned by [`Self::alloc`] on this zone.
    pub unsafe fn free(&self, usable: NonNull<u8>) -> Result<usize, CorruptionKind> {
        let block = (usable.as_ptr() as usize - BLOCK_HEADER_SIZE) as *mut BlockHeader;
        // SAFETY: an in-use block keeps its header intact.
        let header = unsafe { &*block };
        if !header.is_valid() {
            return Err(CorruptionKind::BlockState);
        }
        let state = header.state();
        if state.kind != BlockKind::InUse || !(MIN_ORDER..=MAX_ORDER).contains(&state.order) {
            return Err(CorruptionKind::BlockState);
        }
        let order = state.order;
        if !header.transition(state, BlockState::new(BlockKind::Retired, order)) {
            return Err(CorruptionKind::BlockState);
        }
        let size = 1usize << order;
        self.used.fetch_sub(size, Ordering::Relaxed);
        let weak = self.this.clone();
        let addr = block as usize;
        self.reclaim.retire(
            addr,
            Box::new(move || {
                if let Some(zone) = weak.upgrade() {
                    // SAFETY: the grace period has passed; the zone that owns
                    // the block is still alive.
                    unsafe { zone.release_block(addr as *mut BlockHeader, order) };
                }
            }),
        );
        Ok(size)
    }

    fn buddy_of(&self, addr: usize, order: u32, segment: u16) -> Option<usize> {
        let seg = self.segments.get(usize::from(segment))?;
        let size = 1usize << order;
        let buddy_offset = (addr - seg.base) ^ size;
        (buddy_offset + size <= seg.len).then_some(seg.base + buddy_offset)
    }

    /// Merge upward while the buddy is free at the same order, then push.
    ///
    /// # Safety
    ///
    /// `block` must be a valid header of order `order` that is on no list
    /// and that no reader can still observe. Returns merges performed.
    unsafe fn release_block(&self, mut block: *mut BlockHeader, mut order: u32) -> usize {
        // SAFETY: valid per contract.
        let segment = unsafe { (*block).segment };
        let mut merges = 0;
        loop {
            let buddy = if order < MAX_ORDER {
                self.buddy_of(block as usize, order, segment)
            } else {
                None
            };
            let merged = self.list(order).with(|list| {
                if let Some(buddy) = buddy {
                    let buddy = buddy as *mut BlockHeader;
                    // SAFETY: a buddy position always starts a block header
                    // of order <= `order`; Free(order) ones are on this list.
                    let bh = unsafe { &*buddy };
                    if bh.state() == BlockState::new(BlockKind::Free, order) {
                        unsafe { list.remove(buddy) };
                        if list.is_empty() {
                            self.nonempty.fetch_and(!(1u64 << order), Ordering::AcqRel);
                        }
                        return Some(buddy);
                    }
                }
                // SAFETY: the block is ours and not on any list.
                unsafe {
                    (*block).set_state(BlockState::new(BlockKind::Free, order));
                    list.push(block);
                }
                self.nonempty.fetch_or(1u64 << order, Ordering::AcqRel);
                None
            });
            let Some(buddy) = merged else {
                return merges;
            };
            let (lower, upper) = if (buddy as usize) < block as usize {
                (buddy, block)
            } else {
                (block, buddy)
            };
            // SAFETY: both halves are ours now.
            unsafe {
                (*upper).set_state(BlockState::new(BlockKind::Absorbed, order));
                (*lower).set_state(BlockState::new(BlockKind::InUse, order + 1));
            }
            block = lower;
            order += 1;
            merges += 1;
        }
    }

    /// Merge free buddy pairs that are sitting on the lists, smallest order
    /// first. Foreground allocation never waits for this: a pass already in
    /// progress makes the call return 0.
    pub fn defragment(&self) -> usize {
        let Some(_guard) = self.defrag_lock.try_lock() else {
            return 0;
        };
        AllocatorMetrics::inc(&self.metrics.defrag_passes);
        let mut merges = 0;
        for order in MIN_ORDER..MAX_ORDER {
            let pairs = self.list(order).with(|list| {
                let mut pairs = Vec::new();
                for addr in list.addrs() {
                    let block = addr as *mut BlockHeader;
                    // SAFETY: list members are valid headers.
                    let segment = unsafe { (*block).segment };
                    let Some(buddy) = self.buddy_of(addr, order, segment) else {
                        continue;
                    };
                    if buddy < addr {
                        continue;
                    }
                    let bh = buddy as *mut BlockHeader;
                    // SAFETY: buddy positions start headers; see release_block.
                    let free_pair = unsafe { (*bh).state() == BlockState::new(BlockKind::Free, order)
                        && (*block).state() == BlockState::new(BlockKind::Free, order) };
                    if free_pair {
                        // SAFETY: both are members of this list.
                        unsafe {
                            list.remove(block);
                            list.remove(bh);
                            (*bh).set_state(BlockState::new(BlockKind::Absorbed, order));
                            (*block).set_state(BlockState::new(BlockKind::InUse, order + 1));
                        }
                        pairs.push(block);
                    }
                }
                if list.is_empty() {
                    self.nonempty.fetch_and(!(1u64 << order), Ordering::AcqRel);
                }
                pairs
            });
            for block in pairs {
                // SAFETY: the merged block is off every list and ours.
                merges += 1 + unsafe { self.release_block(block, order + 1) };
            }
        }
        AllocatorMetrics::add(&self.metrics.defrag_merges, merges as u64);
        merges
    }

    // -----------------------------------------------------------------------
    // Invariants
    // -----------------------------------------------------------------------

    /// Walk every list and verify the zone. Meaningful only when no other
    /// thread is allocating or freeing and deferred frees have been flushed.
    pub fn check_invariants(&self) -> Result<BuddyReport, BuddyViolation> {
        let mut report = BuddyReport {
            capacity: self.capacity(),
            segments: self.segments.len(),
            ..BuddyReport::default()
        };
        let mask = self.nonempty.load(Ordering::Acquire);
        let mut spans: Vec<(usize, usize, u32)> = Vec::new();
        for order in MIN_ORDER..=MAX_ORDER {
            let members = self.list(order).read(|list| list.addrs());
            let bit = mask & (1u64 << order) != 0;
            if bit == members.is_empty() {
                return Err(BuddyViolation {
                    segment: 0,
                    offset: 0,
                    order,
                    reason: "non-empty bitmask disagrees with list",
                });
            }
            for addr in members {
                let Some((seg_idx, seg)) = self.segments.find(addr) else {
                    return Err(BuddyViolation {
                        segment: usize::MAX,
                        offset: addr,
                        order,
                        reason: "free block outside every segment",
                    });
                };
                let violation = |reason| BuddyViolation {
                    segment: seg_idx,
                    offset: addr - seg.base,
                    order,
                    reason,
                };
                // SAFETY: list members are headers inside a live segment.
                let header = unsafe { &*(addr as *const BlockHeader) };
                if !header.is_valid() {
                    return Err(violation("bad block magic"));
                }
                if header.state() != BlockState::new(BlockKind::Free, order) {
                    return Err(violation("listed block not marked free at list order"));
                }
                if usize::from(header.segment) != seg_idx {
                    return Err(violation("block records the wrong segment"));
                }
                let offset = addr - seg.base;
                if offset % (1usize << order) != 0 || offset + (1usize << order) > seg.len {
                    return Err(violation("block misaligned or past segment end"));
                }
                if let Some(buddy) = self.buddy_of(addr, order, header.segment) {
                    // SAFETY: buddy positions start headers.
                    let bh = unsafe { &*(buddy as *const BlockHeader) };
                    let bs = bh.state();
                    if !bh.is_valid() || bs.order > order {
                        return Err(violation("buddy position overlaps a larger block"));
                    }
                    if bs.kind == BlockKind::Free && bs.order == order && buddy > addr {
                        report.unmerged_pairs += 1;
                    }
                }
                report.free_blocks += 1;
                report.free_bytes += 1usize << order;
                spans.push((addr, addr + (1usize << order), order));
            }
        }
        spans.sort_unstable();
        for pair in spans.windows(2) {
            if pair[0].1 > pair[1].0 {
                let (seg_idx, base) = self
                    .segments
                    .find(pair[1].0)
                    .map_or((usize::MAX, 0), |(i, s)| (i, s.base));
                return Err(BuddyViolation {
                    segment: seg_idx,
                    offset: pair[1].0 - base,
                    order: pair[1].2,
                    reason: "free blocks overlap",
                });
            }
        }
        Ok(report)
    }
}

impl Drop for BuddyZone {
    fn drop(&mut self) {
        for (_, seg) in self.segments.iter() {
            if seg.owned {
                if let Some(base) = NonNull::new(seg.base as *mut u8) {
                    // SAFETY: mapped by `grow`; the zone is the last user.
                    unsafe { os::unmap(base, seg.len) };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::epoch::EpochDomain;
    use std::collections::HashSet;

    fn zone_with(config: BuddyConfig, pool: Option<Arc<BackingPool>>) -> (Arc<BuddyZone>, Arc<EpochDomain>) {
        let epoch = Arc::new(EpochDomain::new());
        let zone = BuddyZone::new(config, pool, epoch.clone(), Arc::new(AllocatorMetrics::new()));
        (zone, epoch)
    }

    fn pooled(len: usize) -> (Arc<BuddyZone>, Arc<EpochDomain>) {
        let pool = Arc::new(BackingPool::anonymous(len).unwrap());
        zone_with(BuddyConfig::default(), Some(pool))
    }

    #[test]
    fn fresh_pool_is_one_free_block() {
        let (zone, _) = pooled(1 << 20);
        let report = zone.check_invariants().unwrap();
        assert_eq!(report.free_blocks, 1);
        assert_eq!(report.free_bytes, 1 << 20);
        assert_eq!(report.segments, 1);
    }

    #[test]
    fn split_then_coalesce_restores_single_block() {
        let (zone, epoch) = pooled(1 << 20);
        let a = zone.alloc(&BuddyRequest::new(100)).unwrap();
        assert_eq!(zone.used(), 256);
        let report = zone.check_invariants().unwrap();
        // 1 MiB split down to 256 bytes leaves one free block per order 8..20.
        assert_eq!(report.free_blocks, 12);
        assert_eq!(unsafe { zone.free(a) }, Ok(256));
        epoch.flush();
        let report = zone.check_invariants().unwrap();
        assert_eq!(report.free_blocks, 1);
        assert_eq!(report.unmerged_pairs, 0);
    }

    #[test]
    fn double_retire_is_block_state_corruption() {
        let (zone, _) = pooled(1 << 16);
        let a = zone.alloc(&BuddyRequest::new(64)).unwrap();
        assert!(unsafe { zone.free(a) }.is_ok());
        assert_eq!(unsafe { zone.free(a) }, Err(CorruptionKind::BlockState));
    }

    #[test]
    fn worst_fit_takes_from_the_largest_order() {
        let (zone, epoch) = pooled(1 << 20);
        let small = zone.alloc(&BuddyRequest::new(64)).unwrap();
        let best = zone.alloc(&BuddyRequest::new(64)).unwrap();
        assert_eq!(best.as_ptr() as usize - small.as_ptr() as usize, 128);
        let worst = zone
            .alloc(&BuddyRequest::new(64).policy(FitPolicy::WorstFit))
            .unwrap();
        assert_eq!(worst.as_ptr() as usize - small.as_ptr() as usize, 1 << 19);
        for p in [small, best, worst] {
            unsafe { zone.free(p).unwrap() };
        }
        epoch.flush();
        assert_eq!(zone.check_invariants().unwrap().free_blocks, 1);
    }

    #[test]
    fn growth_kicks_in_past_capacity() {
        let (zone, epoch) = pooled(64 * 1024);
        let mut live = Vec::new();
        for _ in 0..2000 {
            live.push(zone.alloc(&BuddyRequest::new(64)).unwrap().as_ptr() as usize);
        }
        assert!(zone.segment_count() > 1);
        let distinct: HashSet<_> = live.iter().copied().collect();
        assert_eq!(distinct.len(), live.len());
        for p in live {
            unsafe { zone.free(NonNull::new(p as *mut u8).unwrap()).unwrap() };
        }
        epoch.flush();
        let report = zone.check_invariants().unwrap();
        assert_eq!(report.unmerged_pairs, 0);
        assert_eq!(report.free_bytes, report.capacity);
    }

    #[test]
    fn growth_respects_segment_cap() {
        let config = BuddyConfig {
            max_segments: 2,
            min_growth_chunk: 4096,
            max_segment_bytes: 4096,
            ..BuddyConfig::default()
        };
        let (zone, _) = zone_with(config, None);
        let mut n = 0;
        while zone.alloc(&BuddyRequest::new(1000)).is_some() {
            n += 1;
            assert!(n < 100, "allocation never exhausted");
        }
        assert_eq!(zone.segment_count(), 2);
        // Two 4 KiB segments, two 2 KiB blocks each.
        assert_eq!(n, 4);
    }

    #[test]
    fn oversized_request_fails_without_growth() {
        let config = BuddyConfig {
            max_segment_bytes: 1 << 16,
            ..BuddyConfig::default()
        };
        let (zone, _) = zone_with(config, None);
        assert!(zone.alloc(&BuddyRequest::new(1 << 20)).is_none());
        assert_eq!(zone.segment_count(), 0);
    }

    #[test]
    fn defragment_merges_pairs_left_on_lists() {
        let (zone, _) = pooled(1 << 12);
        // Hand-craft an unmerged pair: two free order-11 halves.
        let seg = zone.segment(0).unwrap();
        let whole = zone.list(12).with(|l| l.pop()).unwrap();
        zone.nonempty.fetch_and(!(1u64 << 12), Ordering::AcqRel);
        let upper = (seg.base + 2048) as *mut BlockHeader;
        unsafe {
            BlockHeader::init(whole, BlockState::new(BlockKind::Free, 11), 0);
            BlockHeader::init(upper, BlockState::new(BlockKind::Free, 11), 0);
            zone.push_free(whole, 11);
            zone.push_free(upper, 11);
        }
        assert_eq!(zone.check_invariants().unwrap().unmerged_pairs, 1);
        assert_eq!(zone.defragment(), 1);
        let report = zone.check_invariants().unwrap();
        assert_eq!(report.unmerged_pairs, 0);
        assert_eq!(report.free_blocks, 1);
    }

    #[test]
    fn owner_tag_and_ownership() {
        let (zone, _) = pooled(1 << 16);
        let p = zone.alloc(&BuddyRequest::new(10).owner_tag(0xABCD)).unwrap();
        let header = unsafe { &*(p.as_ptr().sub(BLOCK_HEADER_SIZE).cast::<BlockHeader>()) };
        assert_eq!(header.owner_tag, 0xABCD);
        assert!(zone.owns(p.as_ptr() as usize));
        assert!(!zone.owns(0x10));
    }

    #[test]
    fn fit_policy_parsing() {
        assert_eq!(FitPolicy::from_str_loose("WORST"), FitPolicy::WorstFit);
        assert_eq!(FitPolicy::from_str_loose("first-fit"), FitPolicy::FirstFit);
        assert_eq!(FitPolicy::from_str_loose("??"), FitPolicy::BestFit);
    }
}
