//! Segment table: the backing regions of a buddy zone.
//!
//! Slots are written once, under the zone's growth lock, and published by
//! bumping `count`; readers never lock.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use super::block::MIN_ORDER;

/// Upper bound on segments any zone can hold.
pub const MAX_SEGMENT_SLOTS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub base: usize,
    pub len: usize,
    /// Mapped by the zone (unmapped on drop) rather than caller-supplied.
    pub owned: bool,
    /// Order of the largest top-level block.
    pub max_order: u32,
}

impl Segment {
    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.base + self.len
    }

    /// Greedy decomposition into maximal aligned power-of-two blocks:
    /// `(offset, order)` pairs, largest first.
    #[must_use]
    pub fn carve(len: usize) -> Vec<(usize, u32)> {
        let mut out = Vec::new();
        let mut offset = 0usize;
        for order in (MIN_ORDER..usize::BITS).rev() {
            let size = 1usize << order;
            if len - offset >= size {
                out.push((offset, order));
                offset += size;
            }
        }
        out
    }
}

struct SegmentSlot {
    base: AtomicUsize,
    len: AtomicUsize,
    owned: AtomicBool,
    max_order: AtomicU32,
}

impl SegmentSlot {
    const fn new() -> Self {
        Self {
            base: AtomicUsize::new(0),
            len: AtomicUsize::new(0),
            owned: AtomicBool::new(false),
            max_order: AtomicU32::new(0),
        }
    }
}

pub(crate) struct SegmentTable {
    slots: [SegmentSlot; MAX_SEGMENT_SLOTS],
    count: AtomicUsize,
}

impl SegmentTable {
    pub(crate) const fn new() -> Self {
        Self {
            slots: [const { SegmentSlot::new() }; MAX_SEGMENT_SLOTS],
            count: AtomicUsize::new(0),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub(crate) fn get(&self, idx: usize) -> Option<Segment> {
        if idx >= self.len() {
            return None;
        }
        let slot = &self.slots[idx];
        Some(Segment {
            base: slot.base.load(Ordering::Relaxed),
            len: slot.len.load(Ordering::Relaxed),
            owned: slot.owned.load(Ordering::Relaxed),
            max_order: slot.max_order.load(Ordering::Relaxed),
        })
    }

    /// Publish a new segment. Callers serialize on the zone growth lock.
    pub(crate) fn publish(&self, seg: Segment) -> Option<u16> {
        let idx = self.count.load(Ordering::Acquire);
        let slot = self.slots.get(idx)?;
        slot.base.store(seg.base, Ordering::Relaxed);
        slot.len.store(seg.len, Ordering::Relaxed);
        slot.owned.store(seg.owned, Ordering::Relaxed);
        slot.max_order.store(seg.max_order, Ordering::Relaxed);
        self.count.store(idx + 1, Ordering::Release);
        u16::try_from(idx).ok()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (usize, Segment)> + '_ {
        (0..self.len()).filter_map(|i| self.get(i).map(|s| (i, s)))
    }

    pub(crate) fn find(&self, addr: usize) -> Option<(usize, Segment)> {
        self.iter().find(|(_, s)| s.contains(addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn carve_follows_binary_decomposition() {
        assert_eq!(Segment::carve(1 << 20), vec![(0, 20)]);
        assert_eq!(Segment::carve(3 << 20), vec![(0, 21), (1 << 21, 20)]);
        let carved = Segment::carve((1 << 12) + 64 + 10);
        assert_eq!(carved, vec![(0, 12), (1 << 12, 6)]);
    }

    #[test]
    fn publish_is_visible_in_order() {
        let t = SegmentTable::new();
        let seg = Segment {
            base: 0x10_0000,
            len: 0x1000,
            owned: true,
            max_order: 12,
        };
        assert_eq!(t.publish(seg), Some(0));
        assert_eq!(t.len(), 1);
        assert_eq!(t.get(0), Some(seg));
        assert_eq!(t.find(0x10_0800).map(|(i, _)| i), Some(0));
        assert!(t.find(0x10_1000).is_none());
        assert!(t.get(1).is_none());
    }

    #[test]
    fn table_capacity_is_bounded() {
        let t = SegmentTable::new();
        let seg = Segment {
            base: 0,
            len: 64,
            owned: false,
            max_order: 6,
        };
        for _ in 0..MAX_SEGMENT_SLOTS {
            assert!(t.publish(seg).is_some());
        }
        assert!(t.publish(seg).is_none());
    }
}
