//! Buddy block header and state encoding.

#![allow(unsafe_code)]

use std::ptr;
use std::sync::atomic::{AtomicU8, Ordering};

pub const MIN_ORDER: u32 = 6;
pub const MAX_ORDER: u32 = 60;
pub const ORDER_COUNT: usize = (MAX_ORDER - MIN_ORDER + 1) as usize;
pub const BLOCK_HEADER_SIZE: usize = 64;
pub(crate) const BLOCK_MAGIC: u32 = 0xB0DD_7A11;

/// Smallest order whose block holds `bytes`.
#[must_use]
pub fn order_for(bytes: usize) -> Option<u32> {
    let size = bytes.max(1 << MIN_ORDER).checked_next_power_of_two()?;
    let order = size.trailing_zeros();
    (order <= MAX_ORDER).then_some(order)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockKind {
    InUse = 0,
    Free = 1,
    /// Freed by its owner, waiting for the reclamation grace period.
    Retired = 2,
    /// Merged into its lower buddy; the header is now interior memory.
    Absorbed = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockState {
    pub kind: BlockKind,
    pub order: u32,
}

impl BlockState {
    pub(crate) const fn new(kind: BlockKind, order: u32) -> Self {
        Self { kind, order }
    }

    pub(crate) const fn encode(self) -> u8 {
        ((self.kind as u8) << 6) | (self.order as u8 & 0x3F)
    }

    pub(crate) const fn decode(raw: u8) -> Self {
        let kind = match raw >> 6 {
            0 => BlockKind::InUse,
            1 => BlockKind::Free,
            2 => BlockKind::Retired,
            _ => BlockKind::Absorbed,
        };
        Self {
            kind,
            order: (raw & 0x3F) as u32,
        }
    }
}

/// Sits at the start of every buddy block; the usable region follows.
#[repr(C, align(64))]
pub(crate) struct BlockHeader {
    pub(crate) next: *mut BlockHeader,
    pub(crate) prev: *mut BlockHeader,
    state: AtomicU8,
    pub(crate) segment: u16,
    pub(crate) owner_tag: u32,
    pub(crate) magic: u32,
}

const _: () = assert!(std::mem::size_of::<BlockHeader>() == BLOCK_HEADER_SIZE);

impl BlockHeader {
    /// Write a fresh header at `at`.
    ///
    /// # Safety
    ///
    /// `at` must be a 64-byte aligned block start inside a live segment that
    /// no other thread is reading as a header.
    pub(crate) unsafe fn init(at: *mut BlockHeader, state: BlockState, segment: u16) {
        // SAFETY: forwarded to the caller.
        unsafe {
            ptr::write(
                at,
                BlockHeader {
                    next: ptr::null_mut(),
                    prev: ptr::null_mut(),
                    state: AtomicU8::new(state.encode()),
                    segment,
                    owner_tag: 0,
                    magic: BLOCK_MAGIC,
                },
            );
        }
    }

    pub(crate) fn state(&self) -> BlockState {
        BlockState::decode(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: BlockState) {
        self.state.store(state.encode(), Ordering::Release);
    }

    /// Atomic `from -> to`; false when the header was not in `from`.
    pub(crate) fn transition(&self, from: BlockState, to: BlockState) -> bool {
        self.state
            .compare_exchange(from.encode(), to.encode(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.magic == BLOCK_MAGIC
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_rounding() {
        assert_eq!(order_for(0), Some(6));
        assert_eq!(order_for(64), Some(6));
        assert_eq!(order_for(65), Some(7));
        assert_eq!(order_for(1 << 20), Some(20));
        assert_eq!(order_for((1 << 20) + 1), Some(21));
        assert_eq!(order_for(usize::MAX), None);
    }

    #[test]
    fn state_encoding_roundtrips_every_kind() {
        for kind in [BlockKind::InUse, BlockKind::Free, BlockKind::Retired, BlockKind::Absorbed] {
            for order in [MIN_ORDER, 20, MAX_ORDER] {
                let s = BlockState::new(kind, order);
                assert_eq!(BlockState::decode(s.encode()), s);
            }
        }
    }

    #[test]
    fn transition_is_conditional() {
        #[repr(C, align(64))]
        struct Slot([u8; 64]);
        let mut slot = Slot([0; 64]);
        let at = slot.0.as_mut_ptr().cast::<BlockHeader>();
        unsafe { BlockHeader::init(at, BlockState::new(BlockKind::InUse, 8), 0) };
        let h = unsafe { &*at };
        assert!(h.is_valid());
        let retired = BlockState::new(BlockKind::Retired, 8);
        assert!(h.transition(BlockState::new(BlockKind::InUse, 8), retired));
        assert!(!h.transition(BlockState::new(BlockKind::InUse, 8), retired));
        assert_eq!(h.state(), retired);
    }
}
