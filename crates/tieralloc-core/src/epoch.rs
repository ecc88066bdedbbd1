//! Deferred reclamation.
//!
//! The buddy tier never recycles a freed block directly: it hands the block
//! and a cleanup closure to a [`Reclaim`] implementation, which runs the
//! cleanup once no reader that could still observe the block remains.
//!
//! # Design
//!
//! [`EpochDomain`] is three-epoch EBR:
//! - A fixed table of cache-line padded reader slots. `enter` claims a slot
//!   and publishes the global epoch in it; `exit` clears it.
//! - The global epoch advances only when every occupied slot has observed
//!   the current value.
//! - A cleanup retired at epoch `e` runs once the global epoch reaches
//!   `e + 2`: every reader pinned at or before `e` has exited by then.
//!
//! Callbacks run outside the queue lock, on whichever thread flushes.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering, fence};

use parking_lot::Mutex;

pub type Cleanup = Box<dyn FnOnce() + Send>;

/// Opaque handle returned by [`Reclaim::enter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderToken(usize);

impl ReaderToken {
    /// Token that does not correspond to a reader slot.
    pub const OVERFLOW: Self = Self(usize::MAX);

    #[must_use]
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

/// Safe-memory-reclamation collaborator.
pub trait Reclaim: Send + Sync {
    /// Begin a read-side section.
    fn enter(&self) -> ReaderToken;
    /// End the section started by `enter`.
    fn exit(&self, token: ReaderToken);
    /// Run `cleanup` for `block` once no current reader can observe it.
    fn retire(&self, block: usize, cleanup: Cleanup);
    /// Run every cleanup that is safe now; returns how many ran.
    fn flush(&self) -> usize;
    /// Cleanups still waiting.
    fn pending(&self) -> usize;
}

/// RAII read-side section.
pub struct ReadGuard<'a> {
    domain: &'a dyn Reclaim,
    token: ReaderToken,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.domain.exit(self.token);
    }
}

#[must_use]
pub fn pin(domain: &dyn Reclaim) -> ReadGuard<'_> {
    ReadGuard {
        token: domain.enter(),
        domain,
    }
}

// ---------------------------------------------------------------------------
// Epoch domain
// ---------------------------------------------------------------------------

const MAX_READERS: usize = 256;
const SLOT_FREE: u64 = 0;
const SLOT_CLAIMED: u64 = 1;
/// Low bit set means "active"; the epoch lives in the upper bits.
const IDLE: u64 = 0;

#[repr(C, align(64))]
struct ReaderSlot {
    owner: AtomicU64,
    epoch: AtomicU64,
}

impl ReaderSlot {
    const fn new() -> Self {
        Self {
            owner: AtomicU64::new(SLOT_FREE),
            epoch: AtomicU64::new(IDLE),
        }
    }
}

struct Deferred {
    stamp: u64,
    block: usize,
    cleanup: Cleanup,
}

pub struct EpochDomain {
    global: AtomicU64,
    slots: Box<[ReaderSlot]>,
    /// Readers that found every slot taken; blocks advancement while nonzero.
    overflow: AtomicUsize,
    queue: Mutex<VecDeque<Deferred>>,
    pending: AtomicUsize,
}

impl std::fmt::Debug for EpochDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpochDomain")
            .field("global", &self.epoch())
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}

impl Default for EpochDomain {
    fn default() -> Self {
        Self::new()
    }
}

impl EpochDomain {
    #[must_use]
    pub fn new() -> Self {
        Self {
            global: AtomicU64::new(1),
            slots: (0..MAX_READERS).map(|_| ReaderSlot::new()).collect(),
            overflow: AtomicUsize::new(0),
            queue: Mutex::new(VecDeque::new()),
            pending: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.global.load(Ordering::SeqCst)
    }

    /// Advance the global epoch if every active reader has caught up.
    pub fn try_advance(&self) -> bool {
        let current = self.global.load(Ordering::SeqCst);
        if self.overflow.load(Ordering::SeqCst) != 0 {
            return false;
        }
        for slot in self.slots.iter() {
            let seen = slot.epoch.load(Ordering::SeqCst);
            if seen & 1 == 1 && seen >> 1 != current {
                return false;
            }
        }
        self.global
            .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Addresses still waiting for a grace period, oldest first.
    #[must_use]
    pub fn pending_blocks(&self) -> Vec<usize> {
        self.queue.lock().iter().map(|d| d.block).collect()
    }

    fn collect(&self) -> usize {
        let global = self.global.load(Ordering::SeqCst);
        let ready: Vec<Deferred> = {
            let mut queue = self.queue.lock();
            let mut ready = Vec::new();
            let mut keep = VecDeque::with_capacity(queue.len());
            for entry in queue.drain(..) {
                if entry.stamp + 2 <= global {
                    ready.push(entry);
                } else {
                    keep.push_back(entry);
                }
            }
            *queue = keep;
            ready
        };
        let ran = ready.len();
        for entry in ready {
            (entry.cleanup)();
        }
        self.pending.fetch_sub(ran, Ordering::AcqRel);
        ran
    }
}

fn thread_hint() -> usize {
    static NEXT: AtomicUsize = AtomicUsize::new(0);
    thread_local! {
        static HINT: usize = NEXT.fetch_add(1, Ordering::Relaxed);
    }
    HINT.try_with(|h| *h).unwrap_or(0)
}

impl Reclaim for EpochDomain {
    fn enter(&self) -> ReaderToken {
        let start = thread_hint();
        for i in 0..MAX_READERS {
            let idx = (start + i) % MAX_READERS;
            let slot = &self.slots[idx];
            if slot
                .owner
                .compare_exchange(SLOT_FREE, SLOT_CLAIMED, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }
            loop {
                let e = self.global.load(Ordering::SeqCst);
                slot.epoch.store((e << 1) | 1, Ordering::SeqCst);
                fence(Ordering::SeqCst);
                if self.global.load(Ordering::SeqCst) == e {
                    break;
                }
            }
            return ReaderToken(idx);
        }
        self.overflow.fetch_add(1, Ordering::SeqCst);
        fence(Ordering::SeqCst);
        ReaderToken::OVERFLOW
    }

    fn exit(&self, token: ReaderToken) {
        match self.slots.get(token.0) {
            Some(slot) => {
                slot.epoch.store(IDLE, Ordering::Release);
                slot.owner.store(SLOT_FREE, Ordering::Release);
            }
            None => {
                self.overflow.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    fn retire(&self, block: usize, cleanup: Cleanup) {
        let stamp = self.global.load(Ordering::SeqCst);
        self.queue.lock().push_back(Deferred {
            stamp,
            block,
            cleanup,
        });
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.try_advance();
        self.try_advance();
        self.collect();
    }

    fn flush(&self) -> usize {
        let mut ran = 0;
        for _ in 0..3 {
            self.try_advance();
            ran += self.collect();
        }
        ran
    }

    fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }
}

impl Drop for EpochDomain {
    fn drop(&mut self) {
        for entry in self.queue.get_mut().drain(..) {
            (entry.cleanup)();
        }
    }
}
