//! Root tracker: the shared list of externally referenced allocations.
//!
//! One doubly linked list of heap nodes behind a single mutex, plus the
//! condition variable the reclaimer sleeps on. Lock order is always list
//! lock, then header lock.
//!
//! A header points at its node (`Header::root`). That link is only read or
//! cleared with the list lock held, so a node reached through a header is
//! alive for as long as the lock is.

#![allow(unsafe_code)]

use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::config::GcConfig;
use crate::header::Header;

pub(crate) struct RootNode {
    /// Payload address.
    pub(crate) ptr: usize,
    pub(crate) size: usize,
    pub(crate) expires: u64,
    ref_count: AtomicU32,
    prev: *mut RootNode,
    next: *mut RootNode,
}

impl RootNode {
    pub(crate) fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Acquire)
    }
}

/// Diagnostic copy of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootInfo {
    pub ptr: usize,
    pub size: usize,
    pub expires: u64,
    pub ref_count: u32,
}

impl RootInfo {
    fn of(node: &RootNode) -> Self {
        Self {
            ptr: node.ptr,
            size: node.size,
            expires: node.expires,
            ref_count: node.ref_count(),
        }
    }
}

struct RootList {
    head: *mut RootNode,
    len: usize,
}

// SAFETY: the nodes are heap boxes owned by the list; every access to the
// links happens with the list mutex held.
unsafe impl Send for RootList {}

impl RootList {
    /// # Safety
    ///
    /// `node` must be on this list.
    unsafe fn unlink(&mut self, node: *mut RootNode) -> Box<RootNode> {
        // SAFETY: forwarded; neighbours are on the list too.
        unsafe {
            let prev = (*node).prev;
            let next = (*node).next;
            if prev.is_null() {
                self.head = next;
            } else {
                (*prev).next = next;
            }
            if !next.is_null() {
                (*next).prev = prev;
            }
            self.len -= 1;
            let mut owned = Box::from_raw(node);
            owned.prev = ptr::null_mut();
            owned.next = ptr::null_mut();
            owned
        }
    }
}

/// A node taken off the list; its allocation is still live.
pub(crate) type Detached = Box<RootNode>;

pub(crate) struct RootTracker {
    list: Mutex<RootList>,
    wake: Condvar,
    /// Bytes of roots whose reference count reached zero and are not yet freed.
    pressure: AtomicU64,
    threshold: AtomicU64,
    /// Edge-triggered wake request from `release`.
    signaled: AtomicBool,
    min_sleep_ns: AtomicU64,
    max_sleep_ns: AtomicU64,
    manual: AtomicBool,
    shutdown: AtomicBool,
    last_sleep_ns: AtomicU64,
    cycles: AtomicU64,
}

fn nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

impl RootTracker {
    pub(crate) fn new(gc: &GcConfig) -> Self {
        Self {
            list: Mutex::new(RootList {
                head: ptr::null_mut(),
                len: 0,
            }),
            wake: Condvar::new(),
            pressure: AtomicU64::new(0),
            threshold: AtomicU64::new(gc.pressure_threshold),
            signaled: AtomicBool::new(false),
            min_sleep_ns: AtomicU64::new(nanos(gc.min_interval)),
            max_sleep_ns: AtomicU64::new(nanos(gc.max_interval)),
            manual: AtomicBool::new(gc.manual),
            shutdown: AtomicBool::new(false),
            last_sleep_ns: AtomicU64::new(0),
            cycles: AtomicU64::new(0),
        }
    }

    // -----------------------------------------------------------------------
    // Structure
    // -----------------------------------------------------------------------

    /// Register a root with reference count 1; the caller links it into the
    /// header with `Header::set_root`.
    pub(crate) fn add(&self, ptr: usize, size: usize, expires: u64) -> *mut RootNode {
        let node = Box::into_raw(Box::new(RootNode {
            ptr,
            size,
            expires,
            ref_count: AtomicU32::new(1),
            prev: ptr::null_mut(),
            next: ptr::null_mut(),
        }));
        let mut list = self.list.lock();
        // SAFETY: the node is fresh; the old head is on the list.
        unsafe {
            (*node).next = list.head;
            if !list.head.is_null() {
                (*list.head).prev = node;
            }
        }
        list.head = node;
        list.len += 1;
        node
    }

    /// Unlink and destroy a node whose header link the caller already took.
    /// The allocation itself is the caller's to release.
    ///
    /// # Safety
    ///
    /// `node` must have come from `add` on this tracker and not have been
    /// removed, swept or drained.
    pub(crate) unsafe fn remove(&self, node: *mut RootNode) {
        let detached = {
            let mut list = self.list.lock();
            // SAFETY: forwarded.
            unsafe { list.unlink(node) }
        };
        if detached.ref_count() == 0 {
            self.relieve_pressure(detached.size as u64);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.list.lock().len
    }

    pub(crate) fn find(&self, ptr: usize) -> Option<RootInfo> {
        let list = self.list.lock();
        let mut cur = list.head;
        while !cur.is_null() {
            // SAFETY: members stay alive while the lock is held.
            let node = unsafe { &*cur };
            if node.ptr == ptr {
                return Some(RootInfo::of(node));
            }
            cur = node.next;
        }
        None
    }

    /// Visit every node with the list locked.
    pub(crate) fn for_each(&self, mut f: impl FnMut(&RootNode)) {
        let list = self.list.lock();
        let mut cur = list.head;
        while !cur.is_null() {
            // SAFETY: as in `find`.
            let node = unsafe { &*cur };
            f(node);
            cur = node.next;
        }
    }

    /// Detach every node for which `select` returns `Some`. The closure runs
    /// with the list lock held; the caller frees the memory afterwards,
    /// outside the lock.
    pub(crate) fn sweep<T>(&self, mut select: impl FnMut(&RootNode) -> Option<T>) -> Vec<(Detached, T)> {
        let mut out = Vec::new();
        let mut list = self.list.lock();
        let mut cur = list.head;
        while !cur.is_null() {
            // SAFETY: as in `find`.
            let node = unsafe { &*cur };
            let next = node.next;
            if let Some(extra) = select(node) {
                // SAFETY: `cur` is on the list.
                out.push((unsafe { list.unlink(cur) }, extra));
            }
            cur = next;
        }
        out
    }

    /// Detach everything. Used at shutdown.
    pub(crate) fn drain(&self) -> Vec<Detached> {
        self.sweep(|_| Some(())).into_iter().map(|(n, ())| n).collect()
    }

    // -----------------------------------------------------------------------
    // Reference counting and pressure
    // -----------------------------------------------------------------------

    pub(crate) fn retain(&self, header: &Header) -> Option<u32> {
        let _list = self.list.lock();
        let node = header.root();
        if node.is_null() {
            return None;
        }
        // SAFETY: reached through the header under the list lock.
        let node = unsafe { &*node };
        Some(node.ref_count.fetch_add(1, Ordering::AcqRel) + 1)
    }

    /// Drop one reference. Reaching zero adds the node's size to the
    /// pressure counter and wakes the reclaimer once it crosses the threshold.
    pub(crate) fn release(&self, header: &Header) -> Option<u32> {
        let _list = self.list.lock();
        let node = header.root();
        if node.is_null() {
            return None;
        }
        // SAFETY: reached through the header under the list lock.
        let node = unsafe { &*node };
        let current = node.ref_count();
        if current == 0 {
            return Some(0);
        }
        node.ref_count.store(current - 1, Ordering::Release);
        if current == 1 {
            let size = node.size as u64;
            let total = self.pressure.fetch_add(size, Ordering::AcqRel).saturating_add(size);
            if total >= self.threshold.load(Ordering::Relaxed) {
                self.signaled.store(true, Ordering::Release);
                self.wake.notify_one();
            }
        }
        Some(current - 1)
    }

    pub(crate) fn pressure(&self) -> u64 {
        self.pressure.load(Ordering::Acquire)
    }

    pub(crate) fn relieve_pressure(&self, bytes: u64) {
        let _ = self
            .pressure
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |p| Some(p.saturating_sub(bytes)));
    }

    // -----------------------------------------------------------------------
    // Reclaimer pacing
    // -----------------------------------------------------------------------

    pub(crate) fn configure(&self, min: Duration, max: Duration, threshold: u64) {
        self.min_sleep_ns.store(nanos(min), Ordering::Relaxed);
        self.max_sleep_ns.store(nanos(max), Ordering::Relaxed);
        self.threshold.store(threshold, Ordering::Relaxed);
        let _list = self.list.lock();
        self.wake.notify_all();
    }

    pub(crate) fn sleep_bounds(&self) -> (Duration, Duration) {
        (
            Duration::from_nanos(self.min_sleep_ns.load(Ordering::Relaxed)),
            Duration::from_nanos(self.max_sleep_ns.load(Ordering::Relaxed)),
        )
    }

    pub(crate) fn set_manual(&self, manual: bool) {
        self.manual.store(manual, Ordering::Release);
    }

    pub(crate) fn is_manual(&self) -> bool {
        self.manual.load(Ordering::Acquire)
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub(crate) fn signal_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        let _list = self.list.lock();
        self.wake.notify_all();
    }

    /// Sleep up to `timeout`. Returns early on shutdown or a pressure wake.
    pub(crate) fn wait(&self, timeout: Duration) {
        let mut list = self.list.lock();
        if self.is_shutdown() || self.signaled.swap(false, Ordering::AcqRel) {
            return;
        }
        let _ = self.wake.wait_for(&mut list, timeout);
        self.signaled.store(false, Ordering::Release);
    }

    pub(crate) fn record_cycle(&self, slept: Duration) {
        self.last_sleep_ns.store(nanos(slept), Ordering::Relaxed);
        self.cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) fn last_sleep(&self) -> Duration {
        Duration::from_nanos(self.last_sleep_ns.load(Ordering::Relaxed))
    }
}

impl Drop for RootTracker {
    fn drop(&mut self) {
        let list = self.list.get_mut();
        let mut cur = list.head;
        while !cur.is_null() {
            // SAFETY: we own every node left on the list.
            let node = unsafe { Box::from_raw(cur) };
            cur = node.next;
        }
        list.head = ptr::null_mut();
        list.len = 0;
    }
}
