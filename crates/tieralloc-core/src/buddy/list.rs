//! Per-order free lists and their locks.
//!
//! Small orders see the most traffic and the shortest critical sections, so
//! they sit behind a spin lock. Medium orders use a parking mutex. The large,
//! rare orders use a reader-writer lock: only list mutation takes the write
//! side, inspection takes the read side.

#![allow(unsafe_code)]

use std::ptr;

use parking_lot::{Mutex, RwLock};

use super::block::BlockHeader;
use crate::sync::SpinMutex;

const SPIN_MAX_ORDER: u32 = 12;
const MUTEX_MAX_ORDER: u32 = 20;

/// Intrusive doubly linked list of free blocks of one order.
pub(crate) struct FreeList {
    head: *mut BlockHeader,
    len: usize,
}

// SAFETY: the list only links blocks inside segments owned by the zone, and
// every access goes through the order's lock.
unsafe impl Send for FreeList {}
// SAFETY: as above.
unsafe impl Sync for FreeList {}

impl FreeList {
    pub(crate) const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            len: 0,
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    /// # Safety
    ///
    /// `block` must be a valid header not on any list.
    pub(crate) unsafe fn push(&mut self, block: *mut BlockHeader) {
        // SAFETY: forwarded; the old head is on this list.
        unsafe {
            (*block).prev = ptr::null_mut();
            (*block).next = self.head;
            if !self.head.is_null() {
                (*self.head).prev = block;
            }
        }
        self.head = block;
        self.len += 1;
    }

    pub(crate) fn pop(&mut self) -> Option<*mut BlockHeader> {
        if self.head.is_null() {
            return None;
        }
        let block = self.head;
        // SAFETY: `block` is the head of this list.
        unsafe { self.remove(block) };
        Some(block)
    }

    /// # Safety
    ///
    /// `block` must be on this list.
    pub(crate) unsafe fn remove(&mut self, block: *mut BlockHeader) {
        // SAFETY: forwarded; neighbours are on this list too.
        unsafe {
            let prev = (*block).prev;
            let next = (*block).next;
            if prev.is_null() {
                self.head = next;
            } else {
                (*prev).next = next;
            }
            if !next.is_null() {
                (*next).prev = prev;
            }
            (*block).next = ptr::null_mut();
            (*block).prev = ptr::null_mut();
        }
        self.len -= 1;
    }

    /// Snapshot of the member addresses.
    pub(crate) fn addrs(&self) -> Vec<usize> {
        let mut out = Vec::with_capacity(self.len);
        let mut cur = self.head;
        while !cur.is_null() {
            out.push(cur as usize);
            // SAFETY: every member links to another member or null.
            cur = unsafe { (*cur).next };
        }
        out
    }
}

pub(crate) enum OrderList {
    Spin(SpinMutex<FreeList>),
    Plain(Mutex<FreeList>),
    Shared(RwLock<FreeList>),
}

impl OrderList {
    pub(crate) fn for_order(order: u32) -> Self {
        if order <= SPIN_MAX_ORDER {
            Self::Spin(SpinMutex::new(FreeList::new()))
        } else if order <= MUTEX_MAX_ORDER {
            Self::Plain(Mutex::new(FreeList::new()))
        } else {
            Self::Shared(RwLock::new(FreeList::new()))
        }
    }

    /// Run `f` with exclusive access to the list.
    pub(crate) fn with<R>(&self, f: impl FnOnce(&mut FreeList) -> R) -> R {
        match self {
            Self::Spin(m) => f(&mut m.lock()),
            Self::Plain(m) => f(&mut m.lock()),
            Self::Shared(l) => f(&mut l.write()),
        }
    }

    /// Run `f` with read access. Exclusive for the locks that have no
    /// shared mode.
    pub(crate) fn read<R>(&self, f: impl FnOnce(&FreeList) -> R) -> R {
        match self {
            Self::Spin(m) => f(&m.lock()),
            Self::Plain(m) => f(&m.lock()),
            Self::Shared(l) => f(&l.read()),
        }
    }

    #[cfg(test)]
    fn kind(&self) -> &'static str {
        match self {
            Self::Spin(_) => "spin",
            Self::Plain(_) => "mutex",
            Self::Shared(_) => "rwlock",
        }
    }
}
