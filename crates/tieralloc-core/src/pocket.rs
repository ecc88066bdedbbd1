//! Pocket tier: thread-local freelists over 4 KiB pages for the smallest
//! requests.
//!
//! Two block classes, 192 and 256 bytes, each holding a full header plus
//! payload. A page is carved for one class only and stamped with a 64-byte
//! [`PageTag`] at its start; `free` masks the block address down to the page
//! to find the tag. Freelists are LIFO stacks kept in the calling thread's
//! context, one per class, so the hot path never synchronizes.
//!
//! The freelist link is stored in the first payload word, never in the
//! header, so a freed block still carries the sealed header that lets a
//! repeated `free` be recognized.
//!
//! A free that finds the thread's freelists already borrowed (re-entry from
//! inside the tier) parks the block on a locked per-tier overflow stack. The
//! next freelist miss drains it before carving a new page.

#![allow(unsafe_code)]

use std::collections::HashSet;
use std::ptr::{self, NonNull};

use parking_lot::{Mutex, RwLock};

use crate::error::CorruptionKind;
use crate::header::HEADER_SIZE;
use crate::os::{self, PAGE_SIZE};
use crate::thread_ctx::{self, BootstrapScope};

pub(crate) const POCKET_CLASSES: [usize; 2] = [192, 256];
const PAGE_TAG_SIZE: usize = 64;
const PAGE_TAG_BASE: u32 = 0x80C4_E700;
/// Pages mapped at once when the current chunk runs dry.
const CHUNK_PAGES: usize = 16;

#[repr(C, align(64))]
struct PageTag {
    tag: u32,
    block_size: u32,
    context_id: u64,
}

const _: () = assert!(std::mem::size_of::<PageTag>() == PAGE_TAG_SIZE);

const fn blocks_per_page(block_size: usize) -> usize {
    (PAGE_SIZE - PAGE_TAG_SIZE) / block_size
}

/// Smallest class whose block fits `total` bytes (header included).
pub(crate) fn class_for(total: usize) -> Option<usize> {
    POCKET_CLASSES.iter().position(|&bs| total <= bs)
}

// ---------------------------------------------------------------------------
// Thread-local freelists
// ---------------------------------------------------------------------------

pub(crate) struct FreeStack {
    head: *mut u8,
}

impl FreeStack {
    const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
        }
    }

    /// # Safety
    ///
    /// `block` must be a pocket block of at least `HEADER_SIZE + 8` bytes
    /// that nobody else references.
    unsafe fn push(&mut self, block: NonNull<u8>) {
        // SAFETY: the link slot is the first payload word of an unused block.
        unsafe {
            ptr::write(block.as_ptr().add(HEADER_SIZE).cast::<*mut u8>(), self.head);
        }
        self.head = block.as_ptr();
    }

    fn pop(&mut self) -> Option<NonNull<u8>> {
        let block = NonNull::new(self.head)?;
        // SAFETY: every pushed block stored its successor in its link slot.
        self.head = unsafe { ptr::read(block.as_ptr().add(HEADER_SIZE).cast::<*mut u8>()) };
        Some(block)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        let mut len = 0;
        let mut cur = self.head;
        while !cur.is_null() {
            len += 1;
            // SAFETY: every pushed block stored its successor in its link slot.
            cur = unsafe { ptr::read(cur.add(HEADER_SIZE).cast::<*mut u8>()) };
        }
        len
    }
}

/// Blocks freed while the thread's freelists were borrowed.
struct Overflow([FreeStack; 2]);

// SAFETY: the stacks link unused blocks of this tier's pages and are only
// touched under the tier mutex.
unsafe impl Send for Overflow {}

/// One thread's freelists for one allocator context.
pub(crate) struct PocketShard {
    pub(crate) context_id: u64,
    stacks: [FreeStack; 2],
}

impl PocketShard {
    pub(crate) const fn new(context_id: u64) -> Self {
        Self {
            context_id,
            stacks: [FreeStack::new(), FreeStack::new()],
        }
    }
}

// ---------------------------------------------------------------------------
// Page source
// ---------------------------------------------------------------------------

struct PocketPages {
    chunks: Vec<(NonNull<u8>, usize)>,
    next: usize,
    end: usize,
}

// SAFETY: the chunk list is only an inventory of mappings; touched under the
// tier mutex.
unsafe impl Send for PocketPages {}

pub(crate) struct PocketTier {
    context_id: u64,
    pages: Mutex<PocketPages>,
    registry: RwLock<HashSet<usize>>,
    overflow: Mutex<Overflow>,
}

impl PocketTier {
    pub(crate) fn new(context_id: u64) -> Self {
        thread_ctx::register_context(context_id);
        Self {
            context_id,
            pages: Mutex::new(PocketPages {
                chunks: Vec::new(),
                next: 0,
                end: 0,
            }),
            registry: RwLock::new(HashSet::new()),
            overflow: Mutex::new(Overflow([FreeStack::new(), FreeStack::new()])),
        }
    }

    /// Block for `class`, header space included.
    pub(crate) fn alloc(&self, class: usize) -> Option<NonNull<u8>> {
        let block_size = *POCKET_CLASSES.get(class)?;
        let served = thread_ctx::with_pockets(self.context_id, |shard| {
            let stack = &mut shard.stacks[class];
            if let Some(block) = stack.pop() {
                return Some(block);
            }
            if let Some(block) = self.overflow.lock().0[class].pop() {
                return Some(block);
            }
            let page = self.fresh_page(class, block_size)?;
            for i in (0..blocks_per_page(block_size)).rev() {
                let addr = page.as_ptr() as usize + PAGE_TAG_SIZE + i * block_size;
                // SAFETY: inside a freshly tagged page that nobody else has seen.
                unsafe { stack.push(NonNull::new_unchecked(addr as *mut u8)) };
            }
            stack.pop()
        });
        match served {
            Some(block) => block,
            None => self.overflow.lock().0[class].pop(),
        }
    }

    fn fresh_page(&self, class: usize, block_size: usize) -> Option<NonNull<u8>> {
        let mut pages = self.pages.lock();
        if pages.next == pages.end {
            let len = CHUNK_PAGES * PAGE_SIZE;
            let chunk = {
                let _scope = BootstrapScope::enter();
                os::map(len)?
            };
            pages.chunks.push((chunk, len));
            pages.next = chunk.as_ptr() as usize;
            pages.end = pages.next + len;
        }
        let page = pages.next;
        pages.next += PAGE_SIZE;
        drop(pages);

        let tag = PageTag {
            tag: PAGE_TAG_BASE | class as u32,
            block_size: block_size as u32,
            context_id: self.context_id,
        };
        // SAFETY: page-aligned, page-sized and unused.
        unsafe { ptr::write(page as *mut PageTag, tag) };
        self.registry.write().insert(page);
        NonNull::new(page as *mut u8)
    }

    /// Return a block to the calling thread's freelist.
    ///
    /// # Safety
    ///
    /// `block` must be a block start previously returned by [`Self::alloc`]
    /// of this tier, no longer in use.
    pub(crate) unsafe fn free(&self, block: NonNull<u8>, class: usize) -> Result<(), CorruptionKind> {
        let addr = block.as_ptr() as usize;
        let page = addr & !(PAGE_SIZE - 1);
        // SAFETY: the page of a live pocket block is mapped and tagged.
        let tag = unsafe { ptr::read(page as *const PageTag) };
        let block_size = POCKET_CLASSES.get(class).copied().ok_or(CorruptionKind::PageTag)?;
        let offset = addr - page;
        if tag.tag != PAGE_TAG_BASE | class as u32
            || tag.block_size as usize != block_size
            || tag.context_id != self.context_id
            || offset < PAGE_TAG_SIZE
            || (offset - PAGE_TAG_SIZE) % block_size != 0
        {
            return Err(CorruptionKind::PageTag);
        }
        let pushed = thread_ctx::with_pockets(self.context_id, |shard| {
            // SAFETY: validated above; the caller hands over the block.
            unsafe { shard.stacks[class].push(block) };
        });
        if pushed.is_none() {
            // SAFETY: as above.
            unsafe { self.overflow.lock().0[class].push(block) };
        }
        Ok(())
    }

    pub(crate) fn owns(&self, addr: usize) -> bool {
        self.registry.read().contains(&(addr & !(PAGE_SIZE - 1)))
    }

    pub(crate) fn page_count(&self) -> usize {
        self.registry.read().len()
    }

    /// Blocks sitting on this thread's freelist for `class`.
    #[cfg(test)]
    pub(crate) fn cached(&self, class: usize) -> usize {
        thread_ctx::with_pockets(self.context_id, |shard| {
            shard.stacks.get(class).map_or(0, FreeStack::len)
        })
        .unwrap_or(0)
    }

    #[cfg(test)]
    fn overflowed(&self, class: usize) -> usize {
        self.overflow.lock().0[class].len()
    }
}

impl Drop for PocketTier {
    fn drop(&mut self) {
        thread_ctx::forget_context(self.context_id);
        for &(base, len) in &self.pages.get_mut().chunks {
            // SAFETY: mapped by `fresh_page`; the owning context is gone.
            unsafe { os::unmap(base, len) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    static NEXT_ID: AtomicU64 = AtomicU64::new(0xC0DE_0000);

    fn tier() -> PocketTier {
        PocketTier::new(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[test]
    fn class_selection() {
        assert_eq!(class_for(129), Some(0));
        assert_eq!(class_for(192), Some(0));
        assert_eq!(class_for(193), Some(1));
        assert_eq!(class_for(256), Some(1));
        assert_eq!(class_for(257), None);
    }

    #[test]
    fn carving_fills_the_thread_freelist() {
        let t = tier();
        let a = t.alloc(0).unwrap();
        assert_eq!(t.page_count(), 1);
        assert_eq!(t.cached(0), blocks_per_page(192) - 1);
        assert_eq!(a.as_ptr() as usize % 64, 0);
        assert!(t.owns(a.as_ptr() as usize));
        unsafe { t.free(a, 0).unwrap() };
        assert_eq!(t.cached(0), blocks_per_page(192));
    }

    #[test]
    fn freelist_is_lifo() {
        let t = tier();
        let a = t.alloc(1).unwrap();
        let b = t.alloc(1).unwrap();
        unsafe {
            t.free(a, 1).unwrap();
            t.free(b, 1).unwrap();
        }
        assert_eq!(t.alloc(1), Some(b));
        assert_eq!(t.alloc(1), Some(a));
    }

    #[test]
    fn page_tag_mismatch_is_reported() {
        let t = tier();
        let a = t.alloc(0).unwrap();
        assert_eq!(unsafe { t.free(a, 1) }, Err(CorruptionKind::PageTag));
        let other = tier();
        assert_eq!(unsafe { other.free(a, 0) }, Err(CorruptionKind::PageTag));
        let misaligned = NonNull::new(unsafe { a.as_ptr().add(64) }).unwrap();
        assert_eq!(unsafe { t.free(misaligned, 0) }, Err(CorruptionKind::PageTag));
    }

    #[test]
    fn many_pages_stay_distinct() {
        let t = tier();
        let mut seen = HashSet::new();
        for _ in 0..(blocks_per_page(256) * (CHUNK_PAGES + 2)) {
            let b = t.alloc(1).unwrap();
            assert!(seen.insert(b.as_ptr() as usize));
        }
        assert_eq!(t.page_count(), CHUNK_PAGES + 2);
    }

    #[test]
    fn free_under_a_borrowed_freelist_is_parked_not_lost() {
        let t = tier();
        let a = t.alloc(0).unwrap();
        let cached = t.cached(0);
        let nested = thread_ctx::with_pockets(t.context_id, |_| unsafe { t.free(a, 0) });
        assert_eq!(nested, Some(Ok(())));
        assert_eq!(t.overflowed(0), 1);
        assert_eq!(t.cached(0), cached);

        // Served straight from the overflow stack while still re-entered.
        let again = thread_ctx::with_pockets(t.context_id, |_| t.alloc(0));
        assert_eq!(again, Some(Some(a)));
        assert_eq!(t.overflowed(0), 0);
    }

    #[test]
    fn overflow_drains_before_a_new_page_is_carved() {
        let t = tier();
        let mut live = Vec::new();
        for _ in 0..blocks_per_page(192) {
            live.push(t.alloc(0).unwrap());
        }
        assert_eq!(t.cached(0), 0);
        let parked = live.pop().unwrap();
        thread_ctx::with_pockets(t.context_id, |_| unsafe { t.free(parked, 0).unwrap() });
        assert_eq!(t.alloc(0), Some(parked));
        assert_eq!(t.page_count(), 1);
    }

    #[test]
    fn cross_thread_free_lands_on_the_freeing_thread() {
        let t = std::sync::Arc::new(tier());
        let a = t.alloc(0).unwrap().as_ptr() as usize;
        let t2 = std::sync::Arc::clone(&t);
        std::thread::spawn(move || {
            let block = NonNull::new(a as *mut u8).unwrap();
            unsafe { t2.free(block, 0).unwrap() };
            assert_eq!(t2.cached(0), 1);
        })
        .join()
        .unwrap();
    }
}
