//! Thin wrappers over the OS mapping primitives.

#![allow(unsafe_code)]

use std::ptr::{self, NonNull};

pub(crate) const PAGE_SIZE: usize = 4096;
pub(crate) const HUGE_PAGE_SIZE: usize = 2 * 1024 * 1024;

/// Anonymous private read/write mapping, lazily committed.
pub(crate) fn map(len: usize) -> Option<NonNull<u8>> {
    map_with(len, libc::MAP_NORESERVE)
}

/// Huge-page backed mapping. `None` when the OS has no huge pages to give.
///
/// Never combined with `MAP_NORESERVE`: without a reservation the kernel
/// hands out the mapping even when the huge-page pool is empty and the
/// first touch raises SIGBUS. Reserving up front turns that into ENOMEM.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) fn map_huge(len: usize) -> Option<NonNull<u8>> {
    map_with(len, libc::MAP_HUGETLB)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub(crate) fn map_huge(_len: usize) -> Option<NonNull<u8>> {
    None
}

fn map_with(len: usize, extra: libc::c_int) -> Option<NonNull<u8>> {
    if len == 0 {
        return None;
    }
    // SAFETY: anonymous mapping with no address hint; the kernel validates
    // every argument and reports failure through MAP_FAILED.
    let raw = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | extra,
            -1,
            0,
        )
    };
    if raw == libc::MAP_FAILED {
        None
    } else {
        NonNull::new(raw.cast::<u8>())
    }
}

/// # Safety
///
/// `base..base+len` must be a mapping obtained from [`map`]/[`map_huge`]
/// that nothing references anymore.
pub(crate) unsafe fn unmap(base: NonNull<u8>, len: usize) {
    // SAFETY: forwarded to the caller.
    unsafe {
        libc::munmap(base.as_ptr().cast(), len);
    }
}

/// 64-byte aligned heap block from the system allocator.
pub(crate) fn aligned_alloc(len: usize, align: usize) -> Option<NonNull<u8>> {
    let mut out: *mut libc::c_void = ptr::null_mut();
    // SAFETY: `out` is a valid out-pointer and `align` is a power of two
    // multiple of the pointer size.
    let rc = unsafe { libc::posix_memalign(&mut out, align, len.max(1)) };
    if rc != 0 {
        return None;
    }
    NonNull::new(out.cast::<u8>())
}

/// # Safety
///
/// `base` must come from [`aligned_alloc`] and must not be used afterwards.
pub(crate) unsafe fn aligned_free(base: NonNull<u8>) {
    // SAFETY: forwarded to the caller.
    unsafe { libc::free(base.as_ptr().cast()) }
}

#[must_use]
pub(crate) const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

#[must_use]
pub(crate) const fn checked_align_up(value: usize, align: usize) -> Option<usize> {
    match value.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_and_unmap_roundtrip() {
        let base = map(PAGE_SIZE * 4).expect("mmap");
        assert_eq!(base.as_ptr() as usize % PAGE_SIZE, 0);
        unsafe {
            base.as_ptr().write_bytes(0xAB, PAGE_SIZE * 4);
            assert_eq!(*base.as_ptr().add(PAGE_SIZE * 4 - 1), 0xAB);
            unmap(base, PAGE_SIZE * 4);
        }
    }

    #[test]
    fn huge_mapping_is_writable_or_refused() {
        // Hosts without reserved huge pages must refuse up front.
        if let Some(base) = map_huge(HUGE_PAGE_SIZE) {
            unsafe {
                base.as_ptr().write_bytes(0x5A, HUGE_PAGE_SIZE);
                assert_eq!(*base.as_ptr().add(HUGE_PAGE_SIZE - 1), 0x5A);
                unmap(base, HUGE_PAGE_SIZE);
            }
        }
    }

    #[test]
    fn zero_length_map_is_refused() {
        assert!(map(0).is_none());
    }

    #[test]
    fn aligned_alloc_honors_alignment() {
        let p = aligned_alloc(300, 64).expect("posix_memalign");
        assert_eq!(p.as_ptr() as usize % 64, 0);
        unsafe { aligned_free(p) };
    }

    #[test]
    fn alignment_helpers() {
        assert_eq!(align_up(1, 64), 64);
        assert_eq!(align_up(64, 64), 64);
        assert_eq!(checked_align_up(usize::MAX, 64), None);
        assert_eq!(checked_align_up(65, 64), Some(128));
    }
}
