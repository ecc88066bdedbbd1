//! Per-allocation header.
//!
//! Every payload handed out is preceded by a 128-byte, cache-line aligned
//! [`Header`]. Immutable fields are sealed with a SipHash-2-4 checksum that
//! also covers the header's own address, so a header copied elsewhere does
//! not verify. With strict checks on, one canary word sits in the last eight
//! header bytes (directly before the payload) and another directly after it.

#![allow(unsafe_code)]

use std::mem::{offset_of, size_of};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::CorruptionKind;
use crate::request::FOREVER;
use crate::roots::RootNode;
use crate::trace::{TraceLog, TraceRecord};

pub const HEADER_SIZE: usize = 128;
pub const HEADER_ALIGN: usize = 64;
pub const MAGIC: u32 = 0x5454_414B;
pub const CANARY_START: u64 = 0xDEAD_BEEF_DEAD_BEEF;
const CANARY_END_BASE: u64 = 0xBEEF_DEAD_BEEF_DEAD;
pub const CANARY_SIZE: usize = 8;

/// Access count above which a tracked root counts as dirty.
pub const DIRTY_ACCESS_THRESHOLD: u64 = 1_000_000;

/// Sub-allocator that produced a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Tier {
    Pocket = 1,
    Bump = 2,
    Buddy = 3,
    /// System allocator or a direct OS mapping.
    General = 4,
    /// Bootstrap bypass: system allocator, no enrichment.
    Raw = 5,
}

impl Tier {
    #[must_use]
    pub const fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Pocket),
            2 => Some(Self::Bump),
            3 => Some(Self::Buddy),
            4 => Some(Self::General),
            5 => Some(Self::Raw),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pocket => "pocket",
            Self::Bump => "bump",
            Self::Buddy => "buddy",
            Self::General => "general",
            Self::Raw => "raw",
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeaderFlags(u8);

impl HeaderFlags {
    pub const CONST: Self = Self(1 << 0);
    pub const VOLATILE: Self = Self(1 << 1);
    pub const ALLOW_DIRECT: Self = Self(1 << 2);
    pub const HUGE: Self = Self(1 << 3);
    pub const STRICT: Self = Self(1 << 4);
    pub const ROOT: Self = Self(1 << 5);

    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn with(self, other: Self, on: bool) -> Self {
        if on { Self(self.0 | other.0) } else { Self(self.0 & !other.0) }
    }
}

/// Fields that change after the header is sealed, guarded by the header lock.
#[derive(Debug)]
pub(crate) struct HeaderState {
    pub(crate) freed: bool,
    pub(crate) trace: Option<Box<TraceLog>>,
}

#[repr(C, align(64))]
pub(crate) struct Header {
    magic: u32,
    tier: u8,
    flags: u8,
    _reserved: u16,
    checksum: u64,
    pub(crate) created: u64,
    pub(crate) expires: u64,
    pub(crate) size: usize,
    canary_end: u64,
    access_count: AtomicU64,
    pin_count: AtomicU64,
    root: AtomicPtr<RootNode>,
    state: Mutex<HeaderState>,
    _pad: [u8; STATE_PAD],
    canary_start: u64,
}

const STATE_END: usize = 72 + size_of::<Mutex<HeaderState>>();
const STATE_PAD: usize = HEADER_SIZE - CANARY_SIZE - STATE_END;

const _: () = assert!(size_of::<Header>() == HEADER_SIZE);
const _: () = assert!(offset_of!(Header, state) == 72);
const _: () = assert!(offset_of!(Header, canary_start) == HEADER_SIZE - CANARY_SIZE);

/// Everything needed to seal a fresh header.
#[derive(Debug)]
pub(crate) struct Stamp {
    pub(crate) tier: Tier,
    pub(crate) flags: HeaderFlags,
    pub(crate) created: u64,
    pub(crate) expires: u64,
    pub(crate) size: usize,
    pub(crate) trace: Option<Box<TraceLog>>,
}

impl Header {
    /// Write and seal a header at `block`; returns the payload pointer.
    ///
    /// With `STRICT` set the trailing canary is written too.
    ///
    /// # Safety
    ///
    /// `block` must be 64-byte aligned and writable for
    /// `HEADER_SIZE + stamp.size (+ CANARY_SIZE when strict)` bytes.
    pub(crate) unsafe fn stamp(block: NonNull<u8>, stamp: Stamp) -> NonNull<u8> {
        let addr = block.as_ptr() as usize;
        let strict = stamp.flags.contains(HeaderFlags::STRICT);
        let (canary_start, canary_end) = if strict {
            (CANARY_START, end_canary(addr))
        } else {
            (0, 0)
        };
        let mut header = Self {
            magic: MAGIC,
            tier: stamp.tier as u8,
            flags: stamp.flags.bits(),
            _reserved: 0,
            checksum: 0,
            created: stamp.created,
            expires: stamp.expires,
            size: stamp.size,
            canary_end,
            access_count: AtomicU64::new(0),
            pin_count: AtomicU64::new(0),
            root: AtomicPtr::new(ptr::null_mut()),
            state: Mutex::new(HeaderState {
                freed: false,
                trace: stamp.trace,
            }),
            _pad: [0; STATE_PAD],
            canary_start,
        };
        header.checksum = header.compute_checksum_at(addr);
        let slot = block.as_ptr().cast::<Self>();
        // SAFETY: caller guarantees alignment and a writable block. The old
        // bytes are not a live header (never dropped in place).
        unsafe {
            ptr::write(slot, header);
            let payload = block.as_ptr().add(HEADER_SIZE);
            if strict {
                ptr::write_unaligned(payload.add(stamp.size).cast::<u64>(), canary_end);
            }
            NonNull::new_unchecked(payload)
        }
    }

    /// Header for a payload pointer.
    ///
    /// # Safety
    ///
    /// `payload` must have been returned by this allocator and the header
    /// memory in front of it must still be mapped.
    pub(crate) unsafe fn from_user<'a>(payload: NonNull<u8>) -> &'a Self {
        // SAFETY: forwarded to the caller.
        unsafe { &*payload.as_ptr().sub(HEADER_SIZE).cast::<Self>() }
    }

    #[inline]
    pub(crate) fn addr(&self) -> usize {
        ptr::from_ref(self) as usize
    }

    #[inline]
    pub(crate) fn payload(&self) -> NonNull<u8> {
        // SAFETY: `self` is a live header; the payload follows it directly.
        unsafe { NonNull::new_unchecked((self.addr() + HEADER_SIZE) as *mut u8) }
    }

    #[inline]
    pub(crate) fn magic_ok(&self) -> bool {
        self.magic == MAGIC
    }

    /// Decoded tier; `None` only on a header that failed identity checks.
    pub(crate) fn tier(&self) -> Option<Tier> {
        Tier::from_u8(self.tier)
    }

    pub(crate) fn flags(&self) -> HeaderFlags {
        HeaderFlags(self.flags)
    }

    pub(crate) fn is_strict(&self) -> bool {
        self.flags().contains(HeaderFlags::STRICT)
    }

    fn compute_checksum_at(&self, addr: usize) -> u64 {
        let meta = u64::from(self.magic)
            | (u64::from(self.tier) << 32)
            | (u64::from(self.flags) << 40);
        sip_hash_2_4(&[
            addr as u64,
            meta,
            self.created,
            self.expires,
            self.size as u64,
            self.canary_start,
            self.canary_end,
        ])
    }

    #[must_use]
    pub(crate) fn compute_checksum(&self) -> u64 {
        self.compute_checksum_at(self.addr())
    }

    /// Magic and checksum.
    pub(crate) fn verify_identity(&self) -> Result<(), CorruptionKind> {
        if !self.magic_ok() {
            return Err(CorruptionKind::BadMagic);
        }
        if self.checksum != self.compute_checksum() {
            return Err(CorruptionKind::Checksum);
        }
        Ok(())
    }

    /// Both canaries; trivially fine without strict checks.
    ///
    /// # Safety
    ///
    /// The payload plus trailing canary must still be mapped.
    pub(crate) unsafe fn verify_canaries(&self) -> Result<(), CorruptionKind> {
        if !self.is_strict() {
            return Ok(());
        }
        if self.canary_start != CANARY_START {
            return Err(CorruptionKind::StartCanary);
        }
        // SAFETY: strict allocations reserve CANARY_SIZE bytes past the payload.
        let tail = unsafe {
            ptr::read_unaligned(self.payload().as_ptr().add(self.size).cast::<u64>())
        };
        if tail != self.canary_end || self.canary_end != end_canary(self.addr()) {
            return Err(CorruptionKind::EndCanary);
        }
        Ok(())
    }

    pub(crate) fn is_freed(&self) -> bool {
        self.state.lock().freed
    }

    /// Mark freed. `None` when it already was; otherwise hands back the
    /// trace log so the caller can record the free and drop it.
    pub(crate) fn try_claim_free(&self) -> Option<Option<Box<TraceLog>>> {
        let mut state = self.state.lock();
        if state.freed {
            return None;
        }
        state.freed = true;
        Some(state.trace.take())
    }

    /// Expiry is exclusive: a block is still live on its expiry tick and
    /// expires on the tick after. Access, dirty inspection and root sweeps
    /// all share this boundary.
    pub(crate) fn is_expired(&self, now: u64) -> bool {
        self.expires != FOREVER && now > self.expires
    }

    pub(crate) fn is_dirty(&self, now: u64) -> bool {
        self.is_expired(now) || self.access_count() > DIRTY_ACCESS_THRESHOLD
    }

    pub(crate) fn touch(&self) -> u64 {
        self.access_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn access_count(&self) -> u64 {
        self.access_count.load(Ordering::Relaxed)
    }

    pub(crate) fn pin(&self) -> u64 {
        self.pin_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Saturates at zero.
    pub(crate) fn unpin(&self) -> u64 {
        let mut cur = self.pin_count.load(Ordering::Acquire);
        while cur > 0 {
            match self.pin_count.compare_exchange_weak(
                cur,
                cur - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return cur - 1,
                Err(actual) => cur = actual,
            }
        }
        0
    }

    pub(crate) fn pin_count(&self) -> u64 {
        self.pin_count.load(Ordering::Acquire)
    }

    pub(crate) fn root(&self) -> *mut RootNode {
        self.root.load(Ordering::Acquire)
    }

    pub(crate) fn set_root(&self, node: *mut RootNode) {
        self.root.store(node, Ordering::Release);
    }

    pub(crate) fn take_root(&self) -> *mut RootNode {
        self.root.swap(ptr::null_mut(), Ordering::AcqRel)
    }

    /// Append to the trace log if one is attached.
    pub(crate) fn record(&self, record: &TraceRecord) {
        if let Some(log) = self.state.lock().trace.as_mut() {
            log.push(record.clone());
        }
    }

    pub(crate) fn attach_trace(&self) {
        let mut state = self.state.lock();
        if !state.freed && state.trace.is_none() {
            state.trace = Some(Box::new(TraceLog::new()));
        }
    }

    pub(crate) fn detach_trace(&self) {
        drop(self.state.lock().trace.take());
    }

    pub(crate) fn trace_records(&self) -> Option<Vec<TraceRecord>> {
        self.state.lock().trace.as_ref().map(|log| log.records())
    }
}

fn end_canary(addr: usize) -> u64 {
    CANARY_END_BASE ^ (addr as u64).rotate_left(29)
}

// ---------------------------------------------------------------------------
// SipHash-2-4 over a word slice, fixed key.
// ---------------------------------------------------------------------------

fn sip_hash_2_4(words: &[u64]) -> u64 {
    const K0: u64 = 0x7469_6572_616c_6c6f;
    const K1: u64 = 0x6865_6164_6572_2121;

    let mut v0: u64 = K0 ^ 0x736f_6d65_7073_6575;
    let mut v1: u64 = K1 ^ 0x646f_7261_6e64_6f6d;
    let mut v2: u64 = K0 ^ 0x6c79_6765_6e65_7261;
    let mut v3: u64 = K1 ^ 0x7465_6462_7974_6573;

    for &m in words {
        v3 ^= m;
        sip_round(&mut v0, &mut v1, &mut v2, &mut v3);
        sip_round(&mut v0, &mut v1, &mut v2, &mut v3);
        v0 ^= m;
    }

    let tail = ((words.len() as u64 * 8) & 0xff) << 56;
    v3 ^= tail;
    sip_round(&mut v0, &mut v1, &mut v2, &mut v3);
    sip_round(&mut v0, &mut v1, &mut v2, &mut v3);
    v0 ^= tail;

    v2 ^= 0xff;
    for _ in 0..4 {
        sip_round(&mut v0, &mut v1, &mut v2, &mut v3);
    }
    v0 ^ v1 ^ v2 ^ v3
}

#[inline(always)]
fn sip_round(v0: &mut u64, v1: &mut u64, v2: &mut u64, v3: &mut u64) {
    *v0 = v0.wrapping_add(*v1);
    *v1 = v1.rotate_left(13);
    *v1 ^= *v0;
    *v0 = v0.rotate_left(32);
    *v2 = v2.wrapping_add(*v3);
    *v3 = v3.rotate_left(16);
    *v3 ^= *v2;
    *v0 = v0.wrapping_add(*v3);
    *v3 = v3.rotate_left(21);
    *v3 ^= *v0;
    *v2 = v2.wrapping_add(*v1);
    *v1 = v1.rotate_left(17);
    *v1 ^= *v2;
    *v2 = v2.rotate_left(32);
}
