//! Allocator context: the dispatcher and every piece of shared state.
//!
//! One [`AllocatorContext`] owns its tiers, root tracker, friction matrix,
//! metrics and reclaimer thread. Nothing is process-global except the
//! per-thread pocket shards, which are keyed by context id.
//!
//! # Routing
//!
//! | request                      | tier                                   |
//! |------------------------------|----------------------------------------|
//! | calling thread bootstrapping | raw (system allocator, minimal header) |
//! | embedded (backing pool)      | buddy                                  |
//! | `HUGE_PAGES`                 | general, huge mapping if available     |
//! | payload <= 120 B             | pocket                                 |
//! | payload <= 16 KiB            | bump                                   |
//! | larger                       | buddy, then general                    |
//!
//! A tier that cannot serve a request passes it down. When nothing can,
//! one emergency reclaim runs and placement is retried exactly once.

#![allow(unsafe_code)]

use std::ptr::{self, NonNull};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde_json::json;

use crate::buddy::{BuddyReport, BuddyRequest, BuddyViolation, BuddyZone, FitPolicy};
use crate::bump::BumpTier;
use crate::clock::Clock;
use crate::config::{AllocatorConfig, GcConfig};
use crate::epoch::{self, EpochDomain, Reclaim};
use crate::error::{self, AllocError, CorruptionKind, CorruptionPolicy};
use crate::friction::FrictionMatrix;
use crate::general::GeneralTier;
use crate::header::{CANARY_SIZE, HEADER_ALIGN, HEADER_SIZE, Header, HeaderFlags, Stamp, Tier};
use crate::metrics::{AllocatorMetrics, MetricsSnapshot, TierUsage};
use crate::os;
use crate::pocket::{self, POCKET_CLASSES, PocketTier};
use crate::reclaimer::{self, ReclaimerHandle, Sweep};
use crate::request::{AllocFlags, AllocRequest, FOREVER};
use crate::roots::{Detached, RootInfo, RootNode, RootTracker};
use crate::thread_ctx::{self, BootstrapScope};
use crate::trace::{StderrSink, TraceEvent, TraceLog, TraceRecord, TraceSink};

/// Largest payload routed to the pocket tier.
pub const POCKET_MAX_PAYLOAD: usize = 120;
/// Largest payload routed to the bump tier.
pub const BUMP_MAX_PAYLOAD: usize = 16 * 1024;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

struct Placement {
    block: NonNull<u8>,
    tier: Tier,
    footprint: usize,
    huge: bool,
}

/// Bytes between the header and the end of the trailing canary.
fn span_of(size: usize, strict: bool) -> usize {
    if strict { size + CANARY_SIZE } else { size }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

struct Inner {
    id: u64,
    embedded: bool,
    pocket: Option<PocketTier>,
    bump: BumpTier,
    buddy: Arc<BuddyZone>,
    general: GeneralTier,
    roots: RootTracker,
    friction: FrictionMatrix,
    metrics: Arc<AllocatorMetrics>,
    reclaim: Arc<dyn Reclaim>,
    clock: Arc<dyn Clock>,
    trace: AtomicBool,
    sink: RwLock<Arc<dyn TraceSink>>,
    policy: CorruptionPolicy,
    high_watermark: u64,
    fit: FitPolicy,
}

impl Inner {
    #[cold]
    fn corrupt(&self, kind: CorruptionKind, addr: usize) -> ! {
        self.emit(|| {
            TraceRecord::new(TraceEvent::Corruption, addr, self.clock.now())
                .with_details(json!({ "kind": kind.as_str() }))
        });
        error::fatal(kind, addr, self.policy)
    }

    fn tracing(&self) -> bool {
        self.trace.load(Ordering::Relaxed)
    }

    /// Hand a record to the sink. Nested emission (a sink that allocates)
    /// is suppressed: the sink runs inside a bootstrap scope.
    fn emit(&self, record: impl FnOnce() -> TraceRecord) {
        if !self.tracing() || thread_ctx::in_bootstrap() {
            return;
        }
        let record = record();
        let sink = Arc::clone(&self.sink.read());
        let _scope = BootstrapScope::enter();
        sink.emit(&record);
    }

    // -----------------------------------------------------------------------
    // Placement
    // -----------------------------------------------------------------------

    fn place(&self, size: usize, total: usize, flags: AllocFlags) -> Option<Placement> {
        if self.embedded {
            return self.place_buddy(total);
        }
        if flags.contains(AllocFlags::HUGE_PAGES) {
            return self.place_general(total, true);
        }
        if size <= POCKET_MAX_PAYLOAD {
            if let (Some(tier), Some(class)) = (&self.pocket, pocket::class_for(total)) {
                if let Some(block) = tier.alloc(class) {
                    return Some(Placement {
                        block,
                        tier: Tier::Pocket,
                        footprint: POCKET_CLASSES[class],
                        huge: false,
                    });
                }
            }
        }
        if size <= BUMP_MAX_PAYLOAD {
            if let Some(block) = self.bump.alloc(total) {
                return Some(Placement {
                    block,
                    tier: Tier::Bump,
                    footprint: BumpTier::footprint(total),
                    huge: false,
                });
            }
        }
        self.place_buddy(total)
            .or_else(|| self.place_general(total, false))
    }

    fn place_buddy(&self, total: usize) -> Option<Placement> {
        let footprint = BuddyZone::block_size_for(total)?;
        let growths = AllocatorMetrics::get(&self.metrics.buddy_growths);
        let req = BuddyRequest::new(total)
            .policy(self.fit)
            .owner_tag(self.id as u32);
        let block = self.buddy.alloc(&req)?;
        if AllocatorMetrics::get(&self.metrics.buddy_growths) != growths {
            self.emit(|| {
                TraceRecord::new(TraceEvent::Growth, 0, self.clock.now()).with_details(json!({
                    "capacity": self.buddy.capacity(),
                    "segments": self.buddy.segment_count(),
                }))
            });
        }
        Some(Placement {
            block,
            tier: Tier::Buddy,
            footprint,
            huge: false,
        })
    }

    fn place_general(&self, total: usize, huge: bool) -> Option<Placement> {
        let (block, info) = self.general.alloc(total, huge)?;
        Some(Placement {
            block,
            tier: Tier::General,
            footprint: info.len,
            huge: info.huge,
        })
    }

    /// Bootstrap path: system allocator, sealed header, nothing else.
    fn alloc_raw(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let total = HEADER_SIZE
            .checked_add(size)
            .ok_or(AllocError::Misuse("allocation size overflows"))?;
        let (block, _) = self
            .general
            .alloc(total, false)
            .ok_or(AllocError::Exhausted { size })?;
        let stamp = Stamp {
            tier: Tier::Raw,
            flags: HeaderFlags::ALLOW_DIRECT,
            created: 0,
            expires: FOREVER,
            size,
            trace: None,
        };
        // SAFETY: the general tier returned `total` writable, 64-byte aligned bytes.
        let payload = unsafe {
            let payload = Header::stamp(block, stamp);
            ptr::write_bytes(payload.as_ptr(), 0, size);
            payload
        };
        AllocatorMetrics::inc(&self.metrics.allocations);
        self.metrics.tier_hit(Tier::Raw);
        self.metrics.charge(total);
        Ok(payload)
    }

    // -----------------------------------------------------------------------
    // Allocation
    // -----------------------------------------------------------------------

    fn alloc(&self, req: &AllocRequest) -> Result<NonNull<u8>, AllocError> {
        let mut size = req.size.max(1);
        if thread_ctx::in_bootstrap() {
            return self.alloc_raw(size);
        }
        if req.flags.contains(AllocFlags::CACHE_ALIGNED) {
            size = os::checked_align_up(size, HEADER_ALIGN)
                .ok_or(AllocError::Misuse("allocation size overflows"))?;
        }
        let strict = req.is_strict();
        let total = size
            .checked_add(HEADER_SIZE + CANARY_SIZE)
            .map(|t| if strict { t } else { t - CANARY_SIZE })
            .ok_or(AllocError::Misuse("allocation size overflows"))?;

        if req.flags.contains(AllocFlags::LOW_PRIORITY) && self.friction.over_threshold() {
            AllocatorMetrics::inc(&self.metrics.friction_rejections);
            let friction = self.friction.global();
            self.emit(|| {
                TraceRecord::new(TraceEvent::Backpressure, 0, req.now)
                    .with_size(size)
                    .with_details(json!({ "friction": friction.to_f64() }))
            });
            return Err(AllocError::Backpressure { size, friction });
        }

        let placed = match self.place(size, total, req.flags) {
            Some(p) => p,
            None => {
                AllocatorMetrics::inc(&self.metrics.reclaim_retries);
                self.emergency_reclaim(req.now);
                match self.place(size, total, req.flags) {
                    Some(p) => p,
                    None => {
                        AllocatorMetrics::inc(&self.metrics.exhaustion_failures);
                        self.emit(|| {
                            TraceRecord::new(TraceEvent::Exhausted, 0, req.now).with_size(size)
                        });
                        return Err(AllocError::Exhausted { size });
                    }
                }
            }
        };

        let flags = HeaderFlags::empty()
            .with(HeaderFlags::CONST, req.is_const)
            .with(HeaderFlags::VOLATILE, req.is_volatile)
            .with(HeaderFlags::ALLOW_DIRECT, req.allow_direct)
            .with(HeaderFlags::HUGE, placed.huge)
            .with(HeaderFlags::STRICT, strict)
            .with(HeaderFlags::ROOT, req.is_root);
        let expires = req.expiry();
        let stamp = Stamp {
            tier: placed.tier,
            flags,
            created: req.now,
            expires,
            size,
            trace: self.tracing().then(|| Box::new(TraceLog::new())),
        };
        // SAFETY: every tier hands out 64-byte aligned blocks of at least
        // `total` bytes, which covers header, payload and trailing canary.
        let payload = unsafe {
            let payload = Header::stamp(placed.block, stamp);
            ptr::write_bytes(payload.as_ptr(), 0, size);
            payload
        };

        AllocatorMetrics::inc(&self.metrics.allocations);
        self.metrics.tier_hit(placed.tier);
        self.metrics.charge(placed.footprint);
        self.friction.observe(
            FrictionMatrix::class_of(size),
            FrictionMatrix::is_waste(total, placed.footprint),
        );

        // SAFETY: stamped just above.
        let header = unsafe { Header::from_user(payload) };
        if req.is_root {
            let node = self.roots.add(payload.as_ptr() as usize, size, expires);
            header.set_root(node);
        }
        if self.tracing() {
            let record = TraceRecord::new(TraceEvent::Alloc, payload.as_ptr() as usize, req.now)
                .with_size(size)
                .with_tier(placed.tier)
                .with_root(req.is_root);
            header.record(&record);
            self.emit(|| record);
        }
        Ok(payload)
    }

    // -----------------------------------------------------------------------
    // Release
    // -----------------------------------------------------------------------

    /// Validate a header reached from a caller pointer. Fatal on damage.
    fn checked_header<'a>(&self, payload: NonNull<u8>) -> &'a Header {
        // SAFETY: callers of the public API promise `payload` came from
        // this context, so the header memory is mapped.
        let header = unsafe { Header::from_user(payload) };
        if let Err(kind) = header.verify_identity() {
            self.corrupt(kind, header.addr());
        }
        header
    }

    /// True when `addr` may still be the header of a live block: inside a
    /// tier that keeps its memory mapped, or a tracked general block start.
    fn holds_block(&self, addr: usize) -> bool {
        self.pocket.as_ref().is_some_and(|p| p.owns(addr))
            || self.bump.owns(addr)
            || self.buddy.owns(addr)
            || self.general.tracks(addr)
    }

    /// # Safety
    ///
    /// `payload` must be null or a live (or already freed but not reused)
    /// allocation of this context.
    unsafe fn free(&self, payload: *mut u8) {
        let Some(payload) = NonNull::new(payload) else {
            return;
        };
        let _guard = epoch::pin(&*self.reclaim);
        // General and raw blocks go back to the system on free, so their
        // headers cannot be read a second time.
        if !self.holds_block((payload.as_ptr() as usize).wrapping_sub(HEADER_SIZE)) {
            AllocatorMetrics::inc(&self.metrics.double_frees_ignored);
            return;
        }
        let header = self.checked_header(payload);
        let Some(_log) = header.try_claim_free() else {
            AllocatorMetrics::inc(&self.metrics.double_frees_ignored);
            return;
        };
        // SAFETY: claimed but not yet released, so payload and canary are
        // still mapped.
        if let Err(kind) = unsafe { header.verify_canaries() } {
            self.corrupt(kind, header.addr());
        }
        let node = header.take_root();
        if !node.is_null() {
            // SAFETY: the link was set by `alloc` and only the claimant of
            // the header takes it.
            unsafe { self.roots.remove(node) };
        }
        // SAFETY: claimed above; no root node refers to it anymore.
        unsafe { self.release_claimed(header, TraceEvent::Free) };
    }

    /// Return a claimed block to its tier and settle the accounting.
    ///
    /// # Safety
    ///
    /// The caller must have won `try_claim_free` on `header` and must not
    /// touch the block afterwards.
    unsafe fn release_claimed(&self, header: &Header, event: TraceEvent) {
        let addr = header.addr();
        let size = header.size;
        let span = span_of(size, header.is_strict());
        let total = HEADER_SIZE + span;
        let Some(tier) = header.tier() else {
            self.corrupt(CorruptionKind::BadMagic, addr);
        };
        // SAFETY: headers live at 64-byte aligned, non-null block starts.
        let block = unsafe { NonNull::new_unchecked(addr as *mut u8) };
        let footprint = match tier {
            Tier::Pocket => {
                let Some(tier_ref) = &self.pocket else {
                    self.corrupt(CorruptionKind::PageTag, addr);
                };
                let Some(class) = pocket::class_for(total) else {
                    self.corrupt(CorruptionKind::PageTag, addr);
                };
                // SAFETY: claimed pocket block of this context.
                if let Err(kind) = unsafe { tier_ref.free(block, class) } {
                    self.corrupt(kind, addr);
                }
                POCKET_CLASSES[class]
            }
            Tier::Bump => BumpTier::footprint(total),
            Tier::Buddy => {
                let expected = BuddyZone::block_size_for(total);
                // SAFETY: the header sits at the usable start of a buddy block.
                match unsafe { self.buddy.free(block) } {
                    Ok(released) if Some(released) == expected => released,
                    Ok(_) => self.corrupt(CorruptionKind::BlockState, addr),
                    Err(kind) => self.corrupt(kind, addr),
                }
            }
            Tier::General | Tier::Raw => {
                let expected = match tier {
                    Tier::Raw => HEADER_SIZE + size,
                    _ if header.flags().contains(HeaderFlags::HUGE) => {
                        os::align_up(total, os::HUGE_PAGE_SIZE)
                    }
                    _ => total,
                };
                // SAFETY: claimed; nothing reads the block after this.
                match unsafe { self.general.free(block) } {
                    Some(info) if info.len == expected => info.len,
                    _ => self.corrupt(CorruptionKind::BlockState, addr),
                }
            }
        };
        self.metrics.credit(footprint);
        AllocatorMetrics::inc(&self.metrics.frees);
        if tier != Tier::Raw {
            self.friction.observe(FrictionMatrix::class_of(size), false);
        }
        self.emit(|| {
            TraceRecord::new(event, addr + HEADER_SIZE, self.clock.now())
                .with_size(size)
                .with_tier(tier)
        });
    }

    // -----------------------------------------------------------------------
    // Roots
    // -----------------------------------------------------------------------

    /// Detach and free every root `select` accepts. Runs the predicate under
    /// the tracker lock and claims each header before detaching it.
    fn reap(&self, event: TraceEvent, mut select: impl FnMut(&RootNode, &Header) -> bool) -> usize {
        let reaped = self.roots.sweep(|node| {
            // SAFETY: a tracked root is live until its node is removed, which
            // needs the lock we are holding.
            let header = unsafe { Header::from_user(NonNull::new_unchecked(node.ptr as *mut u8)) };
            if !select(node, header) {
                return None;
            }
            header.try_claim_free()?;
            header.take_root();
            Some(())
        });
        let freed = reaped.len();
        for (node, ()) in reaped {
            self.release_detached(node, event);
        }
        freed
    }

    fn release_detached(&self, node: Detached, event: TraceEvent) {
        // SAFETY: the header was claimed during the sweep and its root link
        // cleared, so this is the only release.
        unsafe {
            let header = Header::from_user(NonNull::new_unchecked(node.ptr as *mut u8));
            self.release_claimed(header, event);
        }
        if node.ref_count() == 0 {
            self.roots.relieve_pressure(node.size as u64);
        }
        AllocatorMetrics::inc(&self.metrics.roots_reclaimed);
    }

    /// Roots with no references, a passed expiry and no pins.
    fn cleanup_roots(&self, now: u64) -> usize {
        self.reap(TraceEvent::Reclaim, |node, header| {
            node.ref_count() == 0 && header.is_expired(now) && header.pin_count() == 0
        })
    }

    fn autoclean(&self, now: u64) -> usize {
        let freed = self.reap(TraceEvent::Autoclean, |_, header| {
            header.is_dirty(now) && header.pin_count() == 0
        });
        if freed > 0 {
            self.emit(|| {
                TraceRecord::new(TraceEvent::Autoclean, 0, now)
                    .with_details(json!({ "freed": freed }))
            });
        }
        freed
    }

    fn emergency_reclaim(&self, now: u64) {
        let freed = self.autoclean(now);
        self.reclaim.flush();
        let merges = self.buddy.defragment();
        self.emit(|| {
            TraceRecord::new(TraceEvent::Defrag, 0, now)
                .with_details(json!({ "merges": merges, "roots_freed": freed }))
        });
    }
}

impl Sweep for Inner {
    fn tracker(&self) -> &RootTracker {
        &self.roots
    }

    fn sweep_expired(&self) -> usize {
        self.cleanup_roots(self.clock.now())
    }

    fn flush_deferred(&self) {
        self.reclaim.flush();
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        for node in self.roots.drain() {
            // SAFETY: no other thread can reach the context anymore.
            let header = unsafe { Header::from_user(NonNull::new_unchecked(node.ptr as *mut u8)) };
            if header.try_claim_free().is_some() {
                header.take_root();
                self.release_detached(node, TraceEvent::Reclaim);
            }
        }
        self.reclaim.flush();
    }
}

// ---------------------------------------------------------------------------
// Public handle
// ---------------------------------------------------------------------------

/// A complete allocator instance.
///
/// ```no_run
/// use tieralloc_core::{AllocRequest, AllocatorConfig, AllocatorContext};
///
/// let ctx = AllocatorContext::new(AllocatorConfig::default()).unwrap();
/// let p = ctx.alloc(&AllocRequest::new(64)).unwrap();
/// unsafe {
///     p.as_ptr().write(1);
///     ctx.free(p.as_ptr());
/// }
/// ```
pub struct AllocatorContext {
    inner: Arc<Inner>,
    reclaimer: Mutex<Option<ReclaimerHandle>>,
}

impl std::fmt::Debug for AllocatorContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocatorContext")
            .field("id", &self.inner.id)
            .field("embedded", &self.inner.embedded)
            .field("bytes_in_use", &self.bytes_in_use())
            .finish_non_exhaustive()
    }
}

impl AllocatorContext {
    /// Build a context with the default epoch reclamation domain.
    pub fn new(config: AllocatorConfig) -> Result<Self, AllocError> {
        Self::with_reclaim(config, Arc::new(EpochDomain::new()))
    }

    /// Build a context that defers buddy frees to `reclaim`.
    pub fn with_reclaim(config: AllocatorConfig, reclaim: Arc<dyn Reclaim>) -> Result<Self, AllocError> {
        config.validate()?;
        let id = NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed);
        let metrics = Arc::new(AllocatorMetrics::new());
        let embedded = config.pool.is_some();
        let buddy = BuddyZone::new(
            config.buddy,
            config.pool.clone(),
            Arc::clone(&reclaim),
            Arc::clone(&metrics),
        );
        let inner = Arc::new(Inner {
            id,
            embedded,
            pocket: (!embedded).then(|| PocketTier::new(id)),
            bump: BumpTier::new(config.bump_region_bytes),
            buddy,
            general: GeneralTier::new(),
            roots: RootTracker::new(&config.gc),
            friction: FrictionMatrix::new(config.friction_threshold),
            metrics,
            reclaim,
            clock: config.clock,
            trace: AtomicBool::new(config.trace),
            sink: RwLock::new(Arc::new(StderrSink)),
            policy: config.corruption_policy,
            high_watermark: config.high_watermark,
            fit: config.buddy.policy,
        });
        let reclaimer = if config.background_reclaimer {
            let handle = reclaimer::spawn(Arc::clone(&inner))
                .map_err(|_| AllocError::Misuse("reclaimer thread could not be spawned"))?;
            Some(handle)
        } else {
            None
        };
        Ok(Self {
            inner,
            reclaimer: Mutex::new(reclaimer),
        })
    }

    /// Allocate per `req`. The payload is zeroed and 64-byte aligned.
    pub fn alloc(&self, req: &AllocRequest) -> Result<NonNull<u8>, AllocError> {
        self.inner.alloc(req)
    }

    /// Resize. A null `ptr` behaves as `alloc` with direct access allowed.
    /// Attribute flags and strict checking carry over from the old block;
    /// `min(old, new)` bytes are copied and the old block is freed.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or an allocation of this context.
    pub unsafe fn realloc(&self, ptr: *mut u8, req: &AllocRequest) -> Result<NonNull<u8>, AllocError> {
        let Some(old) = NonNull::new(ptr) else {
            let mut req = *req;
            req.allow_direct = true;
            return self.inner.alloc(&req);
        };
        let (new, copied) = {
            let _guard = epoch::pin(&*self.inner.reclaim);
            let header = self.inner.checked_header(old);
            if header.is_freed() {
                return Err(AllocError::Misuse("realloc of a freed allocation"));
            }
            // SAFETY: live block.
            if let Err(kind) = unsafe { header.verify_canaries() } {
                self.inner.corrupt(kind, header.addr());
            }
            let new = self.inner.alloc(&inherit(req, header))?;
            let copied = header.size.min(req.size.max(1));
            // SAFETY: both payloads hold at least `copied` bytes and are
            // distinct live blocks.
            unsafe { ptr::copy_nonoverlapping(old.as_ptr(), new.as_ptr(), copied) };
            (new, copied)
        };
        // SAFETY: forwarded.
        unsafe { self.inner.free(old.as_ptr()) };
        self.inner.emit(|| {
            TraceRecord::new(TraceEvent::Realloc, new.as_ptr() as usize, req.now)
                .with_size(req.size)
                .with_details(json!({ "from": format!("{:#x}", old.as_ptr() as usize), "copied": copied }))
        });
        Ok(new)
    }

    /// Copy `src` into a fresh allocation. An allocation of this context
    /// passes on its attributes and at most its own size is copied; any
    /// other source is read for `req.size` bytes.
    ///
    /// # Safety
    ///
    /// `src` must be an allocation of this context, or readable for
    /// `req.size` bytes.
    pub unsafe fn dup(&self, src: *const u8, req: &AllocRequest) -> Result<NonNull<u8>, AllocError> {
        let Some(src) = NonNull::new(src.cast_mut()) else {
            return Err(AllocError::Misuse("dup of a null pointer"));
        };
        let _guard = epoch::pin(&*self.inner.reclaim);
        let (new, copied) = if self.owns(src.as_ptr()) {
            let header = self.inner.checked_header(src);
            if header.is_freed() {
                return Err(AllocError::Misuse("dup of a freed allocation"));
            }
            let new = self.inner.alloc(&inherit(req, header))?;
            (new, header.size.min(req.size.max(1)))
        } else {
            (self.inner.alloc(req)?, req.size)
        };
        // SAFETY: per the contract `src` is readable for `copied` bytes and
        // the new block holds at least that many.
        unsafe { ptr::copy_nonoverlapping(src.as_ptr(), new.as_ptr(), copied) };
        Ok(new)
    }

    /// Release an allocation. Null is a no-op; a repeated free is counted
    /// and otherwise ignored. Header or canary damage is fatal.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or an allocation of this context whose memory has
    /// not been handed out again.
    pub unsafe fn free(&self, ptr: *mut u8) {
        // SAFETY: forwarded.
        unsafe { self.inner.free(ptr) }
    }

    /// The payload pointer if the allocation is live, unexpired and allows
    /// direct access; bumps its access counter. Corruption is fatal.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or an allocation of this context whose memory is
    /// still mapped.
    pub unsafe fn access(&self, ptr: *mut u8, now: u64) -> Option<NonNull<u8>> {
        let payload = NonNull::new(ptr)?;
        let _guard = epoch::pin(&*self.inner.reclaim);
        // SAFETY: forwarded.
        let header = unsafe { Header::from_user(payload) };
        if !header.magic_ok() {
            return None;
        }
        if let Err(kind) = header.verify_identity() {
            self.inner.corrupt(kind, header.addr());
        }
        if header.is_freed() {
            return None;
        }
        // SAFETY: live block.
        if let Err(kind) = unsafe { header.verify_canaries() } {
            self.inner.corrupt(kind, header.addr());
        }
        if header.is_expired(now) || !header.flags().contains(HeaderFlags::ALLOW_DIRECT) {
            return None;
        }
        header.touch();
        Some(payload)
    }

    fn live_header(&self, ptr: *mut u8) -> Option<&Header> {
        let header = self.inner.checked_header(NonNull::new(ptr)?);
        (!header.is_freed()).then_some(header)
    }

    /// Add a reference to a root; `None` for non-roots.
    ///
    /// # Safety
    ///
    /// As for [`Self::access`].
    pub unsafe fn retain(&self, ptr: *mut u8) -> Option<u32> {
        self.inner.roots.retain(self.live_header(ptr)?)
    }

    /// Drop a reference to a root. At zero the root becomes reclaimable and
    /// its size counts toward reclaimer pressure.
    ///
    /// # Safety
    ///
    /// As for [`Self::access`].
    pub unsafe fn release(&self, ptr: *mut u8) -> Option<u32> {
        self.inner.roots.release(self.live_header(ptr)?)
    }

    /// Pinned allocations are never reclaimed automatically.
    ///
    /// # Safety
    ///
    /// As for [`Self::access`].
    pub unsafe fn pin(&self, ptr: *mut u8) -> Option<u64> {
        self.live_header(ptr).map(Header::pin)
    }

    /// # Safety
    ///
    /// As for [`Self::access`].
    pub unsafe fn unpin(&self, ptr: *mut u8) -> Option<u64> {
        self.live_header(ptr).map(Header::unpin)
    }

    /// # Safety
    ///
    /// As for [`Self::access`].
    pub unsafe fn tier_of(&self, ptr: *mut u8) -> Option<Tier> {
        self.live_header(ptr)?.tier()
    }

    /// Payload size recorded at allocation (after cache-line rounding).
    ///
    /// # Safety
    ///
    /// As for [`Self::access`].
    pub unsafe fn size_of(&self, ptr: *mut u8) -> Option<usize> {
        self.live_header(ptr).map(|h| h.size)
    }

    /// Records on the allocation's diagnostic log, if one is attached.
    ///
    /// # Safety
    ///
    /// As for [`Self::access`].
    pub unsafe fn trace_log(&self, ptr: *mut u8) -> Option<Vec<TraceRecord>> {
        self.live_header(ptr)?.trace_records()
    }

    /// Whether `ptr` lies in memory this context handed out.
    pub fn owns(&self, ptr: *const u8) -> bool {
        let addr = ptr as usize;
        let inner = &self.inner;
        inner.pocket.as_ref().is_some_and(|p| p.owns(addr))
            || inner.bump.owns(addr)
            || inner.buddy.owns(addr)
            || inner.general.owns(addr)
    }

    // -----------------------------------------------------------------------
    // Reclamation controls
    // -----------------------------------------------------------------------

    pub fn configure_gc(&self, min: Duration, max: Duration, pressure_threshold: u64) -> Result<(), AllocError> {
        let gc = GcConfig {
            min_interval: min,
            max_interval: max,
            pressure_threshold,
            manual: self.inner.roots.is_manual(),
        };
        gc.validate()?;
        self.inner.roots.configure(min, max, pressure_threshold);
        Ok(())
    }

    /// In manual mode the reclaimer never sweeps; use [`Self::cleanup_roots`].
    pub fn set_manual_cleanup(&self, manual: bool) {
        self.inner.roots.set_manual(manual);
    }

    /// One reclaimer sweep, run on the calling thread.
    pub fn cleanup_roots(&self, now: u64) -> usize {
        self.inner.cleanup_roots(now)
    }

    /// Tracked roots that are expired or heavily accessed.
    pub fn inspect_dirty(&self, now: u64) -> Vec<NonNull<u8>> {
        let mut dirty = Vec::new();
        self.inner.roots.for_each(|node| {
            // SAFETY: tracked roots are live while the tracker lock is held.
            let header = unsafe { Header::from_user(NonNull::new_unchecked(node.ptr as *mut u8)) };
            if header.is_dirty(now) {
                dirty.push(header.payload());
            }
        });
        dirty
    }

    /// Free every unpinned dirty root; returns how many were freed.
    pub fn autoclean(&self, now: u64) -> usize {
        self.inner.autoclean(now)
    }

    /// Run deferred buddy frees that are already safe.
    pub fn flush_deferred(&self) -> usize {
        self.inner.reclaim.flush()
    }

    pub fn root_count(&self) -> usize {
        self.inner.roots.len()
    }

    pub fn root_info(&self, ptr: *const u8) -> Option<RootInfo> {
        self.inner.roots.find(ptr as usize)
    }

    /// Bytes of released roots awaiting reclamation.
    pub fn reclaim_pressure(&self) -> u64 {
        self.inner.roots.pressure()
    }

    /// Completed reclaimer cycles.
    pub fn reclaimer_cycles(&self) -> u64 {
        self.inner.roots.cycles()
    }

    // -----------------------------------------------------------------------
    // Tracing
    // -----------------------------------------------------------------------

    /// Toggle trace records. Also attaches (or detaches) a diagnostic log on
    /// every tracked root.
    pub fn set_trace(&self, enabled: bool) {
        self.inner.trace.store(enabled, Ordering::Relaxed);
        self.inner.roots.for_each(|node| {
            // SAFETY: as in `inspect_dirty`.
            let header = unsafe { Header::from_user(NonNull::new_unchecked(node.ptr as *mut u8)) };
            if enabled {
                header.attach_trace();
            } else {
                header.detach_trace();
            }
        });
    }

    pub fn is_trace_enabled(&self) -> bool {
        self.inner.tracing()
    }

    pub fn set_trace_sink(&self, sink: Arc<dyn TraceSink>) {
        *self.inner.sink.write() = sink;
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    pub fn bytes_in_use(&self) -> u64 {
        AllocatorMetrics::get(&self.inner.metrics.bytes_in_use)
    }

    pub fn is_pressure_high(&self) -> bool {
        self.bytes_in_use() > self.inner.high_watermark
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub fn tier_usage(&self) -> TierUsage {
        let inner = &self.inner;
        TierUsage {
            pocket_pages: inner.pocket.as_ref().map_or(0, PocketTier::page_count),
            bump_carved: inner.bump.used(),
            buddy_used: inner.buddy.used(),
            buddy_capacity: inner.buddy.capacity(),
            buddy_segments: inner.buddy.segment_count(),
            general_blocks: inner.general.live_count(),
        }
    }

    pub fn friction(&self) -> &FrictionMatrix {
        &self.inner.friction
    }

    pub fn is_embedded(&self) -> bool {
        self.inner.embedded
    }

    pub fn buddy_capacity(&self) -> usize {
        self.inner.buddy.capacity()
    }

    pub fn buddy_segments(&self) -> usize {
        self.inner.buddy.segment_count()
    }

    /// Verify the buddy zone. Only meaningful while no other thread uses the
    /// context; deferred frees are flushed first.
    pub fn check_buddy_invariants(&self) -> Result<BuddyReport, BuddyViolation> {
        self.inner.reclaim.flush();
        self.inner.buddy.check_invariants()
    }

    /// Stop the reclaimer thread. Idempotent; also run on drop.
    pub fn shutdown(&self) {
        if let Some(handle) = self.reclaimer.lock().take() {
            handle.stop(&self.inner.roots);
        }
    }
}

impl Drop for AllocatorContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// `req` with attributes and strict checking taken from an existing block.
fn inherit(req: &AllocRequest, header: &Header) -> AllocRequest {
    let flags = header.flags();
    let mut out = *req;
    out.is_const = flags.contains(HeaderFlags::CONST);
    out.is_volatile = flags.contains(HeaderFlags::VOLATILE);
    out.allow_direct = flags.contains(HeaderFlags::ALLOW_DIRECT);
    if header.is_strict() {
        out.flags |= AllocFlags::STRICT_CHECK;
    }
    out
}
