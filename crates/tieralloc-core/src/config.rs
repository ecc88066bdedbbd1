//! Allocator configuration.
//!
//! Everything has a usable default. `AllocatorConfig::from_env()` overlays the
//! `TIERALLOC_*` environment variables:
//! - `TIERALLOC_TRACE`: `1|on|true|yes` enables trace records.
//! - `TIERALLOC_GC_MIN_MS` / `TIERALLOC_GC_MAX_MS`: reclaimer sleep bounds.
//! - `TIERALLOC_GC_PRESSURE`: bytes of released roots that wake the reclaimer.
//! - `TIERALLOC_GC_MANUAL`: never sweep in the background.
//! - `TIERALLOC_FIT`: `best|worst|first` buddy block selection.
//!
//! Parsing is loose and never fails; unparseable values keep the default.

#![allow(unsafe_code)]

use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use crate::buddy::FitPolicy;
use crate::clock::{Clock, MonotonicClock};
use crate::error::{AllocError, CorruptionPolicy};
use crate::friction::Fixed;
use crate::os;

const KIB: usize = 1024;
const MIB: usize = 1024 * KIB;

/// Background reclaimer pacing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcConfig {
    pub min_interval: Duration,
    pub max_interval: Duration,
    /// Bytes released (refcount reaching zero) that wake the reclaimer early.
    pub pressure_threshold: u64,
    /// Pure-manual mode: the reclaimer never sweeps on its own.
    pub manual: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(10),
            pressure_threshold: MIB as u64,
            manual: false,
        }
    }
}

impl GcConfig {
    pub fn validate(&self) -> Result<(), AllocError> {
        if self.min_interval.is_zero() {
            return Err(AllocError::Misuse("gc min interval must be positive"));
        }
        if self.min_interval > self.max_interval {
            return Err(AllocError::Misuse("gc min interval exceeds max interval"));
        }
        if self.pressure_threshold == 0 {
            return Err(AllocError::Misuse("gc pressure threshold must be positive"));
        }
        Ok(())
    }
}

/// Buddy zone growth and selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuddyConfig {
    pub policy: FitPolicy,
    /// Smallest segment requested from the OS on growth.
    pub min_growth_chunk: usize,
    /// Hard cap on segments, including the initial pool.
    pub max_segments: usize,
    pub max_segment_bytes: usize,
    /// Grow before allocating once used/capacity exceeds this (per mille).
    pub growth_utilization_permille: u32,
}

impl Default for BuddyConfig {
    fn default() -> Self {
        Self {
            policy: FitPolicy::BestFit,
            min_growth_chunk: MIB,
            max_segments: 32,
            max_segment_bytes: 1024 * MIB,
            growth_utilization_permille: 800,
        }
    }
}

/// Caller-supplied initial buddy segment for embedded targets.
///
/// When present, every request is served by the buddy tier.
#[derive(Debug)]
pub struct BackingPool {
    base: NonNull<u8>,
    len: usize,
    owned: bool,
}

// SAFETY: the pool is an address range; the buddy zone serializes all access
// to the memory behind it.
unsafe impl Send for BackingPool {}
// SAFETY: as above.
unsafe impl Sync for BackingPool {}

impl BackingPool {
    /// Borrow an existing memory range as the initial segment.
    ///
    /// # Safety
    ///
    /// `base..base+len` must be writable, unused by anything else, and must
    /// outlive every allocator built from this pool.
    #[must_use]
    pub unsafe fn from_raw_parts(base: NonNull<u8>, len: usize) -> Self {
        Self {
            base,
            len,
            owned: false,
        }
    }

    /// Map a fresh anonymous range of `len` bytes, released on drop.
    pub fn anonymous(len: usize) -> Result<Self, AllocError> {
        let base = os::map(len).ok_or(AllocError::Exhausted { size: len })?;
        Ok(Self {
            base,
            len,
            owned: true,
        })
    }

    #[must_use]
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for BackingPool {
    fn drop(&mut self) {
        if self.owned {
            // SAFETY: mapped by `anonymous`; the zone holding the last Arc
            // clone of this pool is gone.
            unsafe { os::unmap(self.base, self.len) };
        }
    }
}

/// Full allocator configuration.
#[derive(Debug, Clone)]
pub struct AllocatorConfig {
    pub gc: GcConfig,
    pub buddy: BuddyConfig,
    /// Size of the lazily reserved bump range.
    pub bump_region_bytes: usize,
    /// Global friction above which low-priority requests are refused.
    pub friction_threshold: Fixed,
    /// `is_pressure_high()` trips above this many bytes in use.
    pub high_watermark: u64,
    pub trace: bool,
    pub corruption_policy: CorruptionPolicy,
    /// Spawn the reclaimer thread. Off only for deterministic tests.
    pub background_reclaimer: bool,
    /// Embedded mode when set.
    pub pool: Option<Arc<BackingPool>>,
    pub clock: Arc<dyn Clock>,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            gc: GcConfig::default(),
            buddy: BuddyConfig::default(),
            bump_region_bytes: 16 * MIB,
            friction_threshold: Fixed::from_int(4),
            high_watermark: 512 * MIB as u64,
            trace: false,
            corruption_policy: CorruptionPolicy::Abort,
            background_reclaimer: true,
            pool: None,
            clock: Arc::new(MonotonicClock::new()),
        }
    }
}

impl AllocatorConfig {
    /// Defaults with the environment overlaid.
    #[must_use]
    pub fn from_env() -> Self {
        let mut cfg = Self {
            trace: env_trace_default(),
            ..Self::default()
        };
        if let Some(ms) = env_u64("TIERALLOC_GC_MIN_MS") {
            cfg.gc.min_interval = Duration::from_millis(ms.max(1));
        }
        if let Some(ms) = env_u64("TIERALLOC_GC_MAX_MS") {
            cfg.gc.max_interval = Duration::from_millis(ms.max(1));
        }
        if cfg.gc.max_interval < cfg.gc.min_interval {
            cfg.gc.max_interval = cfg.gc.min_interval;
        }
        if let Some(bytes) = env_u64("TIERALLOC_GC_PRESSURE") {
            cfg.gc.pressure_threshold = bytes.max(1);
        }
        if let Ok(raw) = std::env::var("TIERALLOC_GC_MANUAL") {
            cfg.gc.manual = parse_bool_loose(&raw);
        }
        if let Ok(raw) = std::env::var("TIERALLOC_FIT") {
            cfg.buddy.policy = FitPolicy::from_str_loose(&raw);
        }
        cfg
    }

    /// Embedded configuration: everything goes to the buddy tier, seeded with
    /// `pool`.
    #[must_use]
    pub fn embedded(pool: BackingPool) -> Self {
        Self {
            pool: Some(Arc::new(pool)),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn validate(&self) -> Result<(), AllocError> {
        self.gc.validate()?;
        if self.buddy.max_segments == 0 {
            return Err(AllocError::Misuse("buddy zone needs at least one segment"));
        }
        if self.buddy.growth_utilization_permille == 0
            || self.buddy.growth_utilization_permille > 1000
        {
            return Err(AllocError::Misuse("growth utilization must be in 1..=1000"));
        }
        if self.friction_threshold <= Fixed::from_raw(0) {
            return Err(AllocError::Misuse("friction threshold must be positive"));
        }
        Ok(())
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok()?.trim().parse().ok()
}

fn parse_bool_loose(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "on" | "true" | "yes" | "enabled"
    )
}

// 0=unresolved, 1=on, 2=off, 255=resolving. A reader that lands while another
// call is inside std::env::var sees "off" rather than blocking.
static TRACE_DEFAULT: AtomicU8 = AtomicU8::new(TRACE_UNRESOLVED);

const TRACE_UNRESOLVED: u8 = 0;
const TRACE_ON: u8 = 1;
const TRACE_OFF: u8 = 2;
const TRACE_RESOLVING: u8 = 255;

/// Process-wide trace default from `TIERALLOC_TRACE`, resolved once.
#[must_use]
pub fn env_trace_default() -> bool {
    match TRACE_DEFAULT.load(Ordering::Relaxed) {
        TRACE_ON => return true,
        TRACE_OFF | TRACE_RESOLVING => return false,
        _ => {}
    }
    if TRACE_DEFAULT
        .compare_exchange(
            TRACE_UNRESOLVED,
            TRACE_RESOLVING,
            Ordering::SeqCst,
            Ordering::Relaxed,
        )
        .is_err()
    {
        return TRACE_DEFAULT.load(Ordering::Relaxed) == TRACE_ON;
    }
    let on = std::env::var("TIERALLOC_TRACE").is_ok_and(|v| parse_bool_loose(&v));
    TRACE_DEFAULT.store(if on { TRACE_ON } else { TRACE_OFF }, Ordering::Release);
    on
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = AllocatorConfig::default();
        assert_eq!(cfg.gc.min_interval, Duration::from_millis(500));
        assert_eq!(cfg.gc.max_interval, Duration::from_secs(10));
        assert_eq!(cfg.gc.pressure_threshold, 1 << 20);
        assert_eq!(cfg.bump_region_bytes, 16 << 20);
        assert_eq!(cfg.buddy.max_segments, 32);
        assert_eq!(cfg.buddy.growth_utilization_permille, 800);
        assert_eq!(cfg.friction_threshold, Fixed::from_int(4));
        assert!(cfg.pool.is_none());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn gc_validation_rejects_inverted_bounds() {
        let gc = GcConfig {
            min_interval: Duration::from_secs(2),
            max_interval: Duration::from_secs(1),
            ..GcConfig::default()
        };
        assert!(matches!(gc.validate(), Err(AllocError::Misuse(_))));
        let gc = GcConfig {
            min_interval: Duration::ZERO,
            ..GcConfig::default()
        };
        assert!(gc.validate().is_err());
        let gc = GcConfig {
            pressure_threshold: 0,
            ..GcConfig::default()
        };
        assert!(gc.validate().is_err());
    }

    #[test]
    fn loose_bool_parsing() {
        assert!(parse_bool_loose("ON"));
        assert!(parse_bool_loose(" 1 "));
        assert!(!parse_bool_loose("off"));
        assert!(!parse_bool_loose("bogus"));
    }

    #[test]
    fn cached_trace_default_is_sticky() {
        let previous = TRACE_DEFAULT.swap(TRACE_ON, Ordering::SeqCst);
        assert!(env_trace_default());
        TRACE_DEFAULT.store(TRACE_RESOLVING, Ordering::SeqCst);
        assert!(!env_trace_default());
        TRACE_DEFAULT.store(previous, Ordering::SeqCst);
    }

    #[test]
    fn anonymous_pool_is_writable() {
        let pool = BackingPool::anonymous(64 * 1024).expect("mmap");
        assert_eq!(pool.len(), 64 * 1024);
        unsafe {
            pool.base().as_ptr().write(7);
            assert_eq!(*pool.base().as_ptr(), 7);
        }
        let cfg = AllocatorConfig::embedded(pool);
        assert!(cfg.pool.is_some());
    }
}
