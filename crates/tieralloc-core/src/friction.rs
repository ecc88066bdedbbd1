//! Friction matrix: advisory backpressure for low-priority requests.
//!
//! Four 16.16 fixed-point gauges, one per coarse size class. A clean carve
//! pulls its class toward 1.0, a wasteful one toward 2.0. The product of the
//! four is the global friction; only requests flagged low-priority consult it.

use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};

/// 16.16 fixed-point number.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fixed(i32);

impl Fixed {
    pub const FRACTION_BITS: u32 = 16;
    pub const ONE: Self = Self(1 << Self::FRACTION_BITS);

    #[must_use]
    pub const fn from_int(v: i32) -> Self {
        Self(v << Self::FRACTION_BITS)
    }

    #[must_use]
    pub const fn from_raw(raw: i32) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn raw(self) -> i32 {
        self.0
    }

    #[must_use]
    pub fn from_f64(v: f64) -> Self {
        let scaled = (v * f64::from(1u32 << Self::FRACTION_BITS)).round();
        Self(scaled.clamp(f64::from(i32::MIN), f64::from(i32::MAX)) as i32)
    }

    #[must_use]
    pub fn to_f64(self) -> f64 {
        f64::from(self.0) / f64::from(1u32 << Self::FRACTION_BITS)
    }

    /// Saturating fixed-point multiply.
    #[must_use]
    pub const fn mul(self, rhs: Self) -> Self {
        let wide = (self.0 as i64 * rhs.0 as i64) >> Self::FRACTION_BITS;
        if wide > i32::MAX as i64 {
            Self(i32::MAX)
        } else if wide < i32::MIN as i64 {
            Self(i32::MIN)
        } else {
            Self(wide as i32)
        }
    }
}

impl fmt::Display for Fixed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3}", self.to_f64())
    }
}

/// Number of coarse size classes tracked.
pub const FRICTION_CLASSES: usize = 4;

/// EWMA weight is 1 / 2^EWMA_SHIFT.
const EWMA_SHIFT: u32 = 3;

const CLEAN_TARGET: Fixed = Fixed::ONE;
const WASTE_TARGET: Fixed = Fixed::from_int(2);

/// Per-class friction gauges and their product.
#[derive(Debug)]
pub struct FrictionMatrix {
    values: [AtomicI32; FRICTION_CLASSES],
    global: AtomicI32,
    threshold: AtomicI32,
}

impl FrictionMatrix {
    #[must_use]
    pub fn new(threshold: Fixed) -> Self {
        Self {
            values: [const { AtomicI32::new(Fixed::ONE.raw()) }; FRICTION_CLASSES],
            global: AtomicI32::new(Fixed::ONE.raw()),
            threshold: AtomicI32::new(threshold.raw()),
        }
    }

    /// Coarse class for a payload size: pocket-sized, bump-sized, medium, large.
    #[must_use]
    pub const fn class_of(size: usize) -> usize {
        match size {
            0..=120 => 0,
            121..=16_384 => 1,
            16_385..=1_048_576 => 2,
            _ => 3,
        }
    }

    /// A carve is wasteful when its footprint exceeds 1.5x what was needed.
    #[must_use]
    pub const fn is_waste(needed: usize, footprint: usize) -> bool {
        footprint > needed.saturating_add(needed / 2)
    }

    /// Fold one allocation/free decision into the class gauge.
    pub fn observe(&self, class: usize, waste: bool) {
        let Some(slot) = self.values.get(class) else {
            return;
        };
        let target = if waste { WASTE_TARGET } else { CLEAN_TARGET }.raw();
        let mut current = slot.load(Ordering::Relaxed);
        loop {
            let next = current + ((target - current) >> EWMA_SHIFT);
            if next == current {
                break;
            }
            match slot.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        self.refresh_global();
    }

    fn refresh_global(&self) {
        let product = self
            .values
            .iter()
            .map(|v| Fixed::from_raw(v.load(Ordering::Relaxed)))
            .fold(Fixed::ONE, Fixed::mul);
        self.global.store(product.raw(), Ordering::Release);
    }

    #[must_use]
    pub fn value(&self, class: usize) -> Fixed {
        self.values
            .get(class)
            .map_or(Fixed::ONE, |v| Fixed::from_raw(v.load(Ordering::Relaxed)))
    }

    #[must_use]
    pub fn global(&self) -> Fixed {
        Fixed::from_raw(self.global.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn threshold(&self) -> Fixed {
        Fixed::from_raw(self.threshold.load(Ordering::Relaxed))
    }

    pub fn set_threshold(&self, threshold: Fixed) {
        self.threshold.store(threshold.raw(), Ordering::Relaxed);
    }

    /// True when a low-priority request should be refused right now.
    #[must_use]
    pub fn over_threshold(&self) -> bool {
        self.global() > self.threshold()
    }
}
