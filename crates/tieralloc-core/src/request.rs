//! Allocation requests: size, lifetime, access attributes and behavior flags.

use std::ops::{BitOr, BitOrAssign};

/// Expiry sentinel meaning "never expires".
pub const FOREVER: u64 = u64::MAX;

/// How long an allocation stays valid, in caller-defined ticks.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lifetime {
    /// No expiry.
    #[default]
    Forever,
    /// Expires `n` ticks after the creation tick.
    Ticks(u64),
}

impl Lifetime {
    /// Absolute expiry tick for an allocation created at `now`.
    ///
    /// Finite lifetimes saturate one below [`FOREVER`] so they can never be
    /// confused with the sentinel.
    #[must_use]
    pub const fn expiry(self, now: u64) -> u64 {
        match self {
            Self::Forever => FOREVER,
            Self::Ticks(ticks) => {
                let at = now.saturating_add(ticks);
                if at == FOREVER { FOREVER - 1 } else { at }
            }
        }
    }
}

/// Allocation behavior flags.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AllocFlags(u32);

impl AllocFlags {
    pub const DEFAULT: Self = Self(0);
    /// Back the allocation with a huge-page mapping when the OS allows it.
    pub const HUGE_PAGES: Self = Self(1 << 0);
    /// Round the payload up to whole cache lines.
    pub const CACHE_ALIGNED: Self = Self(1 << 1);
    /// Write and verify boundary canaries.
    pub const STRICT_CHECK: Self = Self(1 << 2);
    /// Request may be refused under friction backpressure.
    pub const LOW_PRIORITY: Self = Self(1 << 3);

    const ALL: u32 = 0b1111;

    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Build from raw bits, dropping unknown ones.
    #[must_use]
    pub const fn from_bits_truncate(bits: u32) -> Self {
        Self(bits & Self::ALL)
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[must_use]
    pub const fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

impl BitOr for AllocFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl BitOrAssign for AllocFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        *self = self.union(rhs);
    }
}

/// Parameters of one `alloc`/`realloc`/`dup` call.
///
/// ```
/// use tieralloc_core::{AllocFlags, AllocRequest, Lifetime};
///
/// let req = AllocRequest::new(256)
///     .lifetime(Lifetime::Ticks(100))
///     .at(7)
///     .root()
///     .flags(AllocFlags::STRICT_CHECK);
/// assert_eq!(req.expiry(), 107);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocRequest {
    /// Requested payload size; 0 is treated as 1.
    pub size: usize,
    pub lifetime: Lifetime,
    /// Creation tick.
    pub now: u64,
    pub is_const: bool,
    pub is_volatile: bool,
    /// When false, `access` refuses to hand out the pointer.
    pub allow_direct: bool,
    /// Register with the root tracker.
    pub is_root: bool,
    pub flags: AllocFlags,
}

impl AllocRequest {
    #[must_use]
    pub const fn new(size: usize) -> Self {
        Self {
            size,
            lifetime: Lifetime::Forever,
            now: 0,
            is_const: false,
            is_volatile: false,
            allow_direct: true,
            is_root: false,
            flags: AllocFlags::DEFAULT,
        }
    }

    #[must_use]
    pub const fn size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    #[must_use]
    pub const fn lifetime(mut self, lifetime: Lifetime) -> Self {
        self.lifetime = lifetime;
        self
    }

    #[must_use]
    pub const fn at(mut self, now: u64) -> Self {
        self.now = now;
        self
    }

    #[must_use]
    pub const fn constant(mut self) -> Self {
        self.is_const = true;
        self
    }

    #[must_use]
    pub const fn volatile(mut self) -> Self {
        self.is_volatile = true;
        self
    }

    #[must_use]
    pub const fn deny_direct(mut self) -> Self {
        self.allow_direct = false;
        self
    }

    #[must_use]
    pub const fn root(mut self) -> Self {
        self.is_root = true;
        self
    }

    /// Add behavior flags (accumulates across calls).
    #[must_use]
    pub const fn flags(mut self, flags: AllocFlags) -> Self {
        self.flags = self.flags.union(flags);
        self
    }

    #[must_use]
    pub const fn expiry(&self) -> u64 {
        self.lifetime.expiry(self.now)
    }

    #[must_use]
    pub const fn is_strict(&self) -> bool {
        self.flags.contains(AllocFlags::STRICT_CHECK)
    }
}
