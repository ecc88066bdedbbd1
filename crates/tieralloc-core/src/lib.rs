//! # tieralloc-core
//!
//! A tiered, lifecycle-aware memory allocator.
//!
//! Every allocation carries a 128-byte header in front of its payload that
//! records lifetime, access attributes, a checksum and (optionally) a trace
//! log. Requests are routed by size to one of four tiers:
//!
//! - **pocket**: thread-local freelists for tiny blocks
//! - **bump**: a lock-free linear region for small blocks, never reused
//! - **buddy**: a growable binary buddy zone with epoch-deferred coalescing
//! - **general**: the system allocator (and huge-page mappings)
//!
//! Allocations flagged as roots are tracked by reference count and expiry and
//! freed by a background reclaimer. A fixed-point friction gauge lets callers
//! shed low-priority requests when carving gets wasteful.
//!
//! All state lives in an [`AllocatorContext`]; there is no global allocator.

#![deny(unsafe_code)]

pub mod buddy;
pub mod clock;
pub mod config;
pub mod context;
pub mod epoch;
pub mod error;
pub mod friction;
pub mod header;
pub mod metrics;
pub mod request;
pub mod trace;

mod bump;
mod general;
mod os;
mod pocket;
mod reclaimer;
mod roots;
mod sync;
mod thread_ctx;

pub use buddy::{BuddyReport, BuddyRequest, BuddyViolation, BuddyZone, FitPolicy};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{AllocatorConfig, BackingPool, BuddyConfig, GcConfig};
pub use context::AllocatorContext;
pub use epoch::{EpochDomain, Reclaim};
pub use error::{AllocError, CorruptionKind, CorruptionPolicy};
pub use friction::{Fixed, FrictionMatrix};
pub use header::{HeaderFlags, Tier};
pub use metrics::{AllocatorMetrics, MetricsSnapshot, TierUsage};
pub use request::{AllocFlags, AllocRequest, FOREVER, Lifetime};
pub use roots::RootInfo;
pub use trace::{MemorySink, StderrSink, TraceEvent, TraceLog, TraceRecord, TraceSink};
