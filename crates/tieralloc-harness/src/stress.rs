//! Multi-threaded stress driver.
//!
//! Every worker runs a seeded mix of alloc, realloc, access, root
//! retain/release and free against one shared context. Payloads are stamped
//! with a per-worker tag and checked before each free, so an overlap between
//! blocks shows up as `overwrites`.

#![allow(unsafe_code)]

use std::ptr::NonNull;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tieralloc_core::{
    AllocRequest, AllocatorConfig, AllocatorContext, BackingPool, Lifetime, MetricsSnapshot,
    TierUsage,
};

use crate::error::HarnessError;
use crate::rng::XorShift64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StressConfig {
    pub threads: usize,
    pub ops_per_thread: usize,
    pub seed: u64,
    /// Upper bound on a single request.
    pub max_size: usize,
    /// Share of allocations registered as roots.
    pub root_percent: u32,
    /// Live allocations a worker keeps before it only frees.
    pub max_live: usize,
    /// Run against an embedded pool of this many bytes instead of the OS.
    pub embedded_pool: Option<usize>,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            threads: 4,
            ops_per_thread: 10_000,
            seed: 0x5EED,
            max_size: 64 * 1024,
            root_percent: 10,
            max_live: 64,
            embedded_pool: None,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StressReport {
    pub ops: u64,
    pub allocs: u64,
    pub reallocs: u64,
    pub frees: u64,
    pub accesses: u64,
    /// Requests the allocator refused.
    pub failures: u64,
    /// Payloads found modified by someone other than their owner.
    pub overwrites: u64,
    pub elapsed_ns: u64,
    pub ops_per_sec: f64,
    pub buddy_consistent: bool,
    pub metrics: MetricsSnapshot,
    /// Tier occupancy after every worker has freed its blocks.
    pub usage: TierUsage,
}

impl StressReport {
    #[must_use]
    pub fn clean(&self) -> bool {
        self.overwrites == 0 && self.buddy_consistent && self.metrics.bytes_in_use == 0
    }

    fn absorb(&mut self, worker: &WorkerTally) {
        self.ops += worker.ops;
        self.allocs += worker.allocs;
        self.reallocs += worker.reallocs;
        self.frees += worker.frees;
        self.accesses += worker.accesses;
        self.failures += worker.failures;
        self.overwrites += worker.overwrites;
    }
}

#[derive(Debug, Default)]
struct WorkerTally {
    ops: u64,
    allocs: u64,
    reallocs: u64,
    frees: u64,
    accesses: u64,
    failures: u64,
    overwrites: u64,
}

struct Live {
    addr: usize,
    len: usize,
    root: bool,
}

impl Live {
    fn ptr(&self) -> *mut u8 {
        self.addr as *mut u8
    }
}

pub fn run(config: &StressConfig) -> Result<StressReport, HarnessError> {
    if config.threads == 0 || config.max_size == 0 || config.max_live == 0 {
        return Err(HarnessError::scenario(
            "stress",
            "threads, max_size and max_live must be positive",
        ));
    }
    let base = AllocatorConfig {
        background_reclaimer: false,
        ..AllocatorConfig::default()
    };
    let alloc_config = match config.embedded_pool {
        Some(bytes) => AllocatorConfig {
            background_reclaimer: false,
            ..AllocatorConfig::embedded(BackingPool::anonymous(bytes)?)
        },
        None => base,
    };
    let ctx = AllocatorContext::new(alloc_config)?;

    let started = Instant::now();
    let tallies = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..config.threads)
            .map(|t| {
                let ctx = &ctx;
                scope.spawn(move || worker(ctx, config, t))
            })
            .collect();
        handles
            .into_iter()
            .map(|h| {
                h.join()
                    .map_err(|_| HarnessError::scenario("stress", "worker panicked"))
            })
            .collect::<Result<Vec<_>, _>>()
    })?;
    let elapsed_ns = started.elapsed().as_nanos() as u64;

    let mut report = StressReport {
        elapsed_ns,
        ..StressReport::default()
    };
    for tally in &tallies {
        report.absorb(tally);
    }
    report.ops_per_sec = if elapsed_ns == 0 {
        0.0
    } else {
        report.ops as f64 * 1e9 / elapsed_ns as f64
    };
    report.buddy_consistent = ctx
        .check_buddy_invariants()
        .is_ok_and(|r| r.unmerged_pairs == 0);
    report.metrics = ctx.metrics();
    report.usage = ctx.tier_usage();
    ctx.shutdown();
    Ok(report)
}

fn worker(ctx: &AllocatorContext, config: &StressConfig, index: usize) -> WorkerTally {
    let mut rng = XorShift64::new(config.seed ^ ((index as u64 + 1) << 32));
    let tag = 0x40 | (index as u8 & 0x3F);
    let mut live: Vec<Live> = Vec::with_capacity(config.max_live);
    let mut tally = WorkerTally::default();

    for step in 0..config.ops_per_thread {
        tally.ops += 1;
        let roll = rng.gen_range(0, 99);
        let full = live.len() >= config.max_live;
        if live.is_empty() || (!full && roll < 45) {
            let len = rng.gen_range(1, config.max_size);
            let mut req = AllocRequest::new(len).at(step as u64);
            let root = rng.chance(config.root_percent);
            if root {
                // Outlives the run so `access` never sees it expire.
                req = req.root().lifetime(Lifetime::Ticks(config.ops_per_thread as u64 + 1));
            }
            match ctx.alloc(&req) {
                Ok(p) => {
                    tally.allocs += 1;
                    // SAFETY: fresh allocation of `len` bytes.
                    unsafe { p.as_ptr().write_bytes(tag, len) };
                    live.push(Live {
                        addr: p.as_ptr() as usize,
                        len,
                        root,
                    });
                }
                Err(_) => tally.failures += 1,
            }
            continue;
        }

        let at = rng.gen_range(0, live.len() - 1);
        match roll {
            45..=59 => {
                let new_len = rng.gen_range(1, config.max_size);
                // SAFETY: `live[at]` is ours and live.
                match unsafe { ctx.realloc(live[at].ptr(), &AllocRequest::new(new_len)) } {
                    Ok(q) => {
                        tally.reallocs += 1;
                        let block = &mut live[at];
                        // SAFETY: the new block holds `new_len` bytes.
                        unsafe { q.as_ptr().write_bytes(tag, new_len) };
                        block.addr = q.as_ptr() as usize;
                        block.len = new_len;
                        block.root = false;
                    }
                    Err(_) => tally.failures += 1,
                }
            }
            60..=74 => {
                tally.accesses += 1;
                // SAFETY: live.
                if unsafe { ctx.access(live[at].ptr(), step as u64) }.is_none() {
                    tally.failures += 1;
                }
            }
            75..=79 if live[at].root => {
                // SAFETY: live root.
                unsafe {
                    ctx.retain(live[at].ptr());
                    ctx.release(live[at].ptr());
                }
            }
            _ => {
                let block = live.swap_remove(at);
                if !stamped(&block, tag) {
                    tally.overwrites += 1;
                }
                // SAFETY: ours, freed once.
                unsafe { ctx.free(block.ptr()) };
                tally.frees += 1;
            }
        }
    }

    for block in live {
        if !stamped(&block, tag) {
            tally.overwrites += 1;
        }
        // SAFETY: ours, freed once.
        unsafe { ctx.free(block.ptr()) };
        tally.frees += 1;
    }
    tally
}

fn stamped(block: &Live, tag: u8) -> bool {
    let Some(p) = NonNull::new(block.ptr()) else {
        return false;
    };
    // SAFETY: the block is live and `len` bytes long.
    let bytes = unsafe { std::slice::from_raw_parts(p.as_ptr(), block.len) };
    bytes.iter().all(|&b| b == tag)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_run_is_clean() {
        let report = run(&StressConfig {
            threads: 2,
            ops_per_thread: 2_000,
            max_size: 20_000,
            ..StressConfig::default()
        })
        .unwrap();
        assert!(report.clean(), "{report:?}");
        assert_eq!(report.ops, 4_000);
        assert_eq!(report.failures, 0);
        assert_eq!(report.allocs, report.frees);
        assert_eq!(report.usage.general_blocks, 0);
    }

    #[test]
    fn zero_threads_is_rejected() {
        let err = run(&StressConfig {
            threads: 0,
            ..StressConfig::default()
        })
        .unwrap_err();
        assert!(matches!(err, HarnessError::Scenario { name: "stress", .. }));
    }
}
