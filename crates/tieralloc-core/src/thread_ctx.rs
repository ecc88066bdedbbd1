//! Per-thread allocator state: the bootstrap flag and the pocket freelists.
//!
//! Both live in one const-initialized thread local so touching them never
//! allocates. When the thread local is unavailable (thread teardown) the
//! thread is treated as bootstrapping and every request takes the raw path.
//!
//! Contexts with pocket tiers register their id while alive. Dropping one
//! bumps a global generation; every thread prunes shards of dead contexts the
//! next time it reaches its freelists with a stale generation.

use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::pocket::PocketShard;

static LIVE_CONTEXTS: RwLock<Vec<u64>> = parking_lot::const_rwlock(Vec::new());
static RETIRED: AtomicU64 = AtomicU64::new(0);

pub(crate) struct ThreadContext {
    bootstrap: Cell<bool>,
    pockets: RefCell<Vec<PocketShard>>,
    /// `RETIRED` as of this thread's last prune.
    seen_retired: Cell<u64>,
}

impl ThreadContext {
    const fn new() -> Self {
        Self {
            bootstrap: Cell::new(false),
            pockets: RefCell::new(Vec::new()),
            seen_retired: Cell::new(0),
        }
    }
}

thread_local! {
    static THREAD_CTX: ThreadContext = const { ThreadContext::new() };
}

/// True while this thread is inside an allocator bootstrap section.
pub(crate) fn in_bootstrap() -> bool {
    THREAD_CTX.try_with(|ctx| ctx.bootstrap.get()).unwrap_or(true)
}

/// Marks the current thread as bootstrapping until dropped. Nests.
pub(crate) struct BootstrapScope {
    prev: bool,
}

impl BootstrapScope {
    pub(crate) fn enter() -> Self {
        let prev = THREAD_CTX
            .try_with(|ctx| ctx.bootstrap.replace(true))
            .unwrap_or(true);
        Self { prev }
    }
}

impl Drop for BootstrapScope {
    fn drop(&mut self) {
        let _ = THREAD_CTX.try_with(|ctx| ctx.bootstrap.set(self.prev));
    }
}

/// Run `f` on this thread's pocket shard for `context_id`, creating it on
/// first use. `None` when the thread local is gone or already borrowed.
pub(crate) fn with_pockets<R>(context_id: u64, f: impl FnOnce(&mut PocketShard) -> R) -> Option<R> {
    THREAD_CTX
        .try_with(|ctx| {
            let mut shards = ctx.pockets.try_borrow_mut().ok()?;
            let retired = RETIRED.load(Ordering::Acquire);
            if retired != ctx.seen_retired.get() {
                let live = LIVE_CONTEXTS.read();
                shards.retain(|s| live.contains(&s.context_id));
                ctx.seen_retired.set(retired);
            }
            let idx = match shards.iter().position(|s| s.context_id == context_id) {
                Some(idx) => idx,
                None => {
                    shards.push(PocketShard::new(context_id));
                    shards.len() - 1
                }
            };
            Some(f(&mut shards[idx]))
        })
        .ok()
        .flatten()
}

/// Mark a context as alive so its shards survive pruning.
pub(crate) fn register_context(context_id: u64) {
    LIVE_CONTEXTS.write().push(context_id);
}

/// Retire a context that is going away. This thread's shard goes at once;
/// other threads drop theirs on their next freelist access.
pub(crate) fn forget_context(context_id: u64) {
    LIVE_CONTEXTS.write().retain(|&id| id != context_id);
    RETIRED.fetch_add(1, Ordering::AcqRel);
    let _ = THREAD_CTX.try_with(|ctx| {
        if let Ok(mut shards) = ctx.pockets.try_borrow_mut() {
            shards.retain(|s| s.context_id != context_id);
        }
    });
}

#[cfg(test)]
fn shard_ids() -> Vec<u64> {
    THREAD_CTX.with(|ctx| ctx.pockets.borrow().iter().map(|s| s.context_id).collect())
}
