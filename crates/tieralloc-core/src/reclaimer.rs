//! Background reclaimer thread.
//!
//! One named thread per context. Each cycle sweeps expired, unreferenced,
//! unpinned roots (unless the tracker is in manual mode), flushes deferred
//! buddy frees, then sleeps on the tracker's condition variable. The sleep
//! starts at the configured minimum, doubles on every idle cycle up to the
//! maximum, and snaps back to the minimum as soon as a cycle does work.

use std::io;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::roots::RootTracker;

pub(crate) const THREAD_NAME: &str = "tieralloc-reclaimer";

/// What the reclaimer drives.
pub(crate) trait Sweep: Send + Sync + 'static {
    fn tracker(&self) -> &RootTracker;
    /// Free every reclaimable root; returns how many were freed.
    fn sweep_expired(&self) -> usize;
    fn flush_deferred(&self);
}

/// Sleep for the next cycle.
pub(crate) fn next_sleep(current: Duration, min: Duration, max: Duration, did_work: bool) -> Duration {
    if did_work {
        return min;
    }
    current.saturating_mul(2).clamp(min, max.max(min))
}

#[derive(Debug)]
pub(crate) struct ReclaimerHandle {
    join: JoinHandle<()>,
}

impl ReclaimerHandle {
    /// Signal shutdown and wait for the thread to exit.
    pub(crate) fn stop(self, tracker: &RootTracker) {
        tracker.signal_shutdown();
        let _ = self.join.join();
    }
}

pub(crate) fn spawn<S: Sweep>(target: Arc<S>) -> io::Result<ReclaimerHandle> {
    let join = std::thread::Builder::new()
        .name(THREAD_NAME.to_string())
        .spawn(move || run(&*target))?;
    Ok(ReclaimerHandle { join })
}

fn run<S: Sweep>(target: &S) {
    let tracker = target.tracker();
    let (min, _) = tracker.sleep_bounds();
    let mut sleep = min;
    while !tracker.is_shutdown() {
        let (min, max) = tracker.sleep_bounds();
        if tracker.is_manual() {
            sleep = max;
        } else {
            let freed = target.sweep_expired();
            let did_work = freed > 0 || tracker.pressure() > 0;
            sleep = next_sleep(sleep, min, max, did_work);
        }
        target.flush_deferred();
        tracker.record_cycle(sleep);
        tracker.wait(sleep);
    }
}
