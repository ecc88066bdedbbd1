//! Structured trace records.
//!
//! Provides:
//! - [`TraceRecord`]: one allocator event, serialized as a single JSON line.
//! - [`TraceSink`]: where records go. [`StderrSink`] by default,
//!   [`MemorySink`] for tests and the harness.
//! - [`TraceLog`]: the bounded per-allocation history hung off a header while
//!   tracing is enabled.

use std::collections::VecDeque;
use std::io::Write;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::header::Tier;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceEvent {
    Alloc,
    Free,
    Realloc,
    Reclaim,
    Autoclean,
    Growth,
    Defrag,
    Exhausted,
    Backpressure,
    Corruption,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceRecord {
    pub event: TraceEvent,
    /// Payload address, `0` when not applicable.
    pub ptr: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<usize>,
    pub ts: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier: Option<Tier>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl TraceRecord {
    #[must_use]
    pub fn new(event: TraceEvent, ptr: usize, ts: u64) -> Self {
        Self {
            event,
            ptr,
            size: None,
            ts,
            root: None,
            tier: None,
            details: None,
        }
    }

    #[must_use]
    pub fn with_size(mut self, size: usize) -> Self {
        self.size = Some(size);
        self
    }

    #[must_use]
    pub fn with_root(mut self, root: bool) -> Self {
        self.root = Some(root);
        self
    }

    #[must_use]
    pub fn with_tier(mut self, tier: Tier) -> Self {
        self.tier = Some(tier);
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

pub trait TraceSink: Send + Sync {
    fn emit(&self, record: &TraceRecord);
}

/// One `[tieralloc] {json}` line per record on stderr.
#[derive(Debug, Default, Clone, Copy)]
pub struct StderrSink;

impl TraceSink for StderrSink {
    fn emit(&self, record: &TraceRecord) {
        if let Ok(line) = record.to_json_line() {
            let _ = writeln!(std::io::stderr().lock(), "[tieralloc] {line}");
        }
    }
}

/// Buffers every record in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<TraceRecord>>,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn records(&self) -> Vec<TraceRecord> {
        self.records.lock().clone()
    }

    #[must_use]
    pub fn count(&self, event: TraceEvent) -> usize {
        self.records.lock().iter().filter(|r| r.event == event).count()
    }

    pub fn take(&self) -> Vec<TraceRecord> {
        std::mem::take(&mut *self.records.lock())
    }
}

impl TraceSink for MemorySink {
    fn emit(&self, record: &TraceRecord) {
        self.records.lock().push(record.clone());
    }
}

// ---------------------------------------------------------------------------
// Per-allocation log
// ---------------------------------------------------------------------------

/// Records kept per allocation; older ones are dropped first.
pub const TRACE_LOG_CAPACITY: usize = 16;

#[derive(Debug, Default, Clone)]
pub struct TraceLog {
    records: VecDeque<TraceRecord>,
}

impl TraceLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: TraceRecord) {
        if self.records.len() == TRACE_LOG_CAPACITY {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    #[must_use]
    pub fn records(&self) -> Vec<TraceRecord> {
        self.records.iter().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_serializes_without_absent_fields() {
        let rec = TraceRecord::new(TraceEvent::Alloc, 0x1000, 7)
            .with_size(64)
            .with_tier(Tier::Pocket);
        let line = rec.to_json_line().unwrap();
        let v: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(v["event"], "alloc");
        assert_eq!(v["tier"], "pocket");
        assert_eq!(v["size"], 64);
        assert!(v.get("root").is_none());
        assert!(v.get("details").is_none());
    }

    #[test]
    fn memory_sink_counts_by_event() {
        let sink = MemorySink::new();
        sink.emit(&TraceRecord::new(TraceEvent::Alloc, 1, 0));
        sink.emit(&TraceRecord::new(TraceEvent::Free, 1, 1));
        sink.emit(&TraceRecord::new(TraceEvent::Alloc, 2, 2));
        assert_eq!(sink.count(TraceEvent::Alloc), 2);
        assert_eq!(sink.take().len(), 3);
        assert!(sink.records().is_empty());
    }

    #[test]
    fn trace_log_is_bounded() {
        let mut log = TraceLog::new();
        for i in 0..(TRACE_LOG_CAPACITY as u64 + 4) {
            log.push(TraceRecord::new(TraceEvent::Alloc, 0, i));
        }
        assert_eq!(log.len(), TRACE_LOG_CAPACITY);
        assert_eq!(log.records()[0].ts, 4);
    }
}
