//! Error types and the fatal corruption path.
//!
//! Recoverable failures come back as [`AllocError`]. Metadata corruption is
//! never recoverable: it is reported once on stderr as a JSON line and then
//! the process aborts (or, under [`CorruptionPolicy::Panic`], the current
//! thread panics so tests can observe it).

use std::io::Write;

use serde::Serialize;
use thiserror::Error;

use crate::friction::Fixed;

/// Recoverable allocation failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocError {
    /// No tier could satisfy the request, even after emergency reclaim.
    #[error("out of memory: no tier could satisfy {size} bytes")]
    Exhausted { size: usize },
    /// Low-priority request refused under friction backpressure.
    #[error("backpressure: low-priority request of {size} bytes refused at friction {friction}")]
    Backpressure { size: usize, friction: Fixed },
    /// Caller misuse that is detectable without touching freed memory.
    #[error("misuse: {0}")]
    Misuse(&'static str),
}

/// What kind of metadata damage was detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CorruptionKind {
    BadMagic,
    Checksum,
    StartCanary,
    EndCanary,
    /// Pocket page tag does not describe the block being freed.
    PageTag,
    /// Buddy block header in an impossible state.
    BlockState,
}

impl CorruptionKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::BadMagic => "bad_magic",
            Self::Checksum => "checksum",
            Self::StartCanary => "start_canary",
            Self::EndCanary => "end_canary",
            Self::PageTag => "page_tag",
            Self::BlockState => "block_state",
        }
    }
}

/// How to terminate on detected corruption.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CorruptionPolicy {
    /// `std::process::abort()` after the report.
    #[default]
    Abort,
    /// Panic on the detecting thread after the report.
    Panic,
}

#[derive(Serialize)]
struct CorruptionReport {
    event: &'static str,
    kind: CorruptionKind,
    ptr: String,
}

/// Report corruption and terminate. Never returns.
#[cold]
#[inline(never)]
pub fn fatal(kind: CorruptionKind, addr: usize, policy: CorruptionPolicy) -> ! {
    let report = CorruptionReport {
        event: "corruption",
        kind,
        ptr: format!("{addr:#x}"),
    };
    // Best effort; the process is going down regardless.
    if let Ok(line) = serde_json::to_string(&report) {
        let mut err = std::io::stderr().lock();
        let _ = writeln!(err, "[tieralloc] {line}");
        let _ = err.flush();
    }
    match policy {
        CorruptionPolicy::Abort => std::process::abort(),
        CorruptionPolicy::Panic => panic!("tieralloc: {} corruption at {addr:#x}", kind.as_str()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages_name_the_size() {
        let e = AllocError::Exhausted { size: 4096 };
        assert!(e.to_string().contains("4096"));
        let e = AllocError::Backpressure {
            size: 10,
            friction: Fixed::from_int(5),
        };
        assert!(e.to_string().contains("5.000"), "{e}");
    }

    #[test]
    fn corruption_kind_serializes_snake_case() {
        let v = serde_json::to_value(CorruptionKind::EndCanary).unwrap();
        assert_eq!(v, serde_json::json!("end_canary"));
        assert_eq!(CorruptionKind::PageTag.as_str(), "page_tag");
    }

    #[test]
    #[should_panic(expected = "checksum corruption")]
    fn fatal_panics_under_panic_policy() {
        fatal(CorruptionKind::Checksum, 0x1000, CorruptionPolicy::Panic);
    }
}
