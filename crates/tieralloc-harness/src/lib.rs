//! Verification tooling for tieralloc.
//!
//! - Deterministic scenarios that exercise one allocator property each
//! - A multi-threaded stress driver over seeded operation mixes
//! - JSONL structured logs with a validator and a SHA-256 artifact index

#![deny(unsafe_code)]

pub mod error;
pub mod rng;
pub mod scenarios;
pub mod stress;
pub mod structured_log;

pub use error::HarnessError;
pub use scenarios::{Scenario, ScenarioReport};
pub use stress::{StressConfig, StressReport};
