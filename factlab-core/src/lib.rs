//! FactLab Core — point-in-time financial facts and what can be derived from them.
//!
//! This crate contains the pure computation:
//! - Domain types (facts, observations, derived metrics)
//! - Temporal resolver: the latest fact visible at an as-of time
//! - Rollup calculator: trailing-window aggregates over resolved periods
//! - Metric composer: market metrics and fundamental ratios
//! - Data-quality checks, retry policy, and source collaborator traits
//!
//! Nothing in here performs I/O. Storage and scheduling live in `factlab-runner`.

pub mod composer;
pub mod domain;
pub mod quality;
pub mod retry;
pub mod rollup;
pub mod source;
pub mod temporal;
