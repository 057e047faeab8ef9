//! Trailing-window rollups (e.g. trailing twelve months from four quarters).

pub mod calculator;
pub mod catalog;
pub mod policy;

pub use calculator::{RollupCalculator, RollupOutcome, RollupResult, RollupSeries};
pub use catalog::{MetricCatalog, MetricKind, MetricSpec, SignConvention};
pub use policy::{span_months, WindowPolicy};
