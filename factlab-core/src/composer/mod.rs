//! Metric composition: joins observations and facts into derived ratios.
//!
//! Two families:
//! - market metrics, one set per price observation, from the annual fact and
//!   the trailing rollup known at the observation's timestamp;
//! - fundamental ratios, one set per fact, from that fact alone.
//!
//! No formula ever returns an error. Missing or non-positive inputs produce
//! [`MetricValue::Undefined`](crate::domain::MetricValue) with the reason.

mod formula;
pub mod fundamental;
pub mod market;

use crate::domain::Category;
use crate::rollup::MetricCatalog;

pub use fundamental::{FactRatios, FUNDAMENTAL_RATIOS};
pub use market::{latest_rollup_as_of, MARKET_METRICS};

#[derive(Debug, Clone)]
pub struct MetricComposer {
    catalog: MetricCatalog,
    annual_category: Category,
}

impl Default for MetricComposer {
    fn default() -> Self {
        Self::new(MetricCatalog::default_financials())
    }
}

impl MetricComposer {
    pub fn new(catalog: MetricCatalog) -> Self {
        Self {
            catalog,
            annual_category: Category::annual(),
        }
    }

    /// Category resolved as the single-period fact for market metrics.
    pub fn with_annual_category(mut self, category: Category) -> Self {
        self.annual_category = category;
        self
    }

    pub fn catalog(&self) -> &MetricCatalog {
        &self.catalog
    }

    /// Stored value with its sign convention removed.
    pub(crate) fn normalized(&self, metric: &str, value: Option<f64>) -> Option<f64> {
        value.map(|v| self.catalog.sign(metric).normalize(v))
    }
}
