//! Trailing-window configuration.

use chrono::{DateTime, Datelike, Months, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// How a trailing window is built: how many periods, how far back to look,
/// and what oldest-to-newest span counts as plausible.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowPolicy {
    /// Stored with every result; part of the rollup key.
    pub name: String,
    pub periods: usize,
    /// Only periods ending strictly after `as_of - lookback_months` qualify.
    pub lookback_months: u32,
    pub min_span_months: u32,
    pub max_span_months: u32,
}

impl Default for WindowPolicy {
    fn default() -> Self {
        Self::ttm_quarters()
    }
}

impl WindowPolicy {
    /// Trailing twelve months from four quarters.
    pub fn ttm_quarters() -> Self {
        Self {
            name: "ttm4q".to_string(),
            periods: 4,
            lookback_months: 15,
            min_span_months: 8,
            max_span_months: 11,
        }
    }

    /// Exclusive lower bound on `period_end` for a window as of `as_of`.
    /// `None` when the subtraction leaves chrono's range.
    pub fn lookback_cutoff(&self, as_of: DateTime<Utc>) -> Option<NaiveDate> {
        as_of
            .date_naive()
            .checked_sub_months(Months::new(self.lookback_months))
    }

    pub fn span_within_tolerance(&self, span_months: i32) -> bool {
        span_months >= self.min_span_months as i32 && span_months <= self.max_span_months as i32
    }
}

/// Whole calendar months between two period ends (day of month ignored).
pub fn span_months(oldest: NaiveDate, newest: NaiveDate) -> i32 {
    (newest.year() - oldest.year()) * 12 + newest.month() as i32 - oldest.month() as i32
}
