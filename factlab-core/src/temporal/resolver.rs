//! Point-in-time fact lookup.
//!
//! Invariant: nothing returned from this module has a `disclosure_time` later
//! than the `as_of` it was asked about.

use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;

use crate::domain::{Category, EntityId, Fact};

use super::store::FactStore;

/// Resolver failure. `NotFound` is the expected answer for early as-of times
/// and unknown entities; callers turn it into an explicit "unknown".
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("no {category} fact for '{entity_id}' disclosed on or before {as_of}")]
    NotFound {
        entity_id: EntityId,
        category: Category,
        as_of: DateTime<Utc>,
    },
}

/// Read-only view over a [`FactStore`] answering "what was known at time T".
#[derive(Debug, Clone, Copy)]
pub struct Resolver<'a> {
    store: &'a FactStore,
}

impl<'a> Resolver<'a> {
    pub fn new(store: &'a FactStore) -> Self {
        Self { store }
    }

    /// Latest fact visible at `as_of`: greatest `period_end` among facts with
    /// `disclosure_time <= as_of`, ties broken by greatest `disclosure_time`.
    /// Facts sharing both resolve to the last in [`series_order`].
    ///
    /// [`series_order`]: crate::domain::fact::series_order
    pub fn resolve(
        &self,
        entity_id: &EntityId,
        category: &Category,
        as_of: DateTime<Utc>,
    ) -> Result<&'a Fact, ResolveError> {
        // Series is sorted ascending by (period_end, disclosure_time), so the
        // first visible fact from the back is the maximum visible key.
        self.store
            .series(entity_id, category)
            .and_then(|s| s.facts().iter().rev().find(|f| f.is_visible_at(as_of)))
            .ok_or_else(|| ResolveError::NotFound {
                entity_id: entity_id.clone(),
                category: category.clone(),
                as_of,
            })
    }

    /// Most recently disclosed fact for exactly `period_end`, visible at `as_of`.
    pub fn resolve_period(
        &self,
        entity_id: &EntityId,
        category: &Category,
        period_end: NaiveDate,
        as_of: DateTime<Utc>,
    ) -> Result<&'a Fact, ResolveError> {
        self.store
            .series(entity_id, category)
            .and_then(|s| {
                let facts = s.facts();
                let lo = facts.partition_point(|f| f.period_end < period_end);
                let hi = facts.partition_point(|f| f.period_end <= period_end);
                facts[lo..hi].iter().rev().find(|f| f.is_visible_at(as_of))
            })
            .ok_or_else(|| ResolveError::NotFound {
                entity_id: entity_id.clone(),
                category: category.clone(),
                as_of,
            })
    }

    /// Distinct period ends with at least one fact visible at `as_of` and
    /// `period_end > after` (when given), newest first.
    pub fn visible_periods(
        &self,
        entity_id: &EntityId,
        category: &Category,
        as_of: DateTime<Utc>,
        after: Option<NaiveDate>,
    ) -> Vec<NaiveDate> {
        let Some(series) = self.store.series(entity_id, category) else {
            return Vec::new();
        };
        let mut periods: Vec<NaiveDate> = series
            .facts()
            .iter()
            .rev()
            .filter(|f| f.is_visible_at(as_of))
            .filter(|f| after.map_or(true, |cutoff| f.period_end > cutoff))
            .map(|f| f.period_end)
            .collect();
        periods.dedup();
        periods
    }

    /// Distinct disclosure times of a series, ascending. Each is a moment at
    /// which the set of known facts changed.
    pub fn disclosure_events(&self, entity_id: &EntityId, category: &Category) -> Vec<DateTime<Utc>> {
        let Some(series) = self.store.series(entity_id, category) else {
            return Vec::new();
        };
        let mut events: Vec<DateTime<Utc>> =
            series.facts().iter().map(|f| f.disclosure_time).collect();
        events.sort();
        events.dedup();
        events
    }

    pub fn store(&self) -> &'a FactStore {
        self.store
    }
}
