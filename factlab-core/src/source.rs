//! Collaborator traits for fact and observation sources.
//!
//! The pipeline pulls through these traits so the HTTP client, file imports
//! and test fixtures are interchangeable.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::domain::{Category, EntityId, Fact, Observation};
use crate::retry::Retryable;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("transient source failure: {0}")]
    Transient(String),

    #[error("rate limited by source (retry after {retry_after_secs}s)")]
    RateLimited { retry_after_secs: u64 },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("malformed source data: {0}")]
    Malformed(String),

    #[error("source error: {0}")]
    Other(String),
}

impl Retryable for SourceError {
    fn is_retryable(&self) -> bool {
        matches!(self, SourceError::Transient(_) | SourceError::RateLimited { .. })
    }
}

/// Supplier of versioned financial facts.
pub trait FactSource: Send + Sync {
    fn name(&self) -> &str;

    /// Facts for `entity_ids` in `category`, ordered by
    /// `(entity_id, period_end, disclosure_time)`. `limit` caps the number of
    /// facts returned per entity, keeping the most recent periods.
    fn pull(
        &self,
        entity_ids: &[EntityId],
        category: &Category,
        limit: Option<usize>,
    ) -> Result<Vec<Fact>, SourceError>;
}

/// Supplier of external time series (daily prices).
pub trait ObservationSource: Send + Sync {
    fn name(&self) -> &str;

    /// Observations with `start <= timestamp <= end`, ordered by
    /// `(entity_id, timestamp)`.
    fn observations(
        &self,
        entity_ids: &[EntityId],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Observation>, SourceError>;
}

/// Sort facts into source order and keep at most `limit` most recent facts
/// per entity.
pub fn order_and_limit(mut facts: Vec<Fact>, limit: Option<usize>) -> Vec<Fact> {
    facts.sort_by(|a, b| {
        (&a.entity_id, a.period_end, a.disclosure_time)
            .cmp(&(&b.entity_id, b.period_end, b.disclosure_time))
    });
    let Some(limit) = limit else {
        return facts;
    };
    let mut out = Vec::with_capacity(facts.len());
    let mut start = 0;
    while start < facts.len() {
        let entity = &facts[start].entity_id;
        let end = start + facts[start..].partition_point(|f| &f.entity_id == entity);
        let keep_from = end.saturating_sub(limit).max(start);
        out.extend_from_slice(&facts[keep_from..end]);
        start = end;
    }
    out
}

/// In-memory fact source, for tests and fixtures.
#[derive(Debug, Clone, Default)]
pub struct StaticFactSource {
    facts: Vec<Fact>,
}

impl StaticFactSource {
    pub fn new(facts: Vec<Fact>) -> Self {
        Self { facts }
    }
}

impl FactSource for StaticFactSource {
    fn name(&self) -> &str {
        "static"
    }

    fn pull(
        &self,
        entity_ids: &[EntityId],
        category: &Category,
        limit: Option<usize>,
    ) -> Result<Vec<Fact>, SourceError> {
        let selected = self
            .facts
            .iter()
            .filter(|f| &f.category == category && entity_ids.contains(&f.entity_id))
            .cloned()
            .collect();
        Ok(order_and_limit(selected, limit))
    }
}

#[derive(Debug, Clone, Default)]
pub struct StaticObservationSource {
    observations: Vec<Observation>,
}

impl StaticObservationSource {
    pub fn new(observations: Vec<Observation>) -> Self {
        Self { observations }
    }
}

impl ObservationSource for StaticObservationSource {
    fn name(&self) -> &str {
        "static"
    }

    fn observations(
        &self,
        entity_ids: &[EntityId],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Observation>, SourceError> {
        let mut out: Vec<Observation> = self
            .observations
            .iter()
            .filter(|o| entity_ids.contains(&o.entity_id))
            .filter(|o| o.timestamp >= start && o.timestamp <= end)
            .cloned()
            .collect();
        out.sort_by(|a, b| (&a.entity_id, a.timestamp).cmp(&(&b.entity_id, b.timestamp)));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};

    fn fact(entity: &str, m: u32) -> Fact {
        let pe = NaiveDate::from_ymd_opt(2024, m, 28).unwrap();
        let at = Utc.with_ymd_and_hms(2024, m, 28, 0, 0, 0).unwrap() + chrono::Duration::days(20);
        Fact::new(entity, "quarterly", pe, at)
    }

    #[test]
    fn retryable_classification() {
        assert!(SourceError::Transient("timeout".into()).is_retryable());
        assert!(SourceError::RateLimited { retry_after_secs: 1 }.is_retryable());
        assert!(!SourceError::NotFound("X".into()).is_retryable());
        assert!(!SourceError::Malformed("bad".into()).is_retryable());
    }

    #[test]
    fn static_source_filters_orders_and_limits() {
        let src = StaticFactSource::new(vec![
            fact("B", 3),
            fact("A", 9),
            fact("A", 3),
            fact("A", 6),
            fact("C", 3),
        ]);
        let ids = vec![EntityId::new("A"), EntityId::new("B")];
        let all = src.pull(&ids, &Category::quarterly(), None).unwrap();
        let order: Vec<(&str, u32)> = all
            .iter()
            .map(|f| (f.entity_id.as_str(), chrono::Datelike::month(&f.period_end)))
            .collect();
        assert_eq!(order, vec![("A", 3), ("A", 6), ("A", 9), ("B", 3)]);

        let limited = src.pull(&ids, &Category::quarterly(), Some(2)).unwrap();
        let order: Vec<(&str, u32)> = limited
            .iter()
            .map(|f| (f.entity_id.as_str(), chrono::Datelike::month(&f.period_end)))
            .collect();
        assert_eq!(order, vec![("A", 6), ("A", 9), ("B", 3)]);

        assert!(src.pull(&ids, &Category::annual(), None).unwrap().is_empty());
    }
}
