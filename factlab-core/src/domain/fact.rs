//! Facts: versioned, dated financial values as they were disclosed.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

use super::ids::{Category, EntityId};

/// One disclosed set of values for one reporting period.
///
/// `disclosure_time` is when the values became known. It is fixed at ingestion
/// and never rewritten; a correction arrives as a new `Fact` for the same
/// `period_end` with a later `disclosure_time`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    pub entity_id: EntityId,
    pub category: Category,
    pub period_end: NaiveDate,
    pub disclosure_time: DateTime<Utc>,
    /// Metric name → value. BTreeMap keeps serialization order stable.
    pub values: BTreeMap<String, f64>,
}

impl Fact {
    pub fn new(
        entity_id: impl Into<EntityId>,
        category: impl Into<Category>,
        period_end: NaiveDate,
        disclosure_time: DateTime<Utc>,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            category: category.into(),
            period_end,
            disclosure_time,
            values: BTreeMap::new(),
        }
    }

    /// Builder-style metric insertion.
    pub fn with_value(mut self, metric: impl Into<String>, value: f64) -> Self {
        self.values.insert(metric.into(), value);
        self
    }

    pub fn value(&self, metric: &str) -> Option<f64> {
        self.values.get(metric).copied()
    }

    /// True when the fact claims to be known before its period closed.
    pub fn disclosed_before_period_end(&self) -> bool {
        self.disclosure_time.date_naive() < self.period_end
    }

    /// Whether this fact was visible to an observer at `as_of`.
    #[inline]
    pub fn is_visible_at(&self, as_of: DateTime<Utc>) -> bool {
        self.disclosure_time <= as_of
    }
}

/// Total order used inside a series: `(period_end, disclosure_time)`, then
/// the values themselves. Two facts sharing a key always land in the same
/// order whatever order they were inserted in.
pub fn series_order(a: &Fact, b: &Fact) -> Ordering {
    (a.period_end, a.disclosure_time)
        .cmp(&(b.period_end, b.disclosure_time))
        .then_with(|| compare_values(&a.values, &b.values))
}

fn compare_values(a: &BTreeMap<String, f64>, b: &BTreeMap<String, f64>) -> Ordering {
    for ((ka, va), (kb, vb)) in a.iter().zip(b.iter()) {
        let ord = ka.cmp(kb).then_with(|| va.total_cmp(vb));
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.len().cmp(&b.len())
}

/// All facts for one (entity, category), ordered by [`series_order`].
///
/// Only built through [`FactSeries::push`], which keeps that order.
#[derive(Debug, Clone, PartialEq)]
pub struct FactSeries {
    pub entity_id: EntityId,
    pub category: Category,
    facts: Vec<Fact>,
}

impl FactSeries {
    pub fn new(entity_id: EntityId, category: Category) -> Self {
        Self {
            entity_id,
            category,
            facts: Vec::new(),
        }
    }

    /// Build a series from facts, sorting them. Facts for other
    /// (entity, category) pairs are dropped.
    pub fn from_facts(entity_id: EntityId, category: Category, facts: Vec<Fact>) -> Self {
        let mut series = Self::new(entity_id, category);
        for fact in facts {
            series.push(fact);
        }
        series
    }

    /// Insert a fact at its sorted position. Returns false if it belongs to
    /// another series.
    pub fn push(&mut self, fact: Fact) -> bool {
        if fact.entity_id != self.entity_id || fact.category != self.category {
            return false;
        }
        let pos = self
            .facts
            .partition_point(|f| series_order(f, &fact) != Ordering::Greater);
        self.facts.insert(pos, fact);
        true
    }

    pub fn facts(&self) -> &[Fact] {
        &self.facts
    }

    pub fn len(&self) -> usize {
        self.facts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.facts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn t(y: i32, m: u32, day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, day, 0, 0, 0).unwrap()
    }

    #[test]
    fn series_keeps_period_then_disclosure_order() {
        let mut series = FactSeries::new(EntityId::new("X"), Category::quarterly());
        series.push(Fact::new("X", "quarterly", d(2024, 6, 30), t(2024, 7, 20)));
        series.push(Fact::new("X", "quarterly", d(2024, 3, 31), t(2024, 5, 1)));
        series.push(Fact::new("X", "quarterly", d(2024, 3, 31), t(2024, 4, 20)));

        let order: Vec<_> = series
            .facts()
            .iter()
            .map(|f| (f.period_end, f.disclosure_time))
            .collect();
        assert_eq!(
            order,
            vec![
                (d(2024, 3, 31), t(2024, 4, 20)),
                (d(2024, 3, 31), t(2024, 5, 1)),
                (d(2024, 6, 30), t(2024, 7, 20)),
            ]
        );
    }

    #[test]
    fn same_key_facts_order_by_values_not_insertion() {
        let low = Fact::new("X", "quarterly", d(2024, 3, 31), t(2024, 4, 20)).with_value("revenue", 100.0);
        let high = Fact::new("X", "quarterly", d(2024, 3, 31), t(2024, 4, 20)).with_value("revenue", 999.0);

        let forward = FactSeries::from_facts(
            EntityId::new("X"),
            Category::quarterly(),
            vec![low.clone(), high.clone()],
        );
        let reversed = FactSeries::from_facts(
            EntityId::new("X"),
            Category::quarterly(),
            vec![high.clone(), low.clone()],
        );

        assert_eq!(forward, reversed);
        assert_eq!(forward.facts(), &[low, high]);
    }

    #[test]
    fn series_rejects_foreign_facts() {
        let mut series = FactSeries::new(EntityId::new("X"), Category::quarterly());
        assert!(!series.push(Fact::new("Y", "quarterly", d(2024, 3, 31), t(2024, 4, 20))));
        assert!(!series.push(Fact::new("X", "annual", d(2024, 3, 31), t(2024, 4, 20))));
        assert!(series.is_empty());
    }

    #[test]
    fn backdated_fact_is_detected() {
        let fact = Fact::new("X", "quarterly", d(2024, 3, 31), t(2024, 3, 1));
        assert!(fact.disclosed_before_period_end());
        let fact = Fact::new("X", "quarterly", d(2024, 3, 31), t(2024, 3, 31));
        assert!(!fact.disclosed_before_period_end());
    }
}
