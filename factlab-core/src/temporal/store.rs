//! Immutable in-memory index of fact series.

use std::collections::BTreeMap;

use crate::domain::{Category, EntityId, Fact, FactSeries};

/// Read model for point-in-time queries: one [`FactSeries`] per
/// `(entity, category)`.
///
/// BTreeMap keys keep iteration order stable, which keeps everything computed
/// from the store deterministic.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FactStore {
    series: BTreeMap<(EntityId, Category), FactSeries>,
}

impl FactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_facts(facts: impl IntoIterator<Item = Fact>) -> Self {
        let mut store = Self::new();
        store.extend(facts);
        store
    }

    /// Record a fact. Facts are never replaced: a correction for the same
    /// period is a second entry with a later disclosure time.
    pub fn insert(&mut self, fact: Fact) {
        let key = (fact.entity_id.clone(), fact.category.clone());
        self.series
            .entry(key)
            .or_insert_with(|| FactSeries::new(fact.entity_id.clone(), fact.category.clone()))
            .push(fact);
    }

    pub fn extend(&mut self, facts: impl IntoIterator<Item = Fact>) {
        for fact in facts {
            self.insert(fact);
        }
    }

    pub fn series(&self, entity_id: &EntityId, category: &Category) -> Option<&FactSeries> {
        self.series.get(&(entity_id.clone(), category.clone()))
    }

    /// Distinct entities, sorted.
    pub fn entities(&self) -> Vec<EntityId> {
        let mut out: Vec<EntityId> = self.series.keys().map(|(e, _)| e.clone()).collect();
        out.dedup();
        out
    }

    /// All facts in `(entity, category, period_end, disclosure_time)` order.
    pub fn facts(&self) -> impl Iterator<Item = &Fact> {
        self.series.values().flat_map(|s| s.facts().iter())
    }

    pub fn len(&self) -> usize {
        self.series.values().map(|s| s.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone, Utc};

    #[test]
    fn groups_facts_by_entity_and_category() {
        let pe = NaiveDate::from_ymd_opt(2024, 3, 31).unwrap();
        let at = Utc.with_ymd_and_hms(2024, 4, 20, 0, 0, 0).unwrap();
        let store = FactStore::from_facts(vec![
            Fact::new("B", "quarterly", pe, at),
            Fact::new("A", "quarterly", pe, at),
            Fact::new("A", "annual", pe, at),
        ]);

        assert_eq!(store.len(), 3);
        assert_eq!(store.entities(), vec![EntityId::new("A"), EntityId::new("B")]);
        assert_eq!(
            store
                .series(&EntityId::new("A"), &Category::quarterly())
                .map(|s| s.len()),
            Some(1)
        );
        assert!(store
            .series(&EntityId::new("C"), &Category::quarterly())
            .is_none());
    }
}
