//! Trailing-window aggregation over point-in-time resolved periods.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::{Category, EntityId, Fact};
use crate::quality::DataQualityWarning;
use crate::temporal::{FactStore, Resolver};

use super::catalog::{MetricCatalog, MetricKind};
use super::policy::{span_months, WindowPolicy};

/// Trailing aggregate known at `as_of`. Key: `(entity_id, as_of, window_policy)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollupResult {
    pub entity_id: EntityId,
    pub as_of: DateTime<Utc>,
    pub window_policy: String,
    /// Oldest first.
    pub periods_used: Vec<NaiveDate>,
    /// Disclosure time of the newest period's fact.
    pub source_disclosure_time: DateTime<Utc>,
    /// Latest disclosure among all facts used. Differs from
    /// `source_disclosure_time` when an older period was corrected later.
    pub disclosed_through: DateTime<Utc>,
    pub values: BTreeMap<String, f64>,
}

impl RollupResult {
    pub fn value(&self, metric: &str) -> Option<f64> {
        self.values.get(metric).copied()
    }

    /// Whether every input of this result was known at `t`.
    pub fn is_known_at(&self, t: DateTime<Utc>) -> bool {
        self.source_disclosure_time <= t && self.disclosed_through <= t
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RollupOutcome {
    Computed {
        result: RollupResult,
        warnings: Vec<DataQualityWarning>,
    },
    /// Fewer qualifying periods than the policy needs.
    Insufficient { available: usize, required: usize },
}

impl RollupOutcome {
    pub fn result(&self) -> Option<&RollupResult> {
        match self {
            RollupOutcome::Computed { result, .. } => Some(result),
            RollupOutcome::Insufficient { .. } => None,
        }
    }

    pub fn into_result(self) -> Option<RollupResult> {
        match self {
            RollupOutcome::Computed { result, .. } => Some(result),
            RollupOutcome::Insufficient { .. } => None,
        }
    }

    pub fn warnings(&self) -> &[DataQualityWarning] {
        match self {
            RollupOutcome::Computed { warnings, .. } => warnings,
            RollupOutcome::Insufficient { .. } => &[],
        }
    }
}

/// Complete windows computed at each disclosure event of a series.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RollupSeries {
    pub results: Vec<RollupResult>,
    pub warnings: Vec<DataQualityWarning>,
    /// Disclosure events that did not yet have enough periods.
    pub skipped: usize,
}

#[derive(Debug, Clone, Default)]
pub struct RollupCalculator {
    policy: WindowPolicy,
    catalog: MetricCatalog,
}

impl RollupCalculator {
    pub fn new(policy: WindowPolicy, catalog: MetricCatalog) -> Self {
        Self { policy, catalog }
    }

    pub fn policy(&self) -> &WindowPolicy {
        &self.policy
    }

    pub fn catalog(&self) -> &MetricCatalog {
        &self.catalog
    }

    /// Trailing aggregate of the `policy.periods` most recent periods visible
    /// at `as_of`, each resolved at that same `as_of`.
    pub fn rollup(
        &self,
        store: &FactStore,
        entity_id: &EntityId,
        category: &Category,
        as_of: DateTime<Utc>,
    ) -> RollupOutcome {
        let required = self.policy.periods;
        let resolver = Resolver::new(store);
        let cutoff = self.policy.lookback_cutoff(as_of);
        let periods = resolver.visible_periods(entity_id, category, as_of, cutoff);

        if required == 0 || periods.len() < required {
            return RollupOutcome::Insufficient {
                available: periods.len(),
                required,
            };
        }

        // Newest-first → oldest-first.
        let mut facts: Vec<&Fact> = Vec::with_capacity(required);
        for period_end in periods.iter().take(required).rev() {
            match resolver.resolve_period(entity_id, category, *period_end, as_of) {
                Ok(fact) => facts.push(fact),
                Err(_) => {
                    return RollupOutcome::Insufficient {
                        available: facts.len(),
                        required,
                    }
                }
            }
        }

        let (Some(oldest), Some(newest)) = (facts.first(), facts.last()) else {
            return RollupOutcome::Insufficient {
                available: 0,
                required,
            };
        };
        let oldest_period = oldest.period_end;
        let newest_period = newest.period_end;
        let source_disclosure_time = newest.disclosure_time;
        let disclosed_through = facts
            .iter()
            .map(|f| f.disclosure_time)
            .max()
            .unwrap_or(source_disclosure_time);

        let mut warnings = Vec::new();
        let span = span_months(oldest_period, newest_period);
        if !self.policy.span_within_tolerance(span) {
            warnings.push(DataQualityWarning::SpanOutOfTolerance {
                entity_id: entity_id.clone(),
                as_of,
                span_months: span,
                min_months: self.policy.min_span_months,
                max_months: self.policy.max_span_months,
            });
        }

        let mut values: BTreeMap<String, f64> = BTreeMap::new();
        for (metric, spec) in self.catalog.iter() {
            match spec.kind {
                MetricKind::Flow => {
                    let present: Vec<f64> = facts.iter().filter_map(|f| f.value(metric)).collect();
                    if present.len() == facts.len() {
                        values.insert(metric.to_string(), present.iter().sum::<f64>());
                    } else if !present.is_empty() {
                        warnings.push(DataQualityWarning::IncompleteFlowMetric {
                            entity_id: entity_id.clone(),
                            as_of,
                            metric: metric.to_string(),
                            present_in: present.len(),
                            required: facts.len(),
                        });
                    }
                }
                MetricKind::Stock => {
                    if let Some(v) = newest.value(metric) {
                        values.insert(metric.to_string(), v);
                    }
                }
            }
        }

        for w in &warnings {
            w.log();
        }

        let periods_used: Vec<NaiveDate> = facts.iter().map(|f| f.period_end).collect();
        debug!(
            entity = %entity_id,
            %as_of,
            periods = ?periods_used,
            metrics = values.len(),
            "rollup computed"
        );

        RollupOutcome::Computed {
            result: RollupResult {
                entity_id: entity_id.clone(),
                as_of,
                window_policy: self.policy.name.clone(),
                periods_used,
                source_disclosure_time,
                disclosed_through,
                values,
            },
            warnings,
        }
    }

    /// Rollups at every disclosure event of the series. Events without a
    /// complete window are skipped.
    pub fn rollup_series(
        &self,
        store: &FactStore,
        entity_id: &EntityId,
        category: &Category,
    ) -> RollupSeries {
        let resolver = Resolver::new(store);
        let mut out = RollupSeries::default();
        for as_of in resolver.disclosure_events(entity_id, category) {
            match self.rollup(store, entity_id, category, as_of) {
                RollupOutcome::Computed { result, warnings } => {
                    out.results.push(result);
                    out.warnings.extend(warnings);
                }
                RollupOutcome::Insufficient { .. } => out.skipped += 1,
            }
        }
        out
    }
}
