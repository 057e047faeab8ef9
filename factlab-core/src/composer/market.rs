//! Per-observation market metrics.

use chrono::{DateTime, Utc};

use crate::domain::{DerivedMetric, Observation};
use crate::rollup::RollupResult;
use crate::temporal::{FactStore, Resolver};

use super::formula::{divide, finish, non_negative, percent_of, positive, require, Input};
use super::MetricComposer;

/// Names emitted per observation, in output order.
pub const MARKET_METRICS: &[&str] = &[
    "market_cap",
    "enterprise_value",
    "pe_ratio",
    "pe_ratio_ttm",
    "pb_ratio",
    "ps_ratio",
    "ps_ratio_ttm",
    "ev_to_revenue",
    "ev_to_revenue_ttm",
    "ev_to_ebit",
    "dividend_yield",
    "payout_ratio",
];

/// The rollup an observer at `t` would use: among rollups whose inputs were
/// all disclosed by `t`, the greatest `source_disclosure_time`. Ties prefer a
/// rollup computed at or before `t`, then the greatest `as_of`.
pub fn latest_rollup_as_of<'a, I>(rollups: I, t: DateTime<Utc>) -> Option<&'a RollupResult>
where
    I: IntoIterator<Item = &'a RollupResult>,
{
    rollups
        .into_iter()
        .filter(|r| r.is_known_at(t))
        .max_by_key(|r| (r.source_disclosure_time, r.as_of <= t, r.as_of))
}

impl MetricComposer {
    /// Market metrics for one observation. `rollups` may contain other
    /// entities; only the observation's entity is considered.
    pub fn market_metrics(
        &self,
        store: &FactStore,
        rollups: &[RollupResult],
        observation: &Observation,
    ) -> Vec<DerivedMetric> {
        let t = observation.timestamp;
        let entity = &observation.entity_id;

        let annual = Resolver::new(store)
            .resolve(entity, &self.annual_category, t)
            .ok();
        let ttm = latest_rollup_as_of(rollups.iter().filter(|r| &r.entity_id == entity), t);

        let fy = |m: &str| annual.and_then(|f| f.value(m));
        let trailing = |m: &str| ttm.and_then(|r| r.value(m));
        let balance = |m: &str| fy(m).or_else(|| trailing(m));

        let price = positive(Some(observation.value), "price");
        let shares = positive(
            fy("shares_outstanding")
                .filter(|s| *s > 0.0)
                .or_else(|| trailing("shares_outstanding")),
            "shares_outstanding",
        );
        let market_cap: Input = match (&price, &shares) {
            (Ok(p), Ok(s)) => Ok(p * s),
            (Err(e), _) | (_, Err(e)) => Err(e.clone()),
        };
        let enterprise_value: Input = market_cap.clone().and_then(|mcap| {
            let debt = require(balance("total_debt"), "total_debt")?;
            let cash = require(balance("cash_and_equivalents"), "cash_and_equivalents")?;
            Ok(mcap + debt - cash)
        });
        let ttm_dividends = non_negative(
            self.normalized("dividends_paid", trailing("dividends_paid")),
            "ttm_dividends_paid",
        );

        let on_mcap = |den: Option<f64>, name: &str| {
            market_cap.clone().and_then(|m| divide(m, den, name))
        };
        let on_ev = |den: Option<f64>, name: &str| {
            enterprise_value.clone().and_then(|ev| divide(ev, den, name))
        };

        let values: [(&str, Input); 12] = [
            ("market_cap", market_cap.clone()),
            ("enterprise_value", enterprise_value.clone()),
            ("pe_ratio", on_mcap(fy("net_income"), "net_income")),
            ("pe_ratio_ttm", on_mcap(trailing("net_income"), "ttm_net_income")),
            ("pb_ratio", on_mcap(balance("total_equity"), "total_equity")),
            ("ps_ratio", on_mcap(fy("revenue"), "revenue")),
            ("ps_ratio_ttm", on_mcap(trailing("revenue"), "ttm_revenue")),
            ("ev_to_revenue", on_ev(fy("revenue"), "revenue")),
            ("ev_to_revenue_ttm", on_ev(trailing("revenue"), "ttm_revenue")),
            ("ev_to_ebit", on_ev(trailing("operating_income"), "ttm_operating_income")),
            (
                "dividend_yield",
                market_cap.clone().and_then(|mcap| {
                    percent_of(ttm_dividends.clone()?, Some(mcap), "market_cap")
                }),
            ),
            (
                "payout_ratio",
                ttm_dividends
                    .clone()
                    .and_then(|div| percent_of(div, trailing("net_income"), "ttm_net_income")),
            ),
        ];

        values
            .into_iter()
            .map(|(name, value)| DerivedMetric {
                entity_id: entity.clone(),
                timestamp: t,
                metric_name: name.to_string(),
                value: finish(value),
            })
            .collect()
    }

    /// Market metrics for a batch of observations, in input order.
    pub fn market_metrics_for(
        &self,
        store: &FactStore,
        rollups: &[RollupResult],
        observations: &[Observation],
    ) -> Vec<DerivedMetric> {
        observations
            .iter()
            .flat_map(|obs| self.market_metrics(store, rollups, obs))
            .collect()
    }
}
