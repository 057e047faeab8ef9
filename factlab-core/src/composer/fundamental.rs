//! Single-fact fundamental ratios.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::domain::{Category, DerivedMetric, Fact};

use super::formula::{divide, finish, non_negative, percent_of, require, Input};
use super::MetricComposer;

pub const FUNDAMENTAL_RATIOS: &[&str] = &[
    "gross_margin",
    "operating_margin",
    "profit_margin",
    "roe",
    "roa",
    "current_ratio",
    "debt_to_equity",
    "debt_to_assets",
    "asset_turnover",
    "book_value_per_share",
    "capex_to_operating_cash_flow",
];

/// Ratios computed from one fact. `metrics` are timestamped at the fact's
/// disclosure time; `category` and `period_end` disambiguate facts of the
/// same entity disclosed at the same moment (a 10-K and its Q4).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactRatios {
    pub category: Category,
    pub period_end: NaiveDate,
    pub metrics: Vec<DerivedMetric>,
}

impl MetricComposer {
    pub fn fundamental_ratios(&self, fact: &Fact) -> FactRatios {
        let v = |m: &str| fact.value(m);
        let over = |num: &str, den: &str| -> Input { divide(require(v(num), num)?, v(den), den) };
        let pct_over =
            |num: &str, den: &str| -> Input { percent_of(require(v(num), num)?, v(den), den) };

        let capex = non_negative(
            self.normalized("capital_expenditures", v("capital_expenditures")),
            "capital_expenditures",
        );

        let values: [(&str, Input); 11] = [
            ("gross_margin", pct_over("gross_profit", "revenue")),
            ("operating_margin", pct_over("operating_income", "revenue")),
            ("profit_margin", pct_over("net_income", "revenue")),
            ("roe", pct_over("net_income", "total_equity")),
            ("roa", pct_over("net_income", "total_assets")),
            ("current_ratio", over("current_assets", "current_liabilities")),
            ("debt_to_equity", over("total_debt", "total_equity")),
            ("debt_to_assets", over("total_debt", "total_assets")),
            ("asset_turnover", over("revenue", "total_assets")),
            ("book_value_per_share", over("total_equity", "shares_outstanding")),
            (
                "capex_to_operating_cash_flow",
                capex.and_then(|c| percent_of(c, v("operating_cash_flow"), "operating_cash_flow")),
            ),
        ];

        FactRatios {
            category: fact.category.clone(),
            period_end: fact.period_end,
            metrics: values
                .into_iter()
                .map(|(name, value)| DerivedMetric {
                    entity_id: fact.entity_id.clone(),
                    timestamp: fact.disclosure_time,
                    metric_name: name.to_string(),
                    value: finish(value),
                })
                .collect(),
        }
    }
}
