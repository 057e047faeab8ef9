//! Non-fatal data-quality findings.
//!
//! Nothing here rejects data. Findings are carried alongside results and
//! logged; the caller decides whether they matter.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::domain::{EntityId, Fact};

/// Absolute tolerance for accounting identity checks.
pub const IDENTITY_TOLERANCE: f64 = 0.01;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "warning", rename_all = "snake_case")]
pub enum DataQualityWarning {
    /// Oldest-to-newest period span of a rollup window is outside tolerance.
    SpanOutOfTolerance {
        entity_id: EntityId,
        as_of: DateTime<Utc>,
        span_months: i32,
        min_months: u32,
        max_months: u32,
    },
    /// Disclosure date precedes the period end.
    DisclosedBeforePeriodEnd {
        entity_id: EntityId,
        period_end: NaiveDate,
        disclosure_time: DateTime<Utc>,
    },
    /// A flow metric is missing from some window periods and was left out.
    IncompleteFlowMetric {
        entity_id: EntityId,
        as_of: DateTime<Utc>,
        metric: String,
        present_in: usize,
        required: usize,
    },
    /// total_assets != total_liabilities + total_equity.
    BalanceSheetMismatch {
        entity_id: EntityId,
        period_end: NaiveDate,
        total_assets: f64,
        liabilities_plus_equity: f64,
    },
    /// gross_profit != revenue - cost_of_revenue.
    GrossProfitMismatch {
        entity_id: EntityId,
        period_end: NaiveDate,
        reported: f64,
        expected: f64,
    },
    /// free_cash_flow != operating_cash_flow - |capital_expenditures|.
    FreeCashFlowMismatch {
        entity_id: EntityId,
        period_end: NaiveDate,
        reported: f64,
        expected: f64,
    },
}

impl DataQualityWarning {
    pub fn entity_id(&self) -> &EntityId {
        match self {
            DataQualityWarning::SpanOutOfTolerance { entity_id, .. }
            | DataQualityWarning::DisclosedBeforePeriodEnd { entity_id, .. }
            | DataQualityWarning::IncompleteFlowMetric { entity_id, .. }
            | DataQualityWarning::BalanceSheetMismatch { entity_id, .. }
            | DataQualityWarning::GrossProfitMismatch { entity_id, .. }
            | DataQualityWarning::FreeCashFlowMismatch { entity_id, .. } => entity_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DataQualityWarning::SpanOutOfTolerance { .. } => "span_out_of_tolerance",
            DataQualityWarning::DisclosedBeforePeriodEnd { .. } => "disclosed_before_period_end",
            DataQualityWarning::IncompleteFlowMetric { .. } => "incomplete_flow_metric",
            DataQualityWarning::BalanceSheetMismatch { .. } => "balance_sheet_mismatch",
            DataQualityWarning::GrossProfitMismatch { .. } => "gross_profit_mismatch",
            DataQualityWarning::FreeCashFlowMismatch { .. } => "free_cash_flow_mismatch",
        }
    }

    /// Emit through `tracing` at warn level.
    pub fn log(&self) {
        warn!(
            entity = %self.entity_id(),
            kind = self.kind(),
            detail = ?self,
            "data quality warning"
        );
    }
}

/// Single-fact checks: disclosure ordering and the accounting identities.
/// Identities are only checked when all their inputs are present.
pub fn validate_fact(fact: &Fact) -> Vec<DataQualityWarning> {
    let mut out = Vec::new();

    if fact.disclosed_before_period_end() {
        out.push(DataQualityWarning::DisclosedBeforePeriodEnd {
            entity_id: fact.entity_id.clone(),
            period_end: fact.period_end,
            disclosure_time: fact.disclosure_time,
        });
    }

    if let (Some(assets), Some(liabilities), Some(equity)) = (
        fact.value("total_assets"),
        fact.value("total_liabilities"),
        fact.value("total_equity"),
    ) {
        let rhs = liabilities + equity;
        if (assets - rhs).abs() > IDENTITY_TOLERANCE {
            out.push(DataQualityWarning::BalanceSheetMismatch {
                entity_id: fact.entity_id.clone(),
                period_end: fact.period_end,
                total_assets: assets,
                liabilities_plus_equity: rhs,
            });
        }
    }

    if let (Some(gross), Some(revenue), Some(cost)) = (
        fact.value("gross_profit"),
        fact.value("revenue"),
        fact.value("cost_of_revenue"),
    ) {
        let expected = revenue - cost;
        if (gross - expected).abs() > IDENTITY_TOLERANCE {
            out.push(DataQualityWarning::GrossProfitMismatch {
                entity_id: fact.entity_id.clone(),
                period_end: fact.period_end,
                reported: gross,
                expected,
            });
        }
    }

    if let (Some(fcf), Some(ocf), Some(capex)) = (
        fact.value("free_cash_flow"),
        fact.value("operating_cash_flow"),
        fact.value("capital_expenditures"),
    ) {
        let expected = ocf - capex.abs();
        if (fcf - expected).abs() > IDENTITY_TOLERANCE {
            out.push(DataQualityWarning::FreeCashFlowMismatch {
                entity_id: fact.entity_id.clone(),
                period_end: fact.period_end,
                reported: fcf,
                expected,
            });
        }
    }

    out
}
