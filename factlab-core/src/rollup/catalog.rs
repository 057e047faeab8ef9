//! Metric classification for aggregation and sign handling.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// How a metric aggregates across periods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    /// Accumulates over a period (revenue, cash flows). Summed.
    Flow,
    /// Balance at period end (assets, shares). Taken from the newest period.
    Stock,
}

/// How a metric is signed at rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignConvention {
    #[default]
    Natural,
    /// Stored negative when money leaves the entity (dividends paid, capex).
    Outflow,
}

impl SignConvention {
    /// Positive magnitude for use in ratios.
    pub fn normalize(self, value: f64) -> f64 {
        match self {
            SignConvention::Natural => value,
            SignConvention::Outflow => -value,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricSpec {
    pub kind: MetricKind,
    #[serde(default)]
    pub sign: SignConvention,
}

/// Metric name → spec. Metrics not listed are ignored by rollups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricCatalog {
    metrics: BTreeMap<String, MetricSpec>,
}

const FLOWS: &[&str] = &[
    "revenue",
    "cost_of_revenue",
    "gross_profit",
    "operating_expenses",
    "operating_income",
    "net_income",
    "eps",
    "eps_diluted",
    "operating_cash_flow",
    "investing_cash_flow",
    "financing_cash_flow",
    "free_cash_flow",
];

const OUTFLOWS: &[&str] = &["capital_expenditures", "dividends_paid"];

const STOCKS: &[&str] = &[
    "shares_outstanding",
    "total_assets",
    "current_assets",
    "total_liabilities",
    "current_liabilities",
    "total_equity",
    "cash_and_equivalents",
    "total_debt",
    "net_debt",
];

impl Default for MetricCatalog {
    fn default() -> Self {
        Self::default_financials()
    }
}

impl MetricCatalog {
    pub fn empty() -> Self {
        Self {
            metrics: BTreeMap::new(),
        }
    }

    /// Income statement and cash flow lines as flows, balance sheet lines as
    /// stocks; capex and dividends carry the outflow convention.
    pub fn default_financials() -> Self {
        let mut catalog = Self::empty();
        for name in FLOWS {
            catalog = catalog.with_metric(*name, MetricKind::Flow, SignConvention::Natural);
        }
        for name in OUTFLOWS {
            catalog = catalog.with_metric(*name, MetricKind::Flow, SignConvention::Outflow);
        }
        for name in STOCKS {
            catalog = catalog.with_metric(*name, MetricKind::Stock, SignConvention::Natural);
        }
        catalog
    }

    pub fn with_metric(
        mut self,
        name: impl Into<String>,
        kind: MetricKind,
        sign: SignConvention,
    ) -> Self {
        self.metrics.insert(name.into(), MetricSpec { kind, sign });
        self
    }

    pub fn get(&self, name: &str) -> Option<MetricSpec> {
        self.metrics.get(name).copied()
    }

    pub fn kind(&self, name: &str) -> Option<MetricKind> {
        self.get(name).map(|s| s.kind)
    }

    /// Unlisted metrics are treated as naturally signed.
    pub fn sign(&self, name: &str) -> SignConvention {
        self.get(name).map(|s| s.sign).unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, MetricSpec)> {
        self.metrics.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }
}
