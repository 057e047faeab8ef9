//! External point-in-time series elements and the metrics derived from them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::EntityId;

/// One element of an external time series (e.g. a daily close price).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub entity_id: EntityId,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

impl Observation {
    pub fn new(entity_id: impl Into<EntityId>, timestamp: DateTime<Utc>, value: f64) -> Self {
        Self {
            entity_id: entity_id.into(),
            timestamp,
            value,
        }
    }
}

/// Why a formula produced no number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "input", rename_all = "snake_case")]
pub enum UndefinedReason {
    /// A required input could not be resolved as of the timestamp.
    MissingInput(String),
    /// A denominator was zero or negative.
    NonPositiveDenominator(String),
    /// A numerator that only makes sense positive (earnings for P/E, a
    /// normalized outflow) was zero or negative.
    NonPositiveInput(String),
}

/// Formula result: a number, or an explicit "undefined" with its cause.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum MetricValue {
    Defined(f64),
    Undefined(UndefinedReason),
}

impl MetricValue {
    pub fn as_option(&self) -> Option<f64> {
        match self {
            MetricValue::Defined(v) => Some(*v),
            MetricValue::Undefined(_) => None,
        }
    }

    pub fn is_defined(&self) -> bool {
        matches!(self, MetricValue::Defined(_))
    }

    pub fn missing(input: &str) -> Self {
        MetricValue::Undefined(UndefinedReason::MissingInput(input.to_string()))
    }
}

/// Output of the metric composer, keyed by `(entity_id, timestamp, metric_name)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedMetric {
    pub entity_id: EntityId,
    pub timestamp: DateTime<Utc>,
    pub metric_name: String,
    pub value: MetricValue,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn undefined_has_no_number() {
        let v = MetricValue::missing("shares_outstanding");
        assert!(!v.is_defined());
        assert_eq!(v.as_option(), None);
        assert_eq!(MetricValue::Defined(1.5).as_option(), Some(1.5));
    }

    #[test]
    fn metric_value_serializes_tagged() {
        let json = serde_json::to_string(&MetricValue::Defined(2.0)).unwrap();
        assert_eq!(json, r#"{"kind":"defined","value":2.0}"#);
        let json = serde_json::to_string(&MetricValue::Undefined(
            UndefinedReason::NonPositiveDenominator("revenue".into()),
        ))
        .unwrap();
        assert_eq!(
            json,
            r#"{"kind":"undefined","value":{"reason":"non_positive_denominator","input":"revenue"}}"#
        );
    }
}
