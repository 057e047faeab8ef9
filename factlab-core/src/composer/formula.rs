//! Small building blocks for metric formulas.
//!
//! Every helper returns `Result<f64, UndefinedReason>` so formulas compose
//! with `?` and end as a [`MetricValue`].

use crate::domain::{MetricValue, UndefinedReason};

pub(crate) type Input = Result<f64, UndefinedReason>;

pub(crate) fn require(value: Option<f64>, name: &str) -> Input {
    value.ok_or_else(|| UndefinedReason::MissingInput(name.to_string()))
}

/// Present and strictly positive.
pub(crate) fn positive(value: Option<f64>, name: &str) -> Input {
    let v = require(value, name)?;
    if v > 0.0 {
        Ok(v)
    } else {
        Err(UndefinedReason::NonPositiveInput(name.to_string()))
    }
}

/// Present and not negative.
pub(crate) fn non_negative(value: Option<f64>, name: &str) -> Input {
    let v = require(value, name)?;
    if v >= 0.0 {
        Ok(v)
    } else {
        Err(UndefinedReason::NonPositiveInput(name.to_string()))
    }
}

/// `numerator / denominator`, undefined unless the denominator is positive.
pub(crate) fn divide(numerator: f64, denominator: Option<f64>, name: &str) -> Input {
    let den = require(denominator, name)?;
    if den > 0.0 {
        Ok(numerator / den)
    } else {
        Err(UndefinedReason::NonPositiveDenominator(name.to_string()))
    }
}

/// `numerator / denominator` as a percentage.
pub(crate) fn percent_of(numerator: f64, denominator: Option<f64>, name: &str) -> Input {
    divide(numerator * 100.0, denominator, name)
}

pub(crate) fn finish(value: Input) -> MetricValue {
    match value {
        Ok(v) if v.is_finite() => MetricValue::Defined(v),
        Ok(_) => MetricValue::Undefined(UndefinedReason::NonPositiveDenominator(
            "non-finite result".to_string(),
        )),
        Err(reason) => MetricValue::Undefined(reason),
    }
}
