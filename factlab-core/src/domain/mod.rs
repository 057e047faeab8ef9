//! Domain types for FactLab

pub mod fact;
pub mod ids;
pub mod observation;

pub use fact::{Fact, FactSeries};
pub use ids::{Category, EntityId};
pub use observation::{DerivedMetric, MetricValue, Observation, UndefinedReason};
