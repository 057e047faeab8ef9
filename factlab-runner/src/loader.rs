//! Idempotent writes: upsert by key, so re-running a pipeline never
//! duplicates rows.

use std::collections::BTreeMap;

use factlab_core::composer::FactRatios;
use factlab_core::domain::{DerivedMetric, Fact, MetricValue, Observation, UndefinedReason};
use factlab_core::retry::RetryPolicy;
use factlab_core::rollup::RollupResult;
use thiserror::Error;
use tracing::debug;

use crate::scheduler::{RunReport, TaskError};
use crate::store::{row, row_key, Row, StoreError, TargetStore, Value};

#[derive(Debug, Error)]
pub enum LoadError {
    /// Two rows of one batch share a key but differ, or a row lacks a key
    /// column. Never retried.
    #[error("upsert conflict in '{table}' at key [{key}]: {reason}")]
    UpsertConflict {
        table: String,
        key: String,
        reason: String,
    },

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("row encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

impl From<LoadError> for TaskError {
    fn from(e: LoadError) -> Self {
        match e {
            LoadError::UpsertConflict { .. } => TaskError::Integrity(e.to_string()),
            other => TaskError::Failed(other.to_string()),
        }
    }
}

/// A predefined write target: table name plus its key and update columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetTable {
    pub name: &'static str,
    pub key_columns: &'static [&'static str],
    pub update_columns: &'static [&'static str],
}

impl TargetTable {
    pub const FINANCIAL_FACTS: TargetTable = TargetTable {
        name: "financial_facts",
        key_columns: &["entity_id", "category", "period_end", "disclosure_time", "metric"],
        update_columns: &["value"],
    };

    pub const DAILY_PRICES: TargetTable = TargetTable {
        name: "daily_prices",
        key_columns: &["entity_id", "timestamp"],
        update_columns: &["value"],
    };

    pub const ROLLUPS: TargetTable = TargetTable {
        name: "rollups",
        key_columns: &["entity_id", "as_of", "window_policy"],
        update_columns: &[
            "periods_used",
            "source_disclosure_time",
            "disclosed_through",
            "values_json",
        ],
    };

    pub const FUNDAMENTAL_RATIOS: TargetTable = TargetTable {
        name: "fundamental_ratios",
        key_columns: &["entity_id", "category", "period_end", "timestamp", "metric_name"],
        update_columns: &["value", "undefined_reason", "undefined_input"],
    };

    pub const MARKET_METRICS: TargetTable = TargetTable {
        name: "market_metrics",
        key_columns: &["entity_id", "timestamp", "metric_name"],
        update_columns: &["value", "undefined_reason", "undefined_input"],
    };

    /// Append-only.
    pub const RUN_LOG: TargetTable = TargetTable {
        name: "run_log",
        key_columns: &[],
        update_columns: &[],
    };
}

/// Validates batches, chunks them and retries transient store failures.
#[derive(Debug, Clone)]
pub struct IdempotentLoader {
    batch_size: usize,
    retry: RetryPolicy,
}

impl Default for IdempotentLoader {
    fn default() -> Self {
        Self::new(500, RetryPolicy::default())
    }
}

impl IdempotentLoader {
    pub fn new(batch_size: usize, retry: RetryPolicy) -> Self {
        Self {
            batch_size: batch_size.max(1),
            retry,
        }
    }

    /// Upsert `rows`. Existing keys get `update_columns` overwritten; new
    /// keys are inserted. Returns rows affected.
    pub fn upsert(
        &self,
        store: &mut dyn TargetStore,
        table: &str,
        rows: &[Row],
        key_columns: &[&str],
        update_columns: &[&str],
    ) -> Result<usize, LoadError> {
        let batch = validate_batch(table, rows, key_columns)?;
        let mut affected = 0;
        for chunk in batch.chunks(self.batch_size) {
            let op = format!("upsert:{table}");
            affected += self
                .retry
                .run(&op, |_| store.upsert(table, chunk, key_columns, update_columns))?;
        }
        debug!(
            table,
            rows = rows.len(),
            distinct = batch.len(),
            affected,
            store = store.name(),
            "upsert complete"
        );
        Ok(affected)
    }

    pub fn append(
        &self,
        store: &mut dyn TargetStore,
        table: &str,
        rows: &[Row],
    ) -> Result<usize, LoadError> {
        let mut affected = 0;
        for chunk in rows.chunks(self.batch_size) {
            let op = format!("append:{table}");
            affected += self.retry.run(&op, |_| store.append(table, chunk))?;
        }
        Ok(affected)
    }

    /// Write to a predefined target with its own key and update columns.
    pub fn load(
        &self,
        store: &mut dyn TargetStore,
        target: TargetTable,
        rows: &[Row],
    ) -> Result<usize, LoadError> {
        if target.key_columns.is_empty() {
            self.append(store, target.name, rows)
        } else {
            self.upsert(
                store,
                target.name,
                rows,
                target.key_columns,
                target.update_columns,
            )
        }
    }
}

/// Every row must carry every key column. Rows sharing a key must be
/// identical; identical duplicates collapse to the first occurrence.
pub fn validate_batch(
    table: &str,
    rows: &[Row],
    key_columns: &[&str],
) -> Result<Vec<Row>, LoadError> {
    let mut seen: BTreeMap<String, usize> = BTreeMap::new();
    let mut out: Vec<Row> = Vec::with_capacity(rows.len());
    for r in rows {
        let key = row_key(r, key_columns).map_err(|column| LoadError::UpsertConflict {
            table: table.to_string(),
            key: String::new(),
            reason: format!("missing key column '{column}'"),
        })?;
        match seen.get(&key) {
            Some(&idx) if out[idx] == *r => continue,
            Some(_) => {
                return Err(LoadError::UpsertConflict {
                    table: table.to_string(),
                    key: key.replace('\u{1f}', ", "),
                    reason: "rows with the same key differ".to_string(),
                })
            }
            None => {
                seen.insert(key, out.len());
                out.push(r.clone());
            }
        }
    }
    Ok(out)
}

// ── Row conversions ──────────────────────────────────────────────────

/// One row per metric value.
pub fn fact_rows(fact: &Fact) -> Vec<Row> {
    fact.values
        .iter()
        .map(|(metric, value)| {
            row([
                ("entity_id", Value::from(fact.entity_id.as_str())),
                ("category", Value::from(fact.category.as_str())),
                ("period_end", Value::from(fact.period_end)),
                ("disclosure_time", Value::from(fact.disclosure_time)),
                ("metric", Value::from(metric.as_str())),
                ("value", Value::from(*value)),
            ])
        })
        .collect()
}

pub fn observation_row(obs: &Observation) -> Row {
    row([
        ("entity_id", Value::from(obs.entity_id.as_str())),
        ("timestamp", Value::from(obs.timestamp)),
        ("value", Value::from(obs.value)),
    ])
}

/// Metric values and period list are stored as JSON text.
pub fn rollup_row(r: &RollupResult) -> Result<Row, LoadError> {
    Ok(row([
        ("entity_id", Value::from(r.entity_id.as_str())),
        ("as_of", Value::from(r.as_of)),
        ("window_policy", Value::from(r.window_policy.as_str())),
        ("periods_used", Value::from(serde_json::to_string(&r.periods_used)?)),
        ("source_disclosure_time", Value::from(r.source_disclosure_time)),
        ("disclosed_through", Value::from(r.disclosed_through)),
        ("values_json", Value::from(serde_json::to_string(&r.values)?)),
    ]))
}

fn metric_cells(value: &MetricValue) -> [(&'static str, Value); 3] {
    let (reason, input) = match value {
        MetricValue::Defined(_) => (Value::Null, Value::Null),
        MetricValue::Undefined(r) => {
            let (kind, input) = match r {
                UndefinedReason::MissingInput(i) => ("missing_input", i),
                UndefinedReason::NonPositiveDenominator(i) => ("non_positive_denominator", i),
                UndefinedReason::NonPositiveInput(i) => ("non_positive_input", i),
            };
            (Value::from(kind), Value::from(input.as_str()))
        }
    };
    [
        ("value", Value::from(value.as_option())),
        ("undefined_reason", reason),
        ("undefined_input", input),
    ]
}

pub fn metric_row(m: &DerivedMetric) -> Row {
    let mut r = row([
        ("entity_id", Value::from(m.entity_id.as_str())),
        ("timestamp", Value::from(m.timestamp)),
        ("metric_name", Value::from(m.metric_name.as_str())),
    ]);
    r.extend(metric_cells(&m.value).map(|(k, v)| (k.to_string(), v)));
    r
}

pub fn ratio_rows(ratios: &FactRatios) -> Vec<Row> {
    ratios
        .metrics
        .iter()
        .map(|m| {
            let mut r = metric_row(m);
            r.insert("category".into(), Value::from(ratios.category.as_str()));
            r.insert("period_end".into(), Value::from(ratios.period_end));
            r
        })
        .collect()
}

/// One row per task of a finished run.
pub fn run_log_rows(report: &RunReport) -> Result<Vec<Row>, LoadError> {
    report
        .tasks
        .iter()
        .map(|t| {
            let status = serde_json::to_value(t.status)?;
            Ok(row([
                ("run_id", Value::from(report.run_id.as_str())),
                ("exit", Value::from(format!("{:?}", report.exit).to_lowercase())),
                ("task", Value::from(t.name.as_str())),
                ("level", Value::from(t.level.map(|l| l as i64))),
                ("idempotency_key", Value::from(t.idempotency_key.as_str())),
                ("status", Value::from(status.as_str().unwrap_or_default())),
                ("started_at", Value::from(t.started_at)),
                ("duration_ms", Value::from(t.duration_ms as i64)),
                ("error", Value::from(t.error.clone())),
            ]))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::{NaiveDate, TimeZone, Utc};

    fn price(entity: &str, value: f64) -> Row {
        observation_row(&Observation::new(
            entity,
            Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap(),
            value,
        ))
    }

    fn loader() -> IdempotentLoader {
        IdempotentLoader::new(2, RetryPolicy::immediate(1))
    }

    #[test]
    fn second_upsert_wins_and_keeps_one_row_per_key() {
        let mut store = MemoryStore::new();
        let t = TargetTable::DAILY_PRICES;
        loader().load(&mut store, t, &[price("A", 1.0), price("B", 2.0), price("C", 3.0)]).unwrap();
        loader().load(&mut store, t, &[price("A", 9.0)]).unwrap();

        assert_eq!(store.row_count(t.name).unwrap(), 3);
        let rows = store.fetch_all(t.name).unwrap();
        let a = rows
            .iter()
            .find(|r| r.get("entity_id").and_then(Value::as_text) == Some("A"))
            .unwrap();
        assert_eq!(a.get("value"), Some(&Value::Float(9.0)));
    }

    #[test]
    fn identical_duplicates_collapse() {
        let rows = vec![price("A", 1.0), price("A", 1.0), price("B", 1.0)];
        let out = validate_batch("daily_prices", &rows, TargetTable::DAILY_PRICES.key_columns).unwrap();
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn conflicting_duplicates_are_an_integrity_error() {
        let rows = vec![price("A", 1.0), price("A", 2.0)];
        let mut store = MemoryStore::new();
        let err = loader()
            .load(&mut store, TargetTable::DAILY_PRICES, &rows)
            .unwrap_err();
        assert!(matches!(err, LoadError::UpsertConflict { .. }));
        assert!(matches!(TaskError::from(err), TaskError::Integrity(_)));
        // Nothing was written.
        assert_eq!(store.row_count("daily_prices").unwrap(), 0);
    }

    #[test]
    fn missing_key_column_is_a_conflict() {
        let mut r = price("A", 1.0);
        r.remove("timestamp");
        let err = validate_batch("daily_prices", &[r], TargetTable::DAILY_PRICES.key_columns).unwrap_err();
        assert!(err.to_string().contains("missing key column 'timestamp'"));
    }

    #[test]
    fn run_log_appends() {
        let mut store = MemoryStore::new();
        let rows = vec![row([("run_id", "r1")]), row([("run_id", "r1")])];
        loader().load(&mut store, TargetTable::RUN_LOG, &rows).unwrap();
        loader().load(&mut store, TargetTable::RUN_LOG, &rows).unwrap();
        assert_eq!(store.row_count("run_log").unwrap(), 4);
    }

    #[test]
    fn fact_becomes_one_row_per_metric() {
        let fact = Fact::new(
            "X",
            "quarterly",
            NaiveDate::from_ymd_opt(2024, 3, 31).unwrap(),
            Utc.with_ymd_and_hms(2024, 4, 20, 0, 0, 0).unwrap(),
        )
        .with_value("revenue", 10.0)
        .with_value("net_income", 1.0);
        let rows = fact_rows(&fact);
        assert_eq!(rows.len(), 2);
        assert!(rows
            .iter()
            .all(|r| row_key(r, TargetTable::FINANCIAL_FACTS.key_columns).is_ok()));
    }

    #[test]
    fn undefined_metric_keeps_its_reason() {
        let m = DerivedMetric {
            entity_id: "X".into(),
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap(),
            metric_name: "pe_ratio".into(),
            value: MetricValue::Undefined(UndefinedReason::NonPositiveDenominator(
                "net_income".into(),
            )),
        };
        let r = metric_row(&m);
        assert_eq!(r.get("value"), Some(&Value::Null));
        assert_eq!(
            r.get("undefined_reason"),
            Some(&Value::from("non_positive_denominator"))
        );
        assert_eq!(r.get("undefined_input"), Some(&Value::from("net_income")));
    }
}
