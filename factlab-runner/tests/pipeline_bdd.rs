//! BDD tests for the daily pipeline, end to end.
//!
//! - Facts → rollups → ratios → market metrics land in every target table
//! - Re-running over the same inputs leaves row counts unchanged
//! - A failing shard yields a partial run
//! - Transient source failures are retried
//! - The same pipeline against SQLite

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Days, NaiveDate, TimeZone, Utc};
use factlab_core::domain::{Category, EntityId, Fact, Observation};
use factlab_core::retry::RetryPolicy;
use factlab_core::source::{
    FactSource, SourceError, StaticFactSource, StaticObservationSource,
};
use factlab_runner::{
    run_pipeline, ExitClass, PipelineConfig, RunContext, SqliteStore, TargetStore, TargetTable,
    TaskStatus, Value,
};

const TABLES: [TargetTable; 5] = [
    TargetTable::FINANCIAL_FACTS,
    TargetTable::DAILY_PRICES,
    TargetTable::ROLLUPS,
    TargetTable::FUNDAMENTAL_RATIOS,
    TargetTable::MARKET_METRICS,
];

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn quarter(entity: &str, period_end: NaiveDate, revenue: f64) -> Fact {
    let disclosed = period_end
        .checked_add_days(Days::new(30))
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap()
        .and_utc();
    Fact::new(entity, Category::quarterly(), period_end, disclosed)
        .with_value("revenue", revenue)
        .with_value("net_income", 10.0)
        .with_value("operating_income", 20.0)
}

/// Four quarters of 2024 plus the FY2024 annual fact.
fn facts_for(entity: &str) -> Vec<Fact> {
    vec![
        quarter(entity, date(2024, 3, 31), 100.0),
        quarter(entity, date(2024, 6, 30), 110.0),
        quarter(entity, date(2024, 9, 30), 120.0),
        quarter(entity, date(2024, 12, 31), 130.0),
        Fact::new(
            entity,
            Category::annual(),
            date(2024, 12, 31),
            Utc.with_ymd_and_hms(2025, 2, 15, 0, 0, 0).unwrap(),
        )
        .with_value("revenue", 460.0)
        .with_value("net_income", 40.0)
        .with_value("shares_outstanding", 100.0)
        .with_value("total_debt", 50.0)
        .with_value("cash_and_equivalents", 20.0)
        .with_value("total_equity", 500.0),
    ]
}

fn prices_for(entity: &str) -> Vec<Observation> {
    vec![
        Observation::new(entity, Utc.with_ymd_and_hms(2025, 3, 3, 0, 0, 0).unwrap(), 10.0),
        Observation::new(entity, Utc.with_ymd_and_hms(2025, 3, 4, 0, 0, 0).unwrap(), 12.0),
    ]
}

fn counts(store: &mut dyn TargetStore) -> Vec<usize> {
    TABLES
        .iter()
        .map(|t| store.row_count(t.name).unwrap())
        .collect()
}

fn market_metric(store: &mut dyn TargetStore, name: &str, ts: &str) -> Option<f64> {
    store
        .fetch_all(TargetTable::MARKET_METRICS.name)
        .unwrap()
        .into_iter()
        .find(|r| {
            r.get("metric_name").and_then(Value::as_text) == Some(name)
                && r.get("timestamp").map(Value::canonical).as_deref() == Some(ts)
        })
        .and_then(|r| r.get("value").and_then(Value::as_f64))
}

#[test]
fn bdd_scenario_single_entity_pipeline_fills_every_table() {
    // GIVEN one entity with four quarters, an annual fact and two prices
    let (ctx, mut store) = RunContext::in_memory(PipelineConfig::default());
    let facts = Arc::new(StaticFactSource::new(facts_for("X")));
    let prices = Arc::new(StaticObservationSource::new(prices_for("X")));

    // WHEN the pipeline runs
    let report = run_pipeline(&ctx, facts, prices, &[EntityId::new("X")]);

    // THEN every task succeeds
    assert_eq!(report.exit, ExitClass::Success, "{report:#?}");
    assert_eq!(report.count(TaskStatus::Succeeded), 5);

    // AND each table has the expected rows:
    // 4×3 + 6 fact values, 2 prices, 1 complete window, 5×11 ratios, 2×12 metrics
    assert_eq!(counts(&mut store), vec![18, 2, 1, 55, 24]);
    assert_eq!(store.row_count(TargetTable::RUN_LOG.name).unwrap(), 5);

    // AND market metrics use the annual shares and the trailing rollup
    let first_day = "ts:2025-03-03T00:00:00.000000Z";
    assert_eq!(market_metric(&mut store, "market_cap", first_day), Some(1000.0));
    assert_eq!(market_metric(&mut store, "enterprise_value", first_day), Some(1030.0));
    assert_eq!(market_metric(&mut store, "pe_ratio_ttm", first_day), Some(25.0));
    assert_eq!(market_metric(&mut store, "pe_ratio", first_day), Some(25.0));
}

#[test]
fn bdd_scenario_rerun_leaves_row_counts_unchanged() {
    // GIVEN a pipeline that has already run once
    let (ctx, mut store) = RunContext::in_memory(PipelineConfig::default());
    let facts = Arc::new(StaticFactSource::new(facts_for("X")));
    let prices = Arc::new(StaticObservationSource::new(prices_for("X")));
    let entities = [EntityId::new("X")];
    run_pipeline(&ctx, facts.clone(), prices.clone(), &entities);
    let first = counts(&mut store);

    // WHEN it runs again over the same inputs
    let report = run_pipeline(&ctx, facts, prices, &entities);

    // THEN no target table grows; only the run log is appended to
    assert_eq!(report.exit, ExitClass::Success);
    assert_eq!(counts(&mut store), first);
    assert_eq!(store.row_count(TargetTable::RUN_LOG.name).unwrap(), 10);
}

/// Fails for one entity, serves the rest from a static source.
struct FailingFor {
    bad: EntityId,
    inner: StaticFactSource,
}

impl FactSource for FailingFor {
    fn name(&self) -> &str {
        "failing"
    }

    fn pull(
        &self,
        entity_ids: &[EntityId],
        category: &Category,
        limit: Option<usize>,
    ) -> Result<Vec<Fact>, SourceError> {
        if entity_ids.contains(&self.bad) {
            return Err(SourceError::NotFound(self.bad.to_string()));
        }
        self.inner.pull(entity_ids, category, limit)
    }
}

#[test]
fn bdd_scenario_failing_shard_makes_the_run_partial() {
    // GIVEN two single-entity shards where the first entity's facts are gone
    let mut config = PipelineConfig::default();
    config.run.shard_size = 1;
    let (ctx, mut store) = RunContext::in_memory(config);
    let facts = Arc::new(FailingFor {
        bad: EntityId::new("BAD"),
        inner: StaticFactSource::new(facts_for("X")),
    });
    let mut observations = prices_for("X");
    observations.extend(prices_for("BAD"));
    let prices = Arc::new(StaticObservationSource::new(observations));

    // WHEN the pipeline runs
    let report = run_pipeline(
        &ctx,
        facts,
        prices,
        &[EntityId::new("BAD"), EntityId::new("X")],
    );

    // THEN the failing shard's downstream stages are blocked
    assert_eq!(report.task("facts:0").unwrap().status, TaskStatus::Failed);
    assert_eq!(report.task("prices:0").unwrap().status, TaskStatus::Succeeded);
    for blocked in ["rollups:0", "ratios:0", "market_metrics:0"] {
        assert_eq!(report.task(blocked).unwrap().status, TaskStatus::Blocked, "{blocked}");
    }

    // AND the healthy shard completes
    for ok in ["facts:1", "prices:1", "rollups:1", "ratios:1", "market_metrics:1"] {
        assert_eq!(report.task(ok).unwrap().status, TaskStatus::Succeeded, "{ok}");
    }

    // AND the run is partial with the healthy shard's rows written
    assert_eq!(report.exit, ExitClass::Partial);
    assert_eq!(report.exit_code(), 1);
    assert_eq!(counts(&mut store), vec![18, 4, 1, 55, 24]);
}

/// Fails transiently on the first pull, then delegates.
struct Flaky {
    calls: AtomicUsize,
    inner: StaticFactSource,
}

impl FactSource for Flaky {
    fn name(&self) -> &str {
        "flaky"
    }

    fn pull(
        &self,
        entity_ids: &[EntityId],
        category: &Category,
        limit: Option<usize>,
    ) -> Result<Vec<Fact>, SourceError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(SourceError::Transient("connection reset".into()));
        }
        self.inner.pull(entity_ids, category, limit)
    }
}

#[test]
fn bdd_scenario_transient_source_failure_is_retried() {
    // GIVEN a source that drops its first request and a 3-attempt policy
    let (ctx, mut store) = RunContext::in_memory(PipelineConfig::default());
    let ctx = ctx.with_retry(RetryPolicy::immediate(3));
    let facts = Arc::new(Flaky {
        calls: AtomicUsize::new(0),
        inner: StaticFactSource::new(facts_for("X")),
    });
    let prices = Arc::new(StaticObservationSource::new(prices_for("X")));

    // WHEN the pipeline runs
    let report = run_pipeline(&ctx, facts.clone(), prices, &[EntityId::new("X")]);

    // THEN the retry hides the failure
    assert_eq!(report.exit, ExitClass::Success);
    // quarterly (failed + retried) and annual
    assert_eq!(facts.calls.load(Ordering::SeqCst), 3);
    assert_eq!(counts(&mut store)[0], 18);
}

#[test]
fn bdd_scenario_pipeline_against_sqlite_is_idempotent() {
    // GIVEN a SQLite store with two connections
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("factlab.db");
    let mut config = PipelineConfig::default();
    config.store.path = path.clone();
    config.run.pool_size = 2;
    let entities = [EntityId::new("X"), EntityId::new("Y")];
    let mut all_facts = facts_for("X");
    all_facts.extend(facts_for("Y"));
    let mut all_prices = prices_for("X");
    all_prices.extend(prices_for("Y"));
    let facts = Arc::new(StaticFactSource::new(all_facts));
    let prices = Arc::new(StaticObservationSource::new(all_prices));

    // WHEN the pipeline runs twice
    for _ in 0..2 {
        let handles = SqliteStore::open_handles(&path, 2).unwrap();
        let ctx = RunContext::new(config.clone(), handles);
        let report = run_pipeline(&ctx, facts.clone(), prices.clone(), &entities);
        assert_eq!(report.exit, ExitClass::Success, "{report:#?}");
    }

    // THEN rows exist once per key
    let mut check = SqliteStore::open(&path).unwrap();
    assert_eq!(counts(&mut check), vec![36, 4, 2, 110, 48]);
    assert_eq!(check.row_count(TargetTable::RUN_LOG.name).unwrap(), 10);
}

#[test]
fn bdd_scenario_report_timestamps_bracket_the_run() {
    let (ctx, _store) = RunContext::in_memory(PipelineConfig::default());
    let before: DateTime<Utc> = Utc::now();
    let report = run_pipeline(
        &ctx,
        Arc::new(StaticFactSource::new(vec![])),
        Arc::new(StaticObservationSource::new(vec![])),
        &[EntityId::new("X")],
    );
    assert!(report.started_at >= before);
    assert!(report.finished_at >= report.started_at);
    assert_eq!(report.run_id.len(), 16);
}
