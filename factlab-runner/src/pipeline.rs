//! The daily pipeline graph.
//!
//! Entities are split into shards of `run.shard_size`. Each shard gets five
//! tasks:
//!
//! ```text
//! facts:{i} ──┬──> rollups:{i} ──┐
//!             ├──> ratios:{i}    ├──> market_metrics:{i}
//! prices:{i} ─┴──────────────────┘
//! ```
//!
//! Stages hand typed outputs downstream and write their own rows through the
//! idempotent loader, so a re-run over the same inputs leaves every target
//! table unchanged.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use factlab_core::composer::MetricComposer;
use factlab_core::domain::{Category, DerivedMetric, EntityId, Observation};
use factlab_core::quality::validate_fact;
use factlab_core::rollup::{MetricCatalog, RollupCalculator, RollupResult};
use factlab_core::source::{FactSource, ObservationSource};
use factlab_core::temporal::FactStore;
use tracing::{error, info, warn};

use crate::config::PipelineConfig;
use crate::context::RunContext;
use crate::graph::Task;
use crate::loader::{
    fact_rows, metric_row, observation_row, ratio_rows, rollup_row, run_log_rows,
    IdempotentLoader, TargetTable,
};
use crate::scheduler::{Inputs, RunReport, Scheduler, TaskError};
use crate::store::Row;

/// Typed hand-off between stages.
#[derive(Debug, Clone)]
pub enum StageOutput {
    Facts(FactStore),
    Observations(Vec<Observation>),
    Rollups(Vec<RollupResult>),
    Metrics(Vec<DerivedMetric>),
    /// Rows written by a terminal stage.
    Written(usize),
}

impl StageOutput {
    fn kind(&self) -> &'static str {
        match self {
            StageOutput::Facts(_) => "facts",
            StageOutput::Observations(_) => "observations",
            StageOutput::Rollups(_) => "rollups",
            StageOutput::Metrics(_) => "metrics",
            StageOutput::Written(_) => "written",
        }
    }
}

/// A stage that succeeded, possibly with data-quality issues worth reporting.
#[derive(Debug, Clone)]
pub enum StageOutcome {
    Complete(StageOutput),
    Partial {
        output: StageOutput,
        issues: Vec<String>,
    },
}

impl StageOutcome {
    fn with_issues(output: StageOutput, issues: Vec<String>) -> Self {
        if issues.is_empty() {
            StageOutcome::Complete(output)
        } else {
            StageOutcome::Partial { output, issues }
        }
    }

    pub fn output(&self) -> &StageOutput {
        match self {
            StageOutcome::Complete(output) | StageOutcome::Partial { output, .. } => output,
        }
    }

    pub fn issues(&self) -> &[String] {
        match self {
            StageOutcome::Complete(_) => &[],
            StageOutcome::Partial { issues, .. } => issues,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, StageOutcome::Complete(_))
    }
}

// ── Upstream accessors ───────────────────────────────────────────────

fn upstream<'a>(inputs: &Inputs<'a, StageOutcome>, task: &str) -> Result<&'a StageOutput, TaskError> {
    inputs
        .get(task)
        .map(StageOutcome::output)
        .ok_or_else(|| TaskError::failed(format!("missing upstream output '{task}'")))
}

fn mismatch(task: &str, expected: &str, got: &StageOutput) -> TaskError {
    TaskError::Integrity(format!(
        "upstream '{task}' produced {} where {expected} was expected",
        got.kind()
    ))
}

fn upstream_facts<'a>(inputs: &Inputs<'a, StageOutcome>, task: &str) -> Result<&'a FactStore, TaskError> {
    match upstream(inputs, task)? {
        StageOutput::Facts(store) => Ok(store),
        other => Err(mismatch(task, "facts", other)),
    }
}

fn upstream_observations<'a>(
    inputs: &Inputs<'a, StageOutcome>,
    task: &str,
) -> Result<&'a [Observation], TaskError> {
    match upstream(inputs, task)? {
        StageOutput::Observations(obs) => Ok(obs),
        other => Err(mismatch(task, "observations", other)),
    }
}

fn upstream_rollups<'a>(
    inputs: &Inputs<'a, StageOutcome>,
    task: &str,
) -> Result<&'a [RollupResult], TaskError> {
    match upstream(inputs, task)? {
        StageOutput::Rollups(rollups) => Ok(rollups),
        other => Err(mismatch(task, "rollups", other)),
    }
}

// ── Window helpers ───────────────────────────────────────────────────

/// Inclusive price window from `[run] prices_from / prices_to`.
pub fn price_window(config: &PipelineConfig) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = config
        .run
        .prices_from
        .map(|d| d.and_time(NaiveTime::MIN).and_utc())
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    let end = config
        .run
        .prices_to
        .and_then(end_of_day)
        .unwrap_or(DateTime::<Utc>::MAX_UTC);
    (start, end)
}

fn end_of_day(d: NaiveDate) -> Option<DateTime<Utc>> {
    d.and_hms_opt(23, 59, 59).map(|t| t.and_utc())
}

/// Entities the run covers: the configured universe, or `discovered` when
/// none is configured.
pub fn resolve_universe(config: &PipelineConfig, discovered: Vec<EntityId>) -> Vec<EntityId> {
    let mut out: Vec<EntityId> = if config.run.entities.is_empty() {
        discovered
    } else {
        config.run.entities.iter().map(EntityId::new).collect()
    };
    out.sort();
    out.dedup();
    out
}

// ── Graph assembly ───────────────────────────────────────────────────

/// Build the pipeline graph for `entities`. Nothing runs until the returned
/// scheduler is run.
pub fn build_pipeline(
    config: &PipelineConfig,
    facts: Arc<dyn FactSource>,
    prices: Arc<dyn ObservationSource>,
    entities: &[EntityId],
) -> Scheduler<StageOutcome> {
    let mut scheduler = Scheduler::new();
    let shard_size = config.run.shard_size.max(1);
    let calculator = RollupCalculator::new(config.window.clone(), MetricCatalog::default_financials());
    let composer = MetricComposer::default();
    let (start, end) = price_window(config);

    for (i, shard) in entities.chunks(shard_size).enumerate() {
        let shard: Vec<EntityId> = shard.to_vec();
        let facts_task = format!("facts:{i}");
        let prices_task = format!("prices:{i}");
        let rollups_task = format!("rollups:{i}");

        scheduler.register(
            ingest_facts_task(&facts_task, Arc::clone(&facts), shard.clone(), config.run.fact_limit)
                .with_params(&shard),
        );
        scheduler.register(
            ingest_prices_task(&prices_task, Arc::clone(&prices), shard.clone(), start, end)
                .with_params(&(&shard, start, end)),
        );
        scheduler.register(
            rollups_task_for(&rollups_task, &facts_task, shard.clone(), calculator.clone())
                .with_params(&(&shard, calculator.policy())),
        );
        scheduler.register(
            ratios_task(&format!("ratios:{i}"), &facts_task, composer.clone()).with_params(&shard),
        );
        scheduler.register(
            market_metrics_task(
                &format!("market_metrics:{i}"),
                &facts_task,
                &prices_task,
                &rollups_task,
                composer.clone(),
            )
            .with_params(&shard),
        );
    }

    info!(
        entities = entities.len(),
        shards = entities.len().div_ceil(shard_size),
        tasks = scheduler.len(),
        "pipeline assembled"
    );
    scheduler
}

fn loader_for(ctx: &RunContext) -> IdempotentLoader {
    IdempotentLoader::new(ctx.config.run.batch_size, ctx.retry.clone())
}

fn ingest_facts_task(
    name: &str,
    source: Arc<dyn FactSource>,
    shard: Vec<EntityId>,
    limit: Option<usize>,
) -> Task<StageOutcome> {
    Task::new(name, Vec::<String>::new(), move |env, _inputs| {
        let mut store = FactStore::new();
        for category in [Category::quarterly(), Category::annual()] {
            let op = format!("pull:{}:{category}", source.name());
            let pulled = env
                .ctx
                .retry
                .run(&op, |_| source.pull(&shard, &category, limit))
                .map_err(|e| TaskError::failed(format!("{}: {e}", source.name())))?;
            store.extend(pulled);
        }

        let mut issues = Vec::new();
        let mut rows: Vec<Row> = Vec::new();
        for fact in store.facts() {
            for warning in validate_fact(fact) {
                warning.log();
                issues.push(format!("{}: {}", warning.entity_id(), warning.kind()));
            }
            rows.extend(fact_rows(fact));
        }

        let written = loader_for(env.ctx).load(env.store(), TargetTable::FINANCIAL_FACTS, &rows)?;
        info!(task = env.task_name, facts = store.len(), rows = written, "facts ingested");
        Ok(StageOutcome::with_issues(StageOutput::Facts(store), issues))
    })
}

fn ingest_prices_task(
    name: &str,
    source: Arc<dyn ObservationSource>,
    shard: Vec<EntityId>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Task<StageOutcome> {
    Task::new(name, Vec::<String>::new(), move |env, _inputs| {
        let op = format!("observations:{}", source.name());
        let observations = env
            .ctx
            .retry
            .run(&op, |_| source.observations(&shard, start, end))
            .map_err(|e| TaskError::failed(format!("{}: {e}", source.name())))?;

        let rows: Vec<Row> = observations.iter().map(observation_row).collect();
        let written = loader_for(env.ctx).load(env.store(), TargetTable::DAILY_PRICES, &rows)?;
        info!(task = env.task_name, observations = observations.len(), rows = written, "prices ingested");
        Ok(StageOutcome::Complete(StageOutput::Observations(observations)))
    })
}

fn rollups_task_for(
    name: &str,
    facts_task: &str,
    shard: Vec<EntityId>,
    calculator: RollupCalculator,
) -> Task<StageOutcome> {
    let facts_task = facts_task.to_string();
    Task::new(name, [facts_task.clone()], move |env, inputs| {
        let store = upstream_facts(inputs, &facts_task)?;
        let quarterly = Category::quarterly();

        let mut results = Vec::new();
        let mut issues = Vec::new();
        for entity in &shard {
            let series = calculator.rollup_series(store, entity, &quarterly);
            for warning in &series.warnings {
                warning.log();
                issues.push(format!("{}: {}", warning.entity_id(), warning.kind()));
            }
            results.extend(series.results);
        }

        let rows = results
            .iter()
            .map(rollup_row)
            .collect::<Result<Vec<Row>, _>>()?;
        let written = loader_for(env.ctx).load(env.store(), TargetTable::ROLLUPS, &rows)?;
        info!(task = env.task_name, rollups = results.len(), rows = written, "rollups written");
        Ok(StageOutcome::with_issues(StageOutput::Rollups(results), issues))
    })
}

fn ratios_task(name: &str, facts_task: &str, composer: MetricComposer) -> Task<StageOutcome> {
    let facts_task = facts_task.to_string();
    Task::new(name, [facts_task.clone()], move |env, inputs| {
        let store = upstream_facts(inputs, &facts_task)?;
        let rows: Vec<Row> = store
            .facts()
            .flat_map(|fact| ratio_rows(&composer.fundamental_ratios(fact)))
            .collect();
        let written = loader_for(env.ctx).load(env.store(), TargetTable::FUNDAMENTAL_RATIOS, &rows)?;
        info!(task = env.task_name, rows = written, "fundamental ratios written");
        Ok(StageOutcome::Complete(StageOutput::Written(written)))
    })
}

fn market_metrics_task(
    name: &str,
    facts_task: &str,
    prices_task: &str,
    rollups_task: &str,
    composer: MetricComposer,
) -> Task<StageOutcome> {
    let (facts_task, prices_task, rollups_task) =
        (facts_task.to_string(), prices_task.to_string(), rollups_task.to_string());
    let deps = [facts_task.clone(), prices_task.clone(), rollups_task.clone()];
    Task::new(name, deps, move |env, inputs| {
        let store = upstream_facts(inputs, &facts_task)?;
        let observations = upstream_observations(inputs, &prices_task)?;
        let rollups = upstream_rollups(inputs, &rollups_task)?;

        let metrics = composer.market_metrics_for(store, rollups, observations);
        let rows: Vec<Row> = metrics.iter().map(metric_row).collect();
        let written = loader_for(env.ctx).load(env.store(), TargetTable::MARKET_METRICS, &rows)?;
        info!(task = env.task_name, metrics = metrics.len(), rows = written, "market metrics written");
        Ok(StageOutcome::Complete(StageOutput::Metrics(metrics)))
    })
}

// ── Entry point ──────────────────────────────────────────────────────

/// Build and run the pipeline, then append one run-log row per task.
/// A run-log write failure is logged and leaves the report untouched.
pub fn run_pipeline(
    ctx: &RunContext,
    facts: Arc<dyn FactSource>,
    prices: Arc<dyn ObservationSource>,
    entities: &[EntityId],
) -> RunReport {
    let scheduler = build_pipeline(&ctx.config, facts, prices, entities);
    let (report, outputs) = scheduler.run_collect(ctx, ctx.config.run.max_concurrency);

    for (task, outcome) in &outputs {
        if !outcome.is_complete() {
            warn!(task = %task, issues = outcome.issues().len(), "stage completed with data-quality issues");
        }
    }

    if let Err(e) = write_run_log(ctx, &report) {
        error!(run_id = %report.run_id, error = %e, "failed to write run log");
    }
    report
}

fn write_run_log(ctx: &RunContext, report: &RunReport) -> Result<usize, TaskError> {
    let rows = run_log_rows(report)?;
    let mut handle = ctx
        .pool
        .acquire()
        .map_err(|e| TaskError::failed(e.to_string()))?;
    let written = loader_for(ctx).load(&mut **handle, TargetTable::RUN_LOG, &rows)?;
    Ok(written)
}
