//! FactLab CLI — run the pipeline and inspect point-in-time data.
//!
//! Commands:
//! - `run` — full pipeline over CSV inputs into SQLite; prints the JSON run
//!   report and exits 0 (success), 1 (partial) or 2 (fatal)
//! - `rollup` — print the trailing rollup one entity had at an as-of time
//! - `resolve` — print the fact version visible at an as-of time

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use factlab_core::domain::{Category, EntityId};
use factlab_core::rollup::{MetricCatalog, RollupCalculator, RollupOutcome};
use factlab_core::temporal::{FactStore, Resolver};
use factlab_runner::sources::parse_timestamp;
use factlab_runner::{
    pipeline, run_pipeline, CsvFactSource, CsvObservationSource, PipelineConfig, RunContext,
    SqliteStore,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(
    name = "factlab",
    about = "FactLab CLI — point-in-time financial facts, rollups and ratios"
)]
struct Cli {
    /// Path to a TOML config file. Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daily pipeline over CSV inputs into SQLite.
    Run {
        /// Facts CSV (overrides `[inputs] facts`).
        #[arg(long)]
        facts: Option<PathBuf>,

        /// Prices CSV (overrides `[inputs] prices`).
        #[arg(long)]
        prices: Option<PathBuf>,

        /// SQLite database (overrides `[store] path`).
        #[arg(long)]
        db: Option<PathBuf>,

        /// Restrict the run to these entities.
        #[arg(long, num_args = 1..)]
        entities: Vec<String>,

        /// Worker threads per level (overrides `[run] max_concurrency`).
        #[arg(long)]
        max_concurrency: Option<usize>,
    },
    /// Print the trailing rollup for one entity as of a timestamp.
    Rollup {
        /// Facts CSV.
        #[arg(long)]
        facts: PathBuf,

        #[arg(long)]
        entity: String,

        /// RFC 3339 timestamp, `YYYY-MM-DD HH:MM:SS` or `YYYY-MM-DD`.
        #[arg(long)]
        as_of: String,

        #[arg(long, default_value = Category::QUARTERLY)]
        category: String,
    },
    /// Print the fact version visible at a timestamp.
    Resolve {
        /// Facts CSV.
        #[arg(long)]
        facts: PathBuf,

        #[arg(long)]
        entity: String,

        #[arg(long)]
        category: String,

        /// RFC 3339 timestamp, `YYYY-MM-DD HH:MM:SS` or `YYYY-MM-DD`.
        #[arg(long)]
        as_of: String,

        /// Resolve this fiscal period instead of the latest one (YYYY-MM-DD).
        #[arg(long)]
        period_end: Option<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    init_tracing(&config.logging.filter)?;

    match cli.command {
        Commands::Run {
            facts,
            prices,
            db,
            entities,
            max_concurrency,
        } => run_cmd(config, facts, prices, db, entities, max_concurrency),
        Commands::Rollup {
            facts,
            entity,
            as_of,
            category,
        } => rollup_cmd(&config, &facts, &entity, &as_of, &category),
        Commands::Resolve {
            facts,
            entity,
            category,
            as_of,
            period_end,
        } => resolve_cmd(&facts, &entity, &category, &as_of, period_end.as_deref()),
    }
}

fn load_config(path: Option<&Path>) -> Result<PipelineConfig> {
    match path {
        Some(p) => PipelineConfig::load(p)
            .with_context(|| format!("loading config {}", p.display())),
        None => Ok(PipelineConfig::default()),
    }
}

/// `FACTLAB_LOG` wins over `[logging] filter`. Logs go to stderr; stdout
/// carries JSON output.
fn init_tracing(config_filter: &str) -> Result<()> {
    let filter = match std::env::var("FACTLAB_LOG") {
        Ok(directive) => EnvFilter::try_new(directive).context("invalid FACTLAB_LOG")?,
        Err(_) => EnvFilter::try_new(config_filter).context("invalid [logging] filter")?,
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
    Ok(())
}

fn run_cmd(
    mut config: PipelineConfig,
    facts: Option<PathBuf>,
    prices: Option<PathBuf>,
    db: Option<PathBuf>,
    entities: Vec<String>,
    max_concurrency: Option<usize>,
) -> Result<()> {
    if let Some(p) = facts {
        config.inputs.facts = Some(p);
    }
    if let Some(p) = prices {
        config.inputs.prices = Some(p);
    }
    if let Some(p) = db {
        config.store.path = p;
    }
    if !entities.is_empty() {
        config.run.entities = entities;
    }
    if let Some(n) = max_concurrency {
        config.run.max_concurrency = n;
    }
    config.validate().context("invalid settings")?;

    let Some(facts_path) = config.inputs.facts.clone() else {
        bail!("no facts input: pass --facts or set [inputs] facts");
    };
    let fact_source = CsvFactSource::from_path(&facts_path)
        .with_context(|| format!("reading facts {}", facts_path.display()))?;
    let price_source = match &config.inputs.prices {
        Some(p) => CsvObservationSource::from_path(p)
            .with_context(|| format!("reading prices {}", p.display()))?,
        None => CsvObservationSource::from_reader("entity_id,timestamp,value\n".as_bytes(), "no prices")
            .context("building empty price source")?,
    };

    let universe = pipeline::resolve_universe(&config, fact_source.entities());
    let handles = SqliteStore::open_handles(&config.store.path, config.run.pool_size)
        .with_context(|| format!("opening store {}", config.store.path.display()))?;
    info!(
        entities = universe.len(),
        store = %config.store.path.display(),
        "starting pipeline"
    );

    let ctx = RunContext::new(config, handles);
    let report = run_pipeline(&ctx, Arc::new(fact_source), Arc::new(price_source), &universe);

    println!("{}", report.to_json_pretty().context("serializing run report")?);
    std::process::exit(report.exit_code());
}

fn load_store(facts: &Path) -> Result<FactStore> {
    let source = CsvFactSource::from_path(facts)
        .with_context(|| format!("reading facts {}", facts.display()))?;
    Ok(FactStore::from_facts(source.facts().iter().cloned()))
}

fn parse_as_of(raw: &str) -> Result<DateTime<Utc>> {
    parse_timestamp(raw).with_context(|| format!("invalid --as-of '{raw}'"))
}

fn rollup_cmd(
    config: &PipelineConfig,
    facts: &Path,
    entity: &str,
    as_of: &str,
    category: &str,
) -> Result<()> {
    let store = load_store(facts)?;
    let as_of = parse_as_of(as_of)?;
    let calculator = RollupCalculator::new(config.window.clone(), MetricCatalog::default_financials());

    match calculator.rollup(&store, &EntityId::new(entity), &Category::new(category), as_of) {
        RollupOutcome::Computed { result, warnings } => {
            for w in &warnings {
                w.log();
            }
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        RollupOutcome::Insufficient { available, required } => {
            bail!(
                "no complete {} window for {entity} at {as_of}: {available} of {required} periods visible",
                calculator.policy().name
            )
        }
    }
}

fn resolve_cmd(
    facts: &Path,
    entity: &str,
    category: &str,
    as_of: &str,
    period_end: Option<&str>,
) -> Result<()> {
    let store = load_store(facts)?;
    let as_of = parse_as_of(as_of)?;
    let resolver = Resolver::new(&store);
    let entity = EntityId::new(entity);
    let category = Category::new(category);

    let fact = match period_end {
        Some(raw) => {
            let period_end = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .with_context(|| format!("invalid --period-end '{raw}'"))?;
            resolver.resolve_period(&entity, &category, period_end, as_of)?
        }
        None => resolver.resolve(&entity, &category, as_of)?,
    };
    println!("{}", serde_json::to_string_pretty(fact)?);
    Ok(())
}
