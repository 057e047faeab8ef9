//! FactLab Runner — scheduling, storage and the daily pipeline.
//!
//! This crate builds on `factlab-core` to provide:
//! - TOML pipeline configuration
//! - Task graph construction (dependency levels, cycle detection)
//! - Level-by-level scheduler with bounded concurrency and a stop signal
//! - Run context with a bounded pool of target-store handles
//! - Idempotent loader (validated, chunked, retried upserts)
//! - Target stores: shared in-memory tables and SQLite
//! - CSV fact and price sources
//! - Pipeline assembly per entity shard

pub mod config;
pub mod context;
pub mod graph;
pub mod loader;
pub mod pipeline;
pub mod scheduler;
pub mod sources;
pub mod store;

pub use config::{ConfigError, PipelineConfig};
pub use context::{HandlePool, PoolError, PooledHandle, RunContext, StopSignal, StoreHandle};
pub use graph::{GraphError, Task, TaskGraph};
pub use loader::{IdempotentLoader, LoadError, TargetTable};
pub use pipeline::{build_pipeline, run_pipeline, StageOutcome, StageOutput};
pub use scheduler::{
    ExitClass, Inputs, RunReport, Scheduler, TaskEnv, TaskError, TaskRecord, TaskStatus,
};
pub use sources::{CsvFactSource, CsvObservationSource};
pub use store::{MemoryStore, Row, SqliteStore, StoreError, TargetStore, Value};
