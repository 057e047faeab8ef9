//! Level-by-level task execution with bounded concurrency.
//!
//! One coordinating thread walks the levels. Each level's runnable tasks are
//! handed to a private rayon pool of `max_concurrency` threads, and the next
//! level starts only after every task of the current one is terminal.
//! Outputs flow along graph edges as shared references owned by the
//! coordinator, so sibling tasks never share mutable state.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Instant;

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::context::{PooledHandle, RunContext, StoreHandle};
use crate::graph::{GraphError, Task, TaskGraph};
use crate::store::TargetStore;

/// Failure raised by a task body.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("{0}")]
    Failed(String),

    /// Broken data invariant. Stops the run from dispatching anything else.
    #[error("integrity violation: {0}")]
    Integrity(String),
}

impl TaskError {
    pub fn failed(msg: impl Into<String>) -> Self {
        TaskError::Failed(msg.into())
    }
}

/// What a task body sees besides its inputs.
pub struct TaskEnv<'a> {
    pub ctx: &'a RunContext,
    pub task_name: &'a str,
    store: PooledHandle<'a, StoreHandle>,
}

impl TaskEnv<'_> {
    /// The store handle held for the duration of this task.
    pub fn store(&mut self) -> &mut dyn TargetStore {
        &mut **self.store
    }
}

/// Outputs of a task's declared dependencies.
pub struct Inputs<'a, O> {
    outputs: BTreeMap<&'a str, &'a O>,
}

impl<'a, O> Inputs<'a, O> {
    pub fn get(&self, task: &str) -> Option<&'a O> {
        self.outputs.get(task).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'a str, &'a O)> + '_ {
        self.outputs.iter().map(|(k, v)| (*k, *v))
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Succeeded,
    Failed,
    /// A dependency did not succeed; the body was never invoked.
    Blocked,
    /// Not dispatched because the stop signal was tripped.
    Cancelled,
    /// Graph construction failed before anything ran.
    NotRun,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub name: String,
    pub level: Option<usize>,
    pub idempotency_key: String,
    pub status: TaskStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocked_by: Vec<String>,
}

impl TaskRecord {
    fn pending<O>(task: &Task<O>, level: Option<usize>, status: TaskStatus) -> Self {
        Self {
            name: task.name().to_string(),
            level,
            idempotency_key: task.idempotency_key().to_string(),
            status,
            started_at: None,
            duration_ms: 0,
            error: None,
            blocked_by: Vec::new(),
        }
    }
}

/// Exit classification of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitClass {
    Success,
    Partial,
    Fatal,
}

impl ExitClass {
    pub fn code(self) -> i32 {
        match self {
            ExitClass::Success => 0,
            ExitClass::Partial => 1,
            ExitClass::Fatal => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub exit: ExitClass,
    pub levels: Vec<Vec<String>>,
    pub tasks: Vec<TaskRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunReport {
    pub fn task(&self, name: &str) -> Option<&TaskRecord> {
        self.tasks.iter().find(|t| t.name == name)
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|t| t.status == status).count()
    }

    pub fn exit_code(&self) -> i32 {
        self.exit.code()
    }

    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// Collects tasks, then builds and runs them as a graph.
pub struct Scheduler<O> {
    tasks: Vec<Task<O>>,
}

impl<O> Default for Scheduler<O> {
    fn default() -> Self {
        Self { tasks: Vec::new() }
    }
}

impl<O> Scheduler<O>
where
    O: Send + Sync,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_task<F>(
        &mut self,
        name: impl Into<String>,
        dependencies: impl IntoIterator<Item = impl Into<String>>,
        body: F,
    ) -> &mut Self
    where
        F: Fn(&mut TaskEnv<'_>, &Inputs<'_, O>) -> Result<O, TaskError> + Send + Sync + 'static,
    {
        self.tasks.push(Task::new(name, dependencies, body));
        self
    }

    /// Register a prebuilt task (e.g. one carrying parameters in its key).
    pub fn register(&mut self, task: Task<O>) -> &mut Self {
        self.tasks.push(task);
        self
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn build(self) -> Result<TaskGraph<O>, GraphError> {
        TaskGraph::build(self.tasks)
    }

    pub fn run(self, ctx: &RunContext, max_concurrency: usize) -> RunReport {
        self.run_collect(ctx, max_concurrency).0
    }

    /// Run and also return the outputs of every task that succeeded.
    pub fn run_collect(
        self,
        ctx: &RunContext,
        max_concurrency: usize,
    ) -> (RunReport, BTreeMap<String, O>) {
        let started_at = Utc::now();
        let run_id = run_id(started_at, &self.tasks);

        // Snapshot for the fatal report; the graph consumes the tasks.
        let registered: Vec<TaskRecord> = self
            .tasks
            .iter()
            .map(|t| TaskRecord::pending(t, None, TaskStatus::NotRun))
            .collect();

        let graph = match TaskGraph::build(self.tasks) {
            Ok(g) => g,
            Err(e) => {
                error!(run_id = %run_id, error = %e, "task graph rejected");
                return (fatal_report(run_id, started_at, registered, e.to_string()), BTreeMap::new());
            }
        };

        let threads = max_concurrency.max(1);
        let pool = match rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("factlab-worker-{i}"))
            .build()
        {
            Ok(p) => p,
            Err(e) => {
                error!(run_id = %run_id, error = %e, "failed to build worker pool");
                return (
                    fatal_report(run_id, started_at, registered, format!("worker pool: {e}")),
                    BTreeMap::new(),
                );
            }
        };

        info!(
            run_id = %run_id,
            tasks = graph.len(),
            levels = graph.levels().len(),
            max_concurrency = threads,
            "run started"
        );

        let mut records: BTreeMap<String, TaskRecord> = BTreeMap::new();
        let mut outputs: BTreeMap<String, O> = BTreeMap::new();

        for (level_idx, level) in graph.levels().iter().enumerate() {
            let mut runnable: Vec<&Task<O>> = Vec::with_capacity(level.len());
            for name in level {
                let Some(task) = graph.task(name) else { continue };
                let blocked_by: Vec<String> = task
                    .dependencies()
                    .iter()
                    .filter(|d| {
                        records
                            .get(d.as_str())
                            .map_or(true, |r| r.status != TaskStatus::Succeeded)
                    })
                    .cloned()
                    .collect();
                if blocked_by.is_empty() {
                    runnable.push(task);
                } else {
                    warn!(task = %name, blocked_by = ?blocked_by, "task blocked");
                    let mut record = TaskRecord::pending(task, Some(level_idx), TaskStatus::Blocked);
                    record.blocked_by = blocked_by;
                    records.insert(name.clone(), record);
                }
            }

            debug!(level = level_idx, runnable = runnable.len(), "dispatching level");
            let finished: Vec<(TaskRecord, Option<O>)> = pool.install(|| {
                runnable
                    .par_iter()
                    .map(|task| execute(task, level_idx, ctx, &outputs))
                    .collect()
            });

            for (record, output) in finished {
                if let Some(o) = output {
                    outputs.insert(record.name.clone(), o);
                }
                records.insert(record.name.clone(), record);
            }
        }

        let tasks: Vec<TaskRecord> = graph
            .levels()
            .iter()
            .flatten()
            .filter_map(|name| records.remove(name))
            .collect();
        let exit = classify(&tasks);
        let finished_at = Utc::now();

        info!(
            run_id = %run_id,
            exit = ?exit,
            succeeded = tasks.iter().filter(|t| t.status == TaskStatus::Succeeded).count(),
            failed = tasks.iter().filter(|t| t.status == TaskStatus::Failed).count(),
            blocked = tasks.iter().filter(|t| t.status == TaskStatus::Blocked).count(),
            cancelled = tasks.iter().filter(|t| t.status == TaskStatus::Cancelled).count(),
            elapsed_ms = (finished_at - started_at).num_milliseconds(),
            "run finished"
        );

        let report = RunReport {
            run_id,
            started_at,
            finished_at,
            exit,
            levels: graph.levels().to_vec(),
            tasks,
            error: None,
        };
        (report, outputs)
    }
}

fn execute<O>(
    task: &Task<O>,
    level: usize,
    ctx: &RunContext,
    outputs: &BTreeMap<String, O>,
) -> (TaskRecord, Option<O>) {
    let mut record = TaskRecord::pending(task, Some(level), TaskStatus::Cancelled);

    if ctx.stop.is_tripped() {
        info!(task = task.name(), "stop signal set, task not dispatched");
        return (record, None);
    }

    let store = match ctx.pool.acquire() {
        Ok(h) => h,
        Err(e) => {
            record.status = TaskStatus::Failed;
            record.error = Some(e.to_string());
            return (record, None);
        }
    };

    let inputs = Inputs {
        outputs: task
            .dependencies()
            .iter()
            .filter_map(|d| outputs.get_key_value(d.as_str()))
            .map(|(k, v)| (k.as_str(), v))
            .collect(),
    };
    let mut env = TaskEnv {
        ctx,
        task_name: task.name(),
        store,
    };

    record.started_at = Some(Utc::now());
    let clock = Instant::now();
    debug!(task = task.name(), level, "task started");

    let result = catch_unwind(AssertUnwindSafe(|| task.call(&mut env, &inputs)));
    // Hand the store back before reporting.
    drop(env);
    record.duration_ms = clock.elapsed().as_millis() as u64;

    match result {
        Ok(Ok(output)) => {
            record.status = TaskStatus::Succeeded;
            info!(task = task.name(), duration_ms = record.duration_ms, "task succeeded");
            (record, Some(output))
        }
        Ok(Err(e)) => {
            if matches!(e, TaskError::Integrity(_)) {
                error!(task = task.name(), error = %e, "integrity violation, stopping run");
                ctx.stop.trip();
            } else {
                warn!(task = task.name(), error = %e, "task failed");
            }
            record.status = TaskStatus::Failed;
            record.error = Some(e.to_string());
            (record, None)
        }
        Err(payload) => {
            let msg = panic_message(payload.as_ref());
            error!(task = task.name(), panic = %msg, "task panicked");
            record.status = TaskStatus::Failed;
            record.error = Some(format!("panicked: {msg}"));
            (record, None)
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Exit class of a run over a valid graph. All succeeded → success. An
/// integrity failure → fatal. Any other failed, blocked or cancelled task →
/// partial, even when nothing succeeded. Graph-build errors are classified
/// fatal separately, in [`fatal_report`].
fn classify(tasks: &[TaskRecord]) -> ExitClass {
    if tasks.iter().all(|t| t.status == TaskStatus::Succeeded) {
        return ExitClass::Success;
    }
    let integrity = tasks.iter().any(|t| {
        t.status == TaskStatus::Failed
            && t.error.as_deref().is_some_and(|e| e.starts_with("integrity violation"))
    });
    if integrity {
        ExitClass::Fatal
    } else {
        ExitClass::Partial
    }
}

fn fatal_report(
    run_id: String,
    started_at: DateTime<Utc>,
    tasks: Vec<TaskRecord>,
    error: String,
) -> RunReport {
    RunReport {
        run_id,
        started_at,
        finished_at: Utc::now(),
        exit: ExitClass::Fatal,
        levels: Vec::new(),
        tasks,
        error: Some(error),
    }
}

/// BLAKE3 of the start time and the task keys, shortened to 16 hex chars.
fn run_id<O>(started_at: DateTime<Utc>, tasks: &[Task<O>]) -> String {
    let mut keys: Vec<&str> = tasks.iter().map(|t| t.idempotency_key()).collect();
    keys.sort_unstable();
    let mut hasher = blake3::Hasher::new();
    hasher.update(started_at.to_rfc3339().as_bytes());
    for k in keys {
        hasher.update(k.as_bytes());
    }
    hasher.finalize().to_hex().as_str()[..16].to_string()
}
