//! Task graph: validated tasks plus their dependency levels.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::scheduler::{Inputs, TaskEnv, TaskError};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("cycle detected among tasks: {}", tasks.join(" -> "))]
    CycleDetected { tasks: Vec<String> },

    #[error("duplicate task name '{0}'")]
    DuplicateTask(String),

    #[error("task '{task}' depends on unknown task '{dependency}'")]
    UnknownDependency { task: String, dependency: String },
}

/// Task body: dependency outputs in, own output out.
pub type TaskFn<O> =
    Box<dyn Fn(&mut TaskEnv<'_>, &Inputs<'_, O>) -> Result<O, TaskError> + Send + Sync>;

/// A named unit of work.
pub struct Task<O> {
    name: String,
    dependencies: BTreeSet<String>,
    idempotency_key: String,
    body: TaskFn<O>,
}

impl<O> fmt::Debug for Task<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("dependencies", &self.dependencies)
            .field("idempotency_key", &self.idempotency_key)
            .finish_non_exhaustive()
    }
}

impl<O> Task<O> {
    pub fn new<F>(
        name: impl Into<String>,
        dependencies: impl IntoIterator<Item = impl Into<String>>,
        body: F,
    ) -> Self
    where
        F: Fn(&mut TaskEnv<'_>, &Inputs<'_, O>) -> Result<O, TaskError> + Send + Sync + 'static,
    {
        let name = name.into();
        let dependencies: BTreeSet<String> = dependencies.into_iter().map(Into::into).collect();
        let idempotency_key = idempotency_key(&name, &dependencies, None);
        Self {
            name,
            dependencies,
            idempotency_key,
            body: Box::new(body),
        }
    }

    /// Fold caller parameters (e.g. the shard's entity list) into the key so
    /// two runs over different inputs never share one.
    pub fn with_params<P: Serialize>(mut self, params: &P) -> Self {
        let canonical = serde_json::to_string(params).ok();
        self.idempotency_key = idempotency_key(&self.name, &self.dependencies, canonical.as_deref());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dependencies(&self) -> &BTreeSet<String> {
        &self.dependencies
    }

    pub fn idempotency_key(&self) -> &str {
        &self.idempotency_key
    }

    pub(crate) fn call(&self, env: &mut TaskEnv<'_>, inputs: &Inputs<'_, O>) -> Result<O, TaskError> {
        (self.body)(env, inputs)
    }
}

/// BLAKE3 over the name, the sorted dependency names and optional
/// parameters, hex encoded.
pub fn idempotency_key(name: &str, dependencies: &BTreeSet<String>, params: Option<&str>) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(name.as_bytes());
    for dep in dependencies {
        hasher.update(b"\0");
        hasher.update(dep.as_bytes());
    }
    if let Some(p) = params {
        hasher.update(b"\x01");
        hasher.update(p.as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

/// Validated task set with its level partition.
pub struct TaskGraph<O> {
    tasks: BTreeMap<String, Task<O>>,
    levels: Vec<Vec<String>>,
}

impl<O> fmt::Debug for TaskGraph<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskGraph")
            .field("tasks", &self.tasks.len())
            .field("levels", &self.levels)
            .finish()
    }
}

impl<O> TaskGraph<O> {
    /// Validate and level. Level 0 holds tasks without dependencies; level k
    /// holds tasks whose dependencies all sit in levels below k, with at
    /// least one in level k-1. Each level is sorted by name.
    pub fn build(tasks: Vec<Task<O>>) -> Result<Self, GraphError> {
        let mut by_name: BTreeMap<String, Task<O>> = BTreeMap::new();
        for task in tasks {
            if by_name.contains_key(&task.name) {
                return Err(GraphError::DuplicateTask(task.name));
            }
            by_name.insert(task.name.clone(), task);
        }

        for task in by_name.values() {
            for dep in &task.dependencies {
                if dep == &task.name {
                    return Err(GraphError::CycleDetected {
                        tasks: vec![task.name.clone()],
                    });
                }
                if !by_name.contains_key(dep) {
                    return Err(GraphError::UnknownDependency {
                        task: task.name.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        let levels = level(&by_name)?;
        Ok(Self {
            tasks: by_name,
            levels,
        })
    }

    pub fn levels(&self) -> &[Vec<String>] {
        &self.levels
    }

    pub fn task(&self, name: &str) -> Option<&Task<O>> {
        self.tasks.get(name)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task<O>> {
        self.tasks.values()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Level index of every task.
    pub fn level_of(&self) -> BTreeMap<&str, usize> {
        self.levels
            .iter()
            .enumerate()
            .flat_map(|(i, names)| names.iter().map(move |n| (n.as_str(), i)))
            .collect()
    }
}

/// Layered Kahn's algorithm.
fn level<O>(tasks: &BTreeMap<String, Task<O>>) -> Result<Vec<Vec<String>>, GraphError> {
    let mut in_degree: BTreeMap<&str, usize> = tasks
        .iter()
        .map(|(name, t)| (name.as_str(), t.dependencies.len()))
        .collect();
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for (name, task) in tasks {
        for dep in &task.dependencies {
            dependents.entry(dep.as_str()).or_default().push(name.as_str());
        }
    }

    let mut levels: Vec<Vec<String>> = Vec::new();
    let mut current: Vec<&str> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(n, _)| *n)
        .collect();
    let mut placed = 0;

    while !current.is_empty() {
        current.sort_unstable();
        let mut next = Vec::new();
        for name in &current {
            for child in dependents.get(name).into_iter().flatten() {
                if let Some(d) = in_degree.get_mut(child) {
                    *d -= 1;
                    if *d == 0 {
                        next.push(*child);
                    }
                }
            }
        }
        placed += current.len();
        levels.push(current.iter().map(|s| s.to_string()).collect());
        current = next;
    }

    if placed < tasks.len() {
        return Err(GraphError::CycleDetected {
            tasks: find_cycle(tasks, &in_degree),
        });
    }
    Ok(levels)
}

/// Every unplaced task still has an unplaced dependency, so following the
/// smallest one from any unplaced task must revisit a task. The revisited
/// stretch is the cycle.
fn find_cycle<O>(tasks: &BTreeMap<String, Task<O>>, in_degree: &BTreeMap<&str, usize>) -> Vec<String> {
    let unplaced: BTreeSet<&str> = in_degree
        .iter()
        .filter(|(_, d)| **d > 0)
        .map(|(n, _)| *n)
        .collect();
    let Some(start) = unplaced.iter().next().copied() else {
        return Vec::new();
    };

    let mut path: Vec<&str> = Vec::new();
    let mut cursor = start;
    loop {
        if let Some(pos) = path.iter().position(|n| *n == cursor) {
            let mut cycle: Vec<String> = path[pos..].iter().map(|s| s.to_string()).collect();
            cycle.reverse();
            return cycle;
        }
        path.push(cursor);
        let next = tasks
            .get(cursor)
            .and_then(|t| t.dependencies.iter().find(|d| unplaced.contains(d.as_str())));
        match next {
            Some(dep) => cursor = dep.as_str(),
            None => return unplaced.iter().map(|s| s.to_string()).collect(),
        }
    }
}
