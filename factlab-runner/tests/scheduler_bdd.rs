//! BDD tests for the task graph scheduler.
//!
//! - Dependency leveling
//! - Partial failure and blocked dependents
//! - Bounded concurrency
//! - Panics, integrity violations and the stop signal
//! - Cycle rejection

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use factlab_runner::{
    ExitClass, PipelineConfig, RunContext, Scheduler, TaskError, TaskStatus,
};

fn context() -> RunContext {
    RunContext::in_memory(PipelineConfig::default()).0
}

fn no_deps() -> Vec<String> {
    Vec::new()
}

/// Body that bumps `counter` and returns `value`.
fn counting(
    counter: &Arc<AtomicUsize>,
    value: i64,
) -> impl Fn(&mut factlab_runner::TaskEnv<'_>, &factlab_runner::Inputs<'_, i64>) -> Result<i64, TaskError>
       + Send
       + Sync
       + 'static {
    let counter = Arc::clone(counter);
    move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(value)
    }
}

#[test]
fn bdd_scenario_chain_and_independent_task_are_leveled() {
    // GIVEN A → B → C and an independent D
    let mut scheduler: Scheduler<i64> = Scheduler::new();
    scheduler
        .register_task("C", ["B"], |_, _| Ok(3))
        .register_task("A", no_deps(), |_, _| Ok(1))
        .register_task("D", no_deps(), |_, _| Ok(4))
        .register_task("B", ["A"], |_, _| Ok(2));

    // WHEN the graph runs
    let report = scheduler.run(&context(), 4);

    // THEN levels are [{A, D}], [{B}], [{C}] and everything succeeds
    assert_eq!(report.levels, vec![vec!["A", "D"], vec!["B"], vec!["C"]]);
    assert_eq!(report.exit, ExitClass::Success);
    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.count(TaskStatus::Succeeded), 4);
    assert_eq!(report.task("C").unwrap().level, Some(2));
}

#[test]
fn bdd_scenario_dependency_outputs_flow_downstream() {
    // GIVEN B summing the outputs of A and D
    let mut scheduler: Scheduler<i64> = Scheduler::new();
    scheduler
        .register_task("A", no_deps(), |_, _| Ok(10))
        .register_task("D", no_deps(), |_, _| Ok(5))
        .register_task("B", ["A", "D"], |_, inputs| {
            assert_eq!(inputs.len(), 2);
            Ok(inputs.iter().map(|(_, v)| *v).sum())
        });

    // WHEN the graph runs
    let (report, outputs) = scheduler.run_collect(&context(), 2);

    // THEN B sees both upstream values
    assert_eq!(report.exit, ExitClass::Success);
    assert_eq!(outputs["B"], 15);
}

#[test]
fn bdd_scenario_failed_task_blocks_dependents_only() {
    // GIVEN A → B → C, D independent, and A fails
    let b_calls = Arc::new(AtomicUsize::new(0));
    let c_calls = Arc::new(AtomicUsize::new(0));
    let d_calls = Arc::new(AtomicUsize::new(0));

    let mut scheduler: Scheduler<i64> = Scheduler::new();
    scheduler
        .register_task("A", no_deps(), |_, _| Err(TaskError::failed("source unavailable")))
        .register_task("B", ["A"], counting(&b_calls, 2))
        .register_task("C", ["B"], counting(&c_calls, 3))
        .register_task("D", no_deps(), counting(&d_calls, 4));

    // WHEN the graph runs
    let report = scheduler.run(&context(), 4);

    // THEN B and C are blocked and never invoked, D succeeds
    assert_eq!(report.task("A").unwrap().status, TaskStatus::Failed);
    assert_eq!(
        report.task("A").unwrap().error.as_deref(),
        Some("source unavailable")
    );
    assert_eq!(report.task("B").unwrap().status, TaskStatus::Blocked);
    assert_eq!(report.task("B").unwrap().blocked_by, vec!["A"]);
    assert_eq!(report.task("C").unwrap().status, TaskStatus::Blocked);
    assert_eq!(report.task("C").unwrap().blocked_by, vec!["B"]);
    assert_eq!(report.task("D").unwrap().status, TaskStatus::Succeeded);
    assert_eq!(b_calls.load(Ordering::SeqCst), 0);
    assert_eq!(c_calls.load(Ordering::SeqCst), 0);
    assert_eq!(d_calls.load(Ordering::SeqCst), 1);

    // AND the run is partial
    assert_eq!(report.exit, ExitClass::Partial);
    assert_eq!(report.exit_code(), 1);
}

#[test]
fn bdd_scenario_concurrency_never_exceeds_the_bound() {
    // GIVEN eight independent slow tasks
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let mut scheduler: Scheduler<i64> = Scheduler::new();
    for i in 0..8 {
        let in_flight = Arc::clone(&in_flight);
        let peak = Arc::clone(&peak);
        scheduler.register_task(format!("t{i}"), no_deps(), move |_, _| {
            let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(25));
            in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(i)
        });
    }

    // WHEN run with max_concurrency = 2
    let report = scheduler.run(&context(), 2);

    // THEN all succeed and no more than two ran at once
    assert_eq!(report.count(TaskStatus::Succeeded), 8);
    let peak = peak.load(Ordering::SeqCst);
    assert!(peak >= 1 && peak <= 2, "peak concurrency was {peak}");
}

#[test]
fn bdd_scenario_panicking_task_fails_and_releases_its_handle() {
    // GIVEN a task that panics next to one that succeeds
    let ctx = context();
    let mut scheduler: Scheduler<i64> = Scheduler::new();
    scheduler
        .register_task("boom", no_deps(), |_, _| panic!("bad row"))
        .register_task("fine", no_deps(), |_, _| Ok(1))
        .register_task("after", ["boom"], |_, _| Ok(2));

    // WHEN the graph runs
    let report = scheduler.run(&ctx, 2);

    // THEN the panic is reported as a failure
    let boom = report.task("boom").unwrap();
    assert_eq!(boom.status, TaskStatus::Failed);
    assert!(boom.error.as_deref().unwrap().contains("bad row"));
    assert_eq!(report.task("after").unwrap().status, TaskStatus::Blocked);
    assert_eq!(report.exit, ExitClass::Partial);

    // AND every store handle is back in the pool
    assert_eq!(ctx.pool.available(), ctx.pool.size());
}

#[test]
fn bdd_scenario_integrity_violation_cancels_undispatched_work() {
    // GIVEN level 0 with an integrity failure and an independent success,
    // and level 1 depending only on the success
    let later_calls = Arc::new(AtomicUsize::new(0));
    let ctx = context();
    let mut scheduler: Scheduler<i64> = Scheduler::new();
    scheduler
        .register_task("bad", no_deps(), |_, _| {
            // Let the sibling get dispatched before the stop trips.
            thread::sleep(Duration::from_millis(100));
            Err(TaskError::Integrity("conflicting rows".into()))
        })
        .register_task("good", no_deps(), |_, _| Ok(1))
        .register_task("later", ["good"], counting(&later_calls, 2));

    // WHEN the graph runs
    let report = scheduler.run(&ctx, 2);

    // THEN the stop signal is tripped and level 1 is cancelled
    assert!(ctx.stop.is_tripped());
    assert_eq!(report.task("bad").unwrap().status, TaskStatus::Failed);
    assert_eq!(report.task("good").unwrap().status, TaskStatus::Succeeded);
    assert_eq!(report.task("later").unwrap().status, TaskStatus::Cancelled);
    assert_eq!(later_calls.load(Ordering::SeqCst), 0);

    // AND the run is fatal
    assert_eq!(report.exit, ExitClass::Fatal);
    assert_eq!(report.exit_code(), 2);
}

#[test]
fn bdd_scenario_stop_signal_before_run_cancels_everything() {
    // GIVEN a tripped stop signal
    let ctx = context();
    ctx.stop.trip();
    let calls = Arc::new(AtomicUsize::new(0));
    let mut scheduler: Scheduler<i64> = Scheduler::new();
    scheduler
        .register_task("A", no_deps(), counting(&calls, 1))
        .register_task("B", ["A"], counting(&calls, 2));

    // WHEN the graph runs
    let report = scheduler.run(&ctx, 2);

    // THEN nothing is invoked
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(report.task("A").unwrap().status, TaskStatus::Cancelled);
    assert_ne!(report.task("B").unwrap().status, TaskStatus::Succeeded);

    // AND the graph was valid, so the run is partial rather than fatal
    assert_eq!(report.exit, ExitClass::Partial);
    assert_eq!(report.exit_code(), 1);
}

#[test]
fn bdd_scenario_failing_root_of_a_valid_graph_is_partial() {
    // GIVEN A → B where A fails
    let b_calls = Arc::new(AtomicUsize::new(0));
    let mut scheduler: Scheduler<i64> = Scheduler::new();
    scheduler
        .register_task("A", no_deps(), |_, _| Err(TaskError::failed("no data")))
        .register_task("B", ["A"], counting(&b_calls, 2));

    // WHEN the graph runs
    let report = scheduler.run(&context(), 2);

    // THEN nothing succeeded, yet the run is partial: the graph was valid
    assert_eq!(report.count(TaskStatus::Succeeded), 0);
    assert_eq!(report.task("A").unwrap().status, TaskStatus::Failed);
    assert_eq!(report.task("B").unwrap().status, TaskStatus::Blocked);
    assert_eq!(b_calls.load(Ordering::SeqCst), 0);
    assert_eq!(report.exit, ExitClass::Partial);
    assert_eq!(report.exit_code(), 1);
    assert!(report.error.is_none());
}

#[test]
fn bdd_scenario_cycle_is_fatal_before_anything_runs() {
    // GIVEN A → B → C → A
    let calls = Arc::new(AtomicUsize::new(0));
    let mut scheduler: Scheduler<i64> = Scheduler::new();
    scheduler
        .register_task("A", ["C"], counting(&calls, 1))
        .register_task("B", ["A"], counting(&calls, 2))
        .register_task("C", ["B"], counting(&calls, 3));

    // WHEN the graph runs
    let report = scheduler.run(&context(), 2);

    // THEN no task runs and the report names the cycle
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(report.exit, ExitClass::Fatal);
    assert_eq!(report.count(TaskStatus::NotRun), 3);
    let error = report.error.as_deref().unwrap();
    assert!(error.contains("cycle"), "unexpected error: {error}");

    // AND the report serializes
    let json = report.to_json_pretty().unwrap();
    assert!(json.contains("\"exit\": \"fatal\""));
}
