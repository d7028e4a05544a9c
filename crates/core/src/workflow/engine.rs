use super::task::{TaskStatus, WorkflowTask};
use super::task_executor::{ExecutorRegistry, TaskContext};
use crate::clock::Clock;
use crate::error::{EngineError, TaskError};
use crate::events::{TaskUpdate, UpdateSink};
use crate::types::{NodeId, RunId};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Dependency-driven scheduler for one run's task list.
///
/// Tasks without dependencies start immediately. Every completion triggers
/// a rescan of the still-pending tasks, and any task whose dependencies
/// have all succeeded is dispatched as its own tokio task. The first
/// failure cancels the run's token; executors observe it cooperatively.
pub struct WorkflowEngine {
    executors: Arc<ExecutorRegistry>,
    clock: Arc<dyn Clock>,
    // Track active runs for cancellation
    active_runs: Arc<Mutex<HashMap<RunId, CancellationToken>>>,
}

impl WorkflowEngine {
    pub fn new(executors: ExecutorRegistry, clock: Arc<dyn Clock>) -> Self {
        Self {
            executors: Arc::new(executors),
            clock,
            active_runs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Run `tasks` to completion.
    ///
    /// Returns once every dispatched task has finished. `tasks` is updated
    /// in place with final statuses, timestamps, logs and errors. Tasks
    /// never dispatched because the run was canceled end up `canceled`.
    /// Every status transition is queued on `updates` without waiting.
    pub async fn execute_workflow(
        &self,
        run_id: RunId,
        tasks: &mut Vec<WorkflowTask>,
        parent: &CancellationToken,
        updates: &UpdateSink,
    ) -> Result<(), EngineError> {
        let dependencies = resolve_dependencies(tasks)?;

        for task in tasks.iter_mut() {
            task.status = TaskStatus::Pending;
            task.start_time = None;
            task.end_time = None;
            task.logs.clear();
            task.error = None;
        }

        if tasks.is_empty() {
            return Ok(());
        }

        let token = parent.child_token();
        let _registration = self.register_run(run_id, token.clone());

        tracing::info!(run_id = %run_id, tasks = tasks.len(), "Starting workflow execution");

        let mut pending: Vec<Option<WorkflowTask>> =
            std::mem::take(tasks).into_iter().map(Some).collect();
        let mut finished: Vec<Option<WorkflowTask>> = vec![None; pending.len()];
        let mut succeeded: HashSet<usize> = HashSet::new();
        let mut failed: Vec<usize> = Vec::new();

        let mut units: JoinSet<(usize, WorkflowTask)> = JoinSet::new();
        // Snapshot of every dispatched task, dropped when its unit reports back
        let mut in_flight: HashMap<usize, WorkflowTask> = HashMap::new();

        for idx in 0..pending.len() {
            if token.is_cancelled() {
                break;
            }
            if dependencies[idx].is_empty() {
                self.dispatch(idx, &mut pending, &mut units, &mut in_flight, run_id, &token, updates);
            }
        }

        while let Some(joined) = units.join_next().await {
            let (idx, task) = match joined {
                Ok(done) => done,
                Err(join_err) => {
                    // The unit died without handing its task back; it is
                    // recovered from `in_flight` once all units are done.
                    tracing::error!(run_id = %run_id, error = %join_err, "Task unit aborted");
                    token.cancel();
                    continue;
                }
            };
            in_flight.remove(&idx);

            match task.status {
                TaskStatus::Success => {
                    succeeded.insert(idx);
                }
                TaskStatus::Failed => {
                    failed.push(idx);
                    if !token.is_cancelled() {
                        tracing::warn!(
                            run_id = %run_id,
                            task_id = %task.id,
                            "Task failed, canceling remaining tasks"
                        );
                        token.cancel();
                    }
                }
                _ => {}
            }
            finished[idx] = Some(task);

            if token.is_cancelled() {
                continue;
            }

            // Readiness rescan over everything not yet dispatched
            for next in 0..pending.len() {
                if pending[next].is_some() && dependencies[next].iter().all(|d| succeeded.contains(d)) {
                    self.dispatch(next, &mut pending, &mut units, &mut in_flight, run_id, &token, updates);
                }
            }
        }

        let mut lost: Vec<(usize, WorkflowTask)> = in_flight.into_iter().collect();
        lost.sort_by_key(|(idx, _)| *idx);
        for (idx, mut task) in lost {
            task.status = TaskStatus::Failed;
            task.end_time = Some(self.clock.now());
            task.error = Some(TaskError::Panicked(format!("unit for task '{}' did not complete", task.id)).to_string());
            notify(self.clock.as_ref(), updates, run_id, &task);
            failed.push(idx);
            finished[idx] = Some(task);
        }

        let mut never_ran: Vec<NodeId> = Vec::new();
        for (idx, slot) in pending.into_iter().enumerate() {
            if let Some(mut task) = slot {
                task.status = TaskStatus::Canceled;
                task.error = Some(TaskError::Canceled.to_string());
                notify(self.clock.as_ref(), updates, run_id, &task);
                never_ran.push(task.id.clone());
                finished[idx] = Some(task);
            }
        }

        let failed_ids: Vec<NodeId> = failed
            .iter()
            .filter_map(|&idx| finished[idx].as_ref().map(|t| t.id.clone()))
            .collect();
        *tasks = finished.into_iter().flatten().collect();

        if !failed_ids.is_empty() {
            tracing::error!(run_id = %run_id, failed = ?failed_ids, "Workflow execution failed");
            Err(EngineError::WorkflowFailed { failed: failed_ids })
        } else if token.is_cancelled() {
            tracing::warn!(run_id = %run_id, "Workflow execution canceled");
            Err(EngineError::Canceled)
        } else if !never_ran.is_empty() {
            tracing::error!(run_id = %run_id, tasks = ?never_ran, "Workflow has unschedulable tasks");
            Err(EngineError::Unschedulable(never_ran))
        } else {
            tracing::info!(run_id = %run_id, "Workflow execution completed");
            Ok(())
        }
    }

    /// Signal cancellation to a run this engine is executing.
    ///
    /// Returns `false` when the run is not tracked. Already-performed side
    /// effects are not undone.
    pub fn cancel_workflow(&self, run_id: RunId) -> bool {
        let active_runs = self.active_runs.lock().unwrap_or_else(|e| e.into_inner());
        match active_runs.get(&run_id) {
            Some(token) => {
                token.cancel();
                tracing::info!(run_id = %run_id, "Cancellation signal sent");
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, run_id: RunId) -> bool {
        self.active_runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&run_id)
    }

    fn register_run(&self, run_id: RunId, token: CancellationToken) -> RunRegistration {
        self.active_runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(run_id, token);
        RunRegistration {
            run_id,
            active_runs: self.active_runs.clone(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn dispatch(
        &self,
        idx: usize,
        pending: &mut [Option<WorkflowTask>],
        units: &mut JoinSet<(usize, WorkflowTask)>,
        in_flight: &mut HashMap<usize, WorkflowTask>,
        run_id: RunId,
        token: &CancellationToken,
        updates: &UpdateSink,
    ) {
        let Some(task) = pending[idx].take() else {
            return;
        };
        tracing::debug!(run_id = %run_id, task_id = %task.id, "Dispatching task");

        let snapshot = task.clone();
        let ctx = TaskContext {
            run_id,
            cancel: token.clone(),
        };
        let unit = run_task(
            self.executors.clone(),
            self.clock.clone(),
            updates.clone(),
            ctx,
            task,
        );
        units.spawn(async move { (idx, unit.await) });
        in_flight.insert(idx, snapshot);
    }
}

/// Removes a run from the active set when `execute_workflow` returns
struct RunRegistration {
    run_id: RunId,
    active_runs: Arc<Mutex<HashMap<RunId, CancellationToken>>>,
}

impl Drop for RunRegistration {
    fn drop(&mut self) {
        self.active_runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.run_id);
    }
}

/// Map each task's dependency ids to indices, rejecting duplicates and
/// references outside this task list.
fn resolve_dependencies(tasks: &[WorkflowTask]) -> Result<Vec<Vec<usize>>, EngineError> {
    let mut index: HashMap<&NodeId, usize> = HashMap::with_capacity(tasks.len());
    for (idx, task) in tasks.iter().enumerate() {
        if index.insert(&task.id, idx).is_some() {
            return Err(EngineError::DuplicateTask(task.id.clone()));
        }
    }

    tasks
        .iter()
        .map(|task| {
            task.dependencies
                .iter()
                .map(|dep| {
                    index
                        .get(dep)
                        .copied()
                        .ok_or_else(|| EngineError::DependencyNotFound {
                            task: task.id.clone(),
                            dependency: dep.clone(),
                        })
                })
                .collect()
        })
        .collect()
}

/// One task's unit of work: resolve its executor, run it, record the outcome
async fn run_task(
    executors: Arc<ExecutorRegistry>,
    clock: Arc<dyn Clock>,
    updates: UpdateSink,
    ctx: TaskContext,
    mut task: WorkflowTask,
) -> WorkflowTask {
    task.status = TaskStatus::Running;
    task.start_time = Some(clock.now());
    notify(clock.as_ref(), &updates, ctx.run_id, &task);

    let outcome = match executors.get(&task.task_type) {
        Ok(executor) => executor.execute(&ctx, &mut task).await,
        Err(e) => Err(e),
    };
    task.end_time = Some(clock.now());

    match outcome {
        Ok(()) => task.status = TaskStatus::Success,
        Err(TaskError::Canceled) if ctx.is_canceled() => {
            task.status = TaskStatus::Canceled;
            task.error = Some(TaskError::Canceled.to_string());
        }
        Err(e) => {
            tracing::warn!(run_id = %ctx.run_id, task_id = %task.id, error = %e, "Task failed");
            task.status = TaskStatus::Failed;
            task.error = Some(e.to_string());
        }
    }

    notify(clock.as_ref(), &updates, ctx.run_id, &task);
    task
}

fn notify(clock: &dyn Clock, updates: &UpdateSink, run_id: RunId, task: &WorkflowTask) {
    updates.send(TaskUpdate {
        run_id,
        task_id: task.id.clone(),
        status: task.status,
        logs: task.logs.clone(),
        error: task.error.clone(),
        timestamp: clock.now(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::events::{LoggingObserver, TaskObserver};
    use crate::workflow::task_executor::TaskExecutor;
    use std::time::Duration;
    use tokio::time::Instant;

    /// Records start/finish events and sleeps per-task before succeeding
    #[derive(Clone, Default)]
    struct RecordingExecutor {
        events: Arc<Mutex<Vec<String>>>,
        delays: Arc<HashMap<String, Duration>>,
    }

    impl RecordingExecutor {
        fn with_delays(delays: &[(&str, u64)]) -> Self {
            Self {
                events: Arc::default(),
                delays: Arc::new(
                    delays
                        .iter()
                        .map(|(id, ms)| (id.to_string(), Duration::from_millis(*ms)))
                        .collect(),
                ),
            }
        }

        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }

        fn position(&self, event: &str) -> usize {
            self.events()
                .iter()
                .position(|e| e == event)
                .unwrap_or_else(|| panic!("missing event {event}"))
        }
    }

    #[async_trait::async_trait]
    impl TaskExecutor for RecordingExecutor {
        async fn execute(&self, ctx: &TaskContext, task: &mut WorkflowTask) -> Result<(), TaskError> {
            self.events.lock().unwrap().push(format!("start:{}", task.id));
            let delay = self.delays.get(task.id.as_str()).copied().unwrap_or_default();
            ctx.sleep(delay).await?;
            task.log_line(format!("{} done", task.id));
            self.events.lock().unwrap().push(format!("finish:{}", task.id));
            Ok(())
        }
    }

    struct FailingExecutor;

    #[async_trait::async_trait]
    impl TaskExecutor for FailingExecutor {
        async fn execute(&self, _ctx: &TaskContext, task: &mut WorkflowTask) -> Result<(), TaskError> {
            task.log_line("exit code 1");
            Err(TaskError::Failed("exit code 1".to_string()))
        }
    }

    struct PanickingExecutor;

    #[async_trait::async_trait]
    impl TaskExecutor for PanickingExecutor {
        async fn execute(&self, _ctx: &TaskContext, _task: &mut WorkflowTask) -> Result<(), TaskError> {
            panic!("executor bug");
        }
    }

    /// Stalls on every update, then errors; execution must not care
    #[derive(Default)]
    struct StalledObserver {
        seen: Mutex<Vec<TaskUpdate>>,
    }

    #[async_trait::async_trait]
    impl TaskObserver for StalledObserver {
        async fn on_task_update(&self, update: &TaskUpdate) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            self.seen.lock().unwrap().push(update.clone());
            Err(anyhow::anyhow!("database unavailable"))
        }
    }

    struct FixedClock(chrono::DateTime<chrono::Utc>);

    impl Clock for FixedClock {
        fn now(&self) -> chrono::DateTime<chrono::Utc> {
            self.0
        }
    }

    fn engine(registry: ExecutorRegistry) -> WorkflowEngine {
        WorkflowEngine::new(registry, Arc::new(SystemClock))
    }

    fn task(id: &str, task_type: &str, deps: &[&str]) -> WorkflowTask {
        WorkflowTask::new(id, task_type).depends_on(deps.iter().copied())
    }

    fn status_of(tasks: &[WorkflowTask], id: &str) -> TaskStatus {
        tasks.iter().find(|t| t.id.as_str() == id).unwrap().status
    }

    async fn run(engine: &WorkflowEngine, tasks: &mut Vec<WorkflowTask>) -> Result<(), EngineError> {
        engine
            .execute_workflow(
                RunId::new(),
                tasks,
                &CancellationToken::new(),
                &UpdateSink::spawn(Arc::new(LoggingObserver)),
            )
            .await
    }

    #[tokio::test]
    async fn test_two_task_chain_succeeds() {
        let exec = RecordingExecutor::default();
        let engine = engine(ExecutorRegistry::new().register("shell", exec.clone()));
        let mut tasks = vec![task("a", "shell", &[]), task("b", "shell", &["a"])];

        run(&engine, &mut tasks).await.unwrap();

        assert_eq!(status_of(&tasks, "a"), TaskStatus::Success);
        assert_eq!(status_of(&tasks, "b"), TaskStatus::Success);
        assert!(tasks.iter().all(|t| t.start_time.is_some() && t.end_time.is_some()));
        assert_eq!(exec.events(), vec!["start:a", "finish:a", "start:b", "finish:b"]);
        assert_eq!(tasks[1].logs, "b done\n");
    }

    #[tokio::test(start_paused = true)]
    async fn test_diamond_respects_dependencies() {
        // a -> {b, c} -> d, with b much slower than c
        let exec = RecordingExecutor::with_delays(&[("a", 50), ("b", 300), ("c", 10), ("d", 5)]);
        let engine = engine(ExecutorRegistry::new().register("shell", exec.clone()));
        let mut tasks = vec![
            task("d", "shell", &["b", "c"]),
            task("c", "shell", &["a"]),
            task("b", "shell", &["a"]),
            task("a", "shell", &[]),
        ];

        run(&engine, &mut tasks).await.unwrap();

        let finish_a = exec.position("finish:a");
        assert!(exec.position("start:b") > finish_a);
        assert!(exec.position("start:c") > finish_a);
        let start_d = exec.position("start:d");
        assert!(start_d > exec.position("finish:b"));
        assert!(start_d > exec.position("finish:c"));
        // caller's order is preserved
        let ids: Vec<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["d", "c", "b", "a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_independent_branches_run_in_parallel() {
        let exec = RecordingExecutor::with_delays(&[("x", 1000), ("y", 1000), ("z", 1000)]);
        let engine = engine(ExecutorRegistry::new().register("shell", exec));
        let mut tasks = vec![
            task("x", "shell", &[]),
            task("y", "shell", &[]),
            task("z", "shell", &[]),
        ];

        let started = Instant::now();
        run(&engine, &mut tasks).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_cancels_in_flight_tasks() {
        let slow = RecordingExecutor::with_delays(&[("slow", 60_000)]);
        let engine = engine(
            ExecutorRegistry::new()
                .register("shell", slow)
                .register("broken", FailingExecutor),
        );
        let mut tasks = vec![
            task("slow", "shell", &[]),
            task("bad", "broken", &[]),
            task("after", "shell", &["slow"]),
        ];

        let started = Instant::now();
        let err = run(&engine, &mut tasks).await.unwrap_err();

        assert_eq!(err, EngineError::WorkflowFailed { failed: vec![NodeId::new("bad")] });
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(status_of(&tasks, "bad"), TaskStatus::Failed);
        assert_eq!(status_of(&tasks, "slow"), TaskStatus::Canceled);
        assert_eq!(status_of(&tasks, "after"), TaskStatus::Canceled);
        assert_eq!(tasks[1].logs, "exit code 1\n");
    }

    #[tokio::test]
    async fn test_missing_executor_fails_task_and_run() {
        let engine = engine(ExecutorRegistry::new().register("shell", RecordingExecutor::default()));
        let mut tasks = vec![task("a", "terraform", &[]), task("b", "shell", &["a"])];

        let err = run(&engine, &mut tasks).await.unwrap_err();

        assert!(matches!(err, EngineError::WorkflowFailed { .. }));
        assert_eq!(status_of(&tasks, "a"), TaskStatus::Failed);
        assert!(tasks[0].error.as_deref().unwrap().contains("terraform"));
        assert_eq!(status_of(&tasks, "b"), TaskStatus::Canceled);
    }

    #[tokio::test]
    async fn test_unknown_dependency_rejected_before_running() {
        let exec = RecordingExecutor::default();
        let engine = engine(ExecutorRegistry::new().register("shell", exec.clone()));
        let mut tasks = vec![task("a", "shell", &[]), task("b", "shell", &["nope"])];

        let err = run(&engine, &mut tasks).await.unwrap_err();

        assert_eq!(
            err,
            EngineError::DependencyNotFound {
                task: NodeId::new("b"),
                dependency: NodeId::new("nope"),
            }
        );
        assert!(exec.events().is_empty());
    }

    #[tokio::test]
    async fn test_cycle_is_unschedulable_not_hung() {
        let engine = engine(ExecutorRegistry::new().register("shell", RecordingExecutor::default()));
        let mut tasks = vec![task("a", "shell", &["b"]), task("b", "shell", &["a"])];

        let err = run(&engine, &mut tasks).await.unwrap_err();
        assert!(matches!(err, EngineError::Unschedulable(ids) if ids.len() == 2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_workflow_stops_run() {
        let exec = RecordingExecutor::with_delays(&[("a", 60_000)]);
        let engine = Arc::new(engine(ExecutorRegistry::new().register("shell", exec)));
        let run_id = RunId::new();
        let mut tasks = vec![task("a", "shell", &[]), task("b", "shell", &["a"])];

        let canceller = {
            let engine = engine.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                engine.cancel_workflow(run_id)
            })
        };

        let err = engine
            .execute_workflow(
                run_id,
                &mut tasks,
                &CancellationToken::new(),
                &UpdateSink::spawn(Arc::new(LoggingObserver)),
            )
            .await
            .unwrap_err();

        assert!(canceller.await.unwrap());
        assert_eq!(err, EngineError::Canceled);
        assert_eq!(status_of(&tasks, "a"), TaskStatus::Canceled);
        assert_eq!(status_of(&tasks, "b"), TaskStatus::Canceled);
        assert!(!engine.is_running(run_id));
        assert!(!engine.cancel_workflow(run_id));
    }

    #[tokio::test]
    async fn test_panicking_executor_is_contained() {
        let engine = engine(
            ExecutorRegistry::new()
                .register("shell", RecordingExecutor::default())
                .register("buggy", PanickingExecutor),
        );
        let mut tasks = vec![task("a", "buggy", &[]), task("b", "shell", &["a"])];

        let err = run(&engine, &mut tasks).await.unwrap_err();

        assert_eq!(err, EngineError::WorkflowFailed { failed: vec![NodeId::new("a")] });
        assert!(tasks[0].error.as_deref().unwrap().contains("panicked"));
        assert_eq!(status_of(&tasks, "b"), TaskStatus::Canceled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_observer_does_not_delay_execution() {
        let stamp = chrono::Utc::now() - chrono::Duration::days(1);
        let engine = WorkflowEngine::new(
            ExecutorRegistry::new().register("shell", RecordingExecutor::default()),
            Arc::new(FixedClock(stamp)),
        );
        let observer = Arc::new(StalledObserver::default());
        let mut tasks = vec![task("a", "shell", &[]), task("b", "shell", &["a"])];

        let started = Instant::now();
        engine
            .execute_workflow(
                RunId::new(),
                &mut tasks,
                &CancellationToken::new(),
                &UpdateSink::spawn(observer.clone()),
            )
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(status_of(&tasks, "b"), TaskStatus::Success);

        // the queue drains afterwards, in order, stamped by the engine's clock
        tokio::time::sleep(Duration::from_secs(60)).await;
        let seen = observer.seen.lock().unwrap();
        let order: Vec<(&str, TaskStatus)> = seen.iter().map(|u| (u.task_id.as_str(), u.status)).collect();
        assert_eq!(
            order,
            vec![
                ("a", TaskStatus::Running),
                ("a", TaskStatus::Success),
                ("b", TaskStatus::Running),
                ("b", TaskStatus::Success),
            ]
        );
        assert!(seen.iter().all(|u| u.timestamp == stamp));
    }

    #[tokio::test]
    async fn test_rerun_resets_previous_state() {
        let engine = engine(ExecutorRegistry::new().register("shell", RecordingExecutor::default()));
        let mut tasks = vec![task("a", "shell", &[])];

        run(&engine, &mut tasks).await.unwrap();
        run(&engine, &mut tasks).await.unwrap();

        assert_eq!(tasks[0].logs, "a done\n");
        assert_eq!(tasks[0].status, TaskStatus::Success);
    }

    #[tokio::test]
    async fn test_empty_task_list_is_ok() {
        let engine = engine(ExecutorRegistry::new());
        let mut tasks = Vec::new();
        run(&engine, &mut tasks).await.unwrap();
    }
}
