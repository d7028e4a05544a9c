//! Run orchestration on top of the workflow engine.
//!
//! `WorkflowService` turns a pipeline's active DAG into a run: it gates
//! admission with a counting semaphore, executes the DAG on the engine in
//! a background tokio task, retries failed attempts with linear backoff
//! under one shared deadline, and writes the run's final record.

use crate::clock::Clock;
use crate::error::{EngineError, ServiceError, ServiceResult};
use crate::events::{TaskObserver, TaskUpdate, UpdateSink};
use crate::policy::ExecutionPolicy;
use crate::storage::Store;
use crate::types::{Dag, NodeId, PipelineId, PipelineRun, PipelineStatus, RunId, RunStatus};
use crate::workflow::dag::validate;
use crate::workflow::engine::WorkflowEngine;
use crate::workflow::task::{tasks_from_nodes, TaskStatus, WorkflowTask};
use anyhow::Context;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct WorkflowService {
    engine: Arc<WorkflowEngine>,
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    policy: ExecutionPolicy,
    slots: Arc<Semaphore>,
    // Cancellation tokens of runs whose background task is still alive
    runs: Arc<Mutex<HashMap<RunId, CancellationToken>>>,
    // Serialises read-modify-write of run status between cancel and finalise
    status_lock: Arc<Mutex<()>>,
}

/// How the retry loop ended
struct RunOutcome {
    result: Result<(), EngineError>,
    attempts: u32,
    tasks: Vec<WorkflowTask>,
}

impl WorkflowService {
    pub fn new(
        engine: Arc<WorkflowEngine>,
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        policy: ExecutionPolicy,
    ) -> Self {
        Self {
            engine,
            store,
            clock,
            slots: Arc::new(Semaphore::new(policy.max_concurrent_runs)),
            policy,
            runs: Arc::new(Mutex::new(HashMap::new())),
            status_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Start a run of the pipeline's active DAG.
    ///
    /// Returns the `pending` run as soon as it is admitted; execution
    /// continues in the background. Waits at most `admission_wait` for an
    /// execution slot and fails with [`ServiceError::SystemBusy`] without
    /// creating a run if none frees up. An empty `branch` falls back to the
    /// pipeline's branch.
    pub async fn trigger_workflow(
        &self,
        pipeline_id: &PipelineId,
        user_id: &str,
        branch: &str,
    ) -> ServiceResult<PipelineRun> {
        let pipeline = self
            .store
            .get_pipeline(pipeline_id)?
            .ok_or(ServiceError::PipelineNotFound(*pipeline_id))?;
        let dag = self
            .store
            .active_dag(pipeline_id)?
            .ok_or(ServiceError::NoActiveDag(*pipeline_id))?;
        validate(&dag.nodes)?;

        let permit = match tokio::time::timeout(
            self.policy.admission_wait,
            self.slots.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            _ => {
                tracing::warn!(
                    pipeline_id = %pipeline_id,
                    wait_secs = self.policy.admission_wait.as_secs_f64(),
                    "No execution slot available"
                );
                return Err(ServiceError::SystemBusy);
            }
        };

        let now = self.clock.now();
        let run = PipelineRun {
            id: RunId::new(),
            pipeline_id: *pipeline_id,
            dag_id: dag.id,
            dag_version: dag.version,
            status: RunStatus::Pending,
            start_time: Some(now),
            end_time: None,
            duration_secs: 0,
            branch: if branch.is_empty() {
                pipeline.branch.clone()
            } else {
                branch.to_string()
            },
            triggered_by: user_id.to_string(),
            logs: String::new(),
        };
        self.store.create_run(&run)?;
        if let Err(e) = self
            .store
            .update_pipeline_status(pipeline_id, PipelineStatus::Running, Some(now))
        {
            tracing::warn!(pipeline_id = %pipeline_id, error = %e, "Failed to mark pipeline running");
        }

        let token = CancellationToken::new();
        lock(&self.runs).insert(run.id, token.clone());

        tracing::info!(
            run_id = %run.id,
            pipeline_id = %pipeline_id,
            dag_version = dag.version,
            triggered_by = %user_id,
            "Run admitted"
        );

        tokio::spawn(self.clone().drive(run.clone(), dag, token, permit));
        Ok(run)
    }

    /// Cancel a pending or running run. Finished runs are left untouched.
    pub fn cancel_workflow(&self, run_id: &RunId) -> ServiceResult<()> {
        let _guard = lock(&self.status_lock);
        let mut run = self
            .store
            .get_run(run_id)?
            .ok_or(ServiceError::RunNotFound(*run_id))?;
        if run.status.is_terminal() {
            return Ok(());
        }

        self.engine.cancel_workflow(*run_id);
        if let Some(token) = lock(&self.runs).get(run_id) {
            token.cancel();
        }

        let now = self.clock.now();
        run.status = RunStatus::Canceled;
        run.end_time = Some(now);
        run.duration_secs = run.start_time.map(|s| (now - s).num_seconds()).unwrap_or(0);
        self.store.update_run(&run)?;
        if let Err(e) = self
            .store
            .update_pipeline_status(&run.pipeline_id, PipelineStatus::Canceled, None)
        {
            tracing::warn!(run_id = %run_id, error = %e, "Failed to update pipeline status");
        }

        tracing::info!(run_id = %run_id, "Run canceled");
        Ok(())
    }

    pub fn get_run(&self, run_id: &RunId) -> ServiceResult<PipelineRun> {
        self.store
            .get_run(run_id)?
            .ok_or(ServiceError::RunNotFound(*run_id))
    }

    /// Runs of a pipeline, most recent first
    pub fn list_runs(&self, pipeline_id: &PipelineId) -> ServiceResult<Vec<PipelineRun>> {
        Ok(self.store.list_runs(pipeline_id)?)
    }

    /// Recorded task transitions of a run, oldest first
    pub fn task_updates(&self, run_id: &RunId) -> ServiceResult<Vec<TaskUpdate>> {
        Ok(self.store.task_updates(run_id)?)
    }

    /// Whether the run's background task is still alive
    pub fn is_running(&self, run_id: &RunId) -> bool {
        lock(&self.runs).contains_key(run_id)
    }

    /// Free execution slots right now
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    /// Background half of a run. Owns the admission permit, so the slot is
    /// returned however this future ends.
    async fn drive(
        self,
        run: PipelineRun,
        dag: Dag,
        token: CancellationToken,
        _permit: OwnedSemaphorePermit,
    ) {
        let _tracked = TrackedRun {
            run_id: run.id,
            runs: self.runs.clone(),
        };
        self.mark_running(&run.id);

        let timed_out = Arc::new(AtomicBool::new(false));
        let watchdog = tokio::spawn({
            let token = token.clone();
            let timed_out = timed_out.clone();
            let limit = self.policy.run_timeout;
            async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = tokio::time::sleep(limit) => {
                        timed_out.store(true, Ordering::SeqCst);
                        token.cancel();
                    }
                }
            }
        });

        let outcome = self.run_attempts(run.id, &dag, &token).await;
        watchdog.abort();

        self.finalize(run, outcome, timed_out.load(Ordering::SeqCst));
    }

    async fn run_attempts(&self, run_id: RunId, dag: &Dag, token: &CancellationToken) -> RunOutcome {
        // One sink for all attempts keeps the run's updates in order
        let updates = UpdateSink::spawn(Arc::new(StoreObserver {
            store: self.store.clone(),
        }));
        // Tasks that succeeded in an earlier attempt, when they are carried over
        let mut carried: Vec<WorkflowTask> = Vec::new();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let mut tasks = tasks_for_attempt(dag, &carried);
            tracing::info!(run_id = %run_id, attempt, tasks = tasks.len(), "Starting run attempt");

            let result = self
                .engine
                .execute_workflow(run_id, &mut tasks, token, &updates)
                .await;

            let retryable = matches!(result, Err(EngineError::WorkflowFailed { .. }));
            if !retryable || token.is_cancelled() || attempt >= self.policy.max_attempts {
                carried.extend(tasks);
                return RunOutcome {
                    result,
                    attempts: attempt,
                    tasks: in_node_order(dag, carried),
                };
            }

            let delay = self.policy.backoff_after(attempt);
            tracing::warn!(
                run_id = %run_id,
                attempt,
                delay_secs = delay.as_secs_f64(),
                error = ?result.as_ref().err(),
                "Run attempt failed, retrying"
            );

            if self.policy.skip_succeeded_on_retry {
                carried.extend(tasks.into_iter().filter(|t| t.status == TaskStatus::Success));
            }

            tokio::select! {
                _ = token.cancelled() => {
                    return RunOutcome {
                        result: Err(EngineError::Canceled),
                        attempts: attempt,
                        tasks: in_node_order(dag, carried),
                    };
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn mark_running(&self, run_id: &RunId) {
        let _guard = lock(&self.status_lock);
        let result = self.store.get_run(run_id).and_then(|stored| match stored {
            Some(mut run) if run.status == RunStatus::Pending => {
                run.status = RunStatus::Running;
                self.store.update_run(&run)
            }
            _ => Ok(()),
        });
        if let Err(e) = result {
            tracing::warn!(run_id = %run_id, error = %e, "Failed to mark run running");
        }
    }

    fn finalize(&self, run: PipelineRun, outcome: RunOutcome, timed_out: bool) {
        let logs = aggregate_logs(outcome.attempts, &outcome.tasks);
        let _guard = lock(&self.status_lock);

        let mut record = match self.store.get_run(&run.id) {
            Ok(Some(stored)) => stored,
            Ok(None) => run,
            Err(e) => {
                tracing::error!(run_id = %run.id, error = %e, "Failed to load run for finalisation");
                run
            }
        };
        record.logs = logs;

        if record.status != RunStatus::Canceled {
            record.status = match &outcome.result {
                Ok(()) => RunStatus::Success,
                Err(_) if timed_out => RunStatus::Failed,
                Err(EngineError::Canceled) => RunStatus::Canceled,
                Err(_) => RunStatus::Failed,
            };
            let now = self.clock.now();
            record.end_time = Some(now);
            record.duration_secs = record
                .start_time
                .map(|s| (now - s).num_seconds())
                .unwrap_or(0);
        }

        match &outcome.result {
            Ok(()) => tracing::info!(run_id = %record.id, attempts = outcome.attempts, "Run succeeded"),
            Err(e) if timed_out => tracing::error!(
                run_id = %record.id,
                timeout_secs = self.policy.run_timeout.as_secs(),
                error = %e,
                "Run timed out"
            ),
            Err(e) => tracing::warn!(
                run_id = %record.id,
                attempts = outcome.attempts,
                status = %record.status,
                error = %e,
                "Run did not succeed"
            ),
        }

        if let Err(e) = self.store.update_run(&record) {
            tracing::error!(run_id = %record.id, error = %e, "Failed to persist run result");
        }
        if let Err(e) = self.store.update_pipeline_status(
            &record.pipeline_id,
            PipelineStatus::from(record.status),
            None,
        ) {
            tracing::warn!(run_id = %record.id, error = %e, "Failed to update pipeline status");
        }
    }
}

/// Removes a run from the service's live set when its background task ends
struct TrackedRun {
    run_id: RunId,
    runs: Arc<Mutex<HashMap<RunId, CancellationToken>>>,
}

impl Drop for TrackedRun {
    fn drop(&mut self) {
        lock(&self.runs).remove(&self.run_id);
    }
}

/// Persists every task transition off the async worker threads
struct StoreObserver {
    store: Arc<dyn Store>,
}

#[async_trait::async_trait]
impl TaskObserver for StoreObserver {
    async fn on_task_update(&self, update: &TaskUpdate) -> anyhow::Result<()> {
        tracing::debug!(
            run_id = %update.run_id,
            task_id = %update.task_id,
            status = %update.status,
            "Recording task update"
        );
        let store = self.store.clone();
        let update = update.clone();
        tokio::task::spawn_blocking(move || store.record_task_update(&update))
            .await
            .context("Task update writer panicked")?
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Tasks for the next attempt: every node except those carried over, with
/// dependencies on carried (already succeeded) tasks dropped.
fn tasks_for_attempt(dag: &Dag, carried: &[WorkflowTask]) -> Vec<WorkflowTask> {
    let done: HashSet<&NodeId> = carried.iter().map(|t| &t.id).collect();
    tasks_from_nodes(&dag.nodes)
        .into_iter()
        .filter(|t| !done.contains(&t.id))
        .map(|mut t| {
            t.dependencies.retain(|d| !done.contains(d));
            t
        })
        .collect()
}

fn in_node_order(dag: &Dag, tasks: Vec<WorkflowTask>) -> Vec<WorkflowTask> {
    let mut by_id: HashMap<NodeId, WorkflowTask> =
        tasks.into_iter().map(|t| (t.id.clone(), t)).collect();
    dag.nodes.iter().filter_map(|n| by_id.remove(&n.id)).collect()
}

/// Run log document: attempt count plus each task's final state
fn aggregate_logs(attempts: u32, tasks: &[WorkflowTask]) -> String {
    let tasks: serde_json::Map<String, serde_json::Value> = tasks
        .iter()
        .map(|t| {
            (
                t.id.to_string(),
                json!({
                    "type": t.task_type,
                    "status": t.status,
                    "logs": t.logs,
                    "error": t.error,
                }),
            )
        })
        .collect();
    json!({ "attempts": attempts, "tasks": tasks }).to_string()
}
