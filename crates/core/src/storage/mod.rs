//! Persistence ports used by the orchestration and versioning services.
//!
//! Stores are synchronous and expected to be quick; services call them from
//! async code without spawning blocking tasks.

pub mod index;
pub mod memory;

pub use index::RedbIndexStore;
pub use memory::MemoryStore;

use crate::events::TaskUpdate;
use crate::types::{Dag, DagId, Pipeline, PipelineId, PipelineRun, PipelineStatus, RunId};
use anyhow::Result;
use chrono::{DateTime, Utc};

/// Pipeline records
pub trait PipelineStore: Send + Sync {
    fn put_pipeline(&self, pipeline: &Pipeline) -> Result<()>;

    fn get_pipeline(&self, id: &PipelineId) -> Result<Option<Pipeline>>;

    /// Set the pipeline's status; `last_run_at` is only written when `Some`
    fn update_pipeline_status(
        &self,
        id: &PipelineId,
        status: PipelineStatus,
        last_run_at: Option<DateTime<Utc>>,
    ) -> Result<()>;
}

/// DAG versions, with at most one active version per pipeline
pub trait DagStore: Send + Sync {
    /// Insert a DAG and return it as stored.
    ///
    /// A `version` of 0 is replaced with `max(existing) + 1` inside the
    /// same atomic step. If the DAG is active, every other version of its
    /// pipeline is deactivated in that step too.
    fn insert_dag(&self, dag: Dag) -> Result<Dag>;

    fn get_dag(&self, id: &DagId) -> Result<Option<Dag>>;

    /// All versions of a pipeline, newest first
    fn list_dags(&self, pipeline_id: &PipelineId) -> Result<Vec<Dag>>;

    fn active_dag(&self, pipeline_id: &PipelineId) -> Result<Option<Dag>>;

    /// Replace a stored DAG's content. Its active flag is left untouched;
    /// use [`DagStore::activate_dag`] to change which version is active.
    fn update_dag(&self, dag: &Dag) -> Result<()>;

    /// Make `id` the only active version of its pipeline in one atomic
    /// step. Returns `false` if the DAG does not exist.
    fn activate_dag(&self, id: &DagId) -> Result<bool>;

    /// Clear a DAG's active flag, leaving its pipeline with no active
    /// version. Returns `false` if the DAG does not exist.
    fn deactivate_dag(&self, id: &DagId) -> Result<bool>;

    /// Returns `false` if the DAG does not exist
    fn delete_dag(&self, id: &DagId) -> Result<bool>;
}

/// Pipeline run records and per-task progress
pub trait RunStore: Send + Sync {
    fn create_run(&self, run: &PipelineRun) -> Result<()>;

    fn get_run(&self, id: &RunId) -> Result<Option<PipelineRun>>;

    fn update_run(&self, run: &PipelineRun) -> Result<()>;

    /// Runs of a pipeline, most recent first
    fn list_runs(&self, pipeline_id: &PipelineId) -> Result<Vec<PipelineRun>>;

    fn record_task_update(&self, update: &TaskUpdate) -> Result<()>;

    /// Task updates of a run in the order they were recorded
    fn task_updates(&self, run_id: &RunId) -> Result<Vec<TaskUpdate>>;
}

/// Everything the orchestration service persists
pub trait Store: PipelineStore + DagStore + RunStore {}

impl<T: PipelineStore + DagStore + RunStore> Store for T {}

fn sort_newest_version_first(dags: &mut [Dag]) {
    dags.sort_by(|a, b| b.version.cmp(&a.version));
}

fn sort_most_recent_first(runs: &mut [PipelineRun]) {
    runs.sort_by(|a, b| b.start_time.cmp(&a.start_time));
}
