use super::{sort_most_recent_first, sort_newest_version_first, DagStore, PipelineStore, RunStore};
use crate::events::TaskUpdate;
use crate::types::{Dag, DagId, Pipeline, PipelineId, PipelineRun, PipelineStatus, RunId};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// In-process store; every DAG mutation happens under a single lock
#[derive(Clone, Default)]
pub struct MemoryStore {
    pipelines: Arc<Mutex<HashMap<PipelineId, Pipeline>>>,
    dags: Arc<Mutex<HashMap<DagId, Dag>>>,
    runs: Arc<Mutex<HashMap<RunId, PipelineRun>>>,
    task_updates: Arc<Mutex<HashMap<RunId, Vec<TaskUpdate>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl PipelineStore for MemoryStore {
    fn put_pipeline(&self, pipeline: &Pipeline) -> Result<()> {
        lock(&self.pipelines).insert(pipeline.id, pipeline.clone());
        Ok(())
    }

    fn get_pipeline(&self, id: &PipelineId) -> Result<Option<Pipeline>> {
        Ok(lock(&self.pipelines).get(id).cloned())
    }

    fn update_pipeline_status(
        &self,
        id: &PipelineId,
        status: PipelineStatus,
        last_run_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut pipelines = lock(&self.pipelines);
        let pipeline = pipelines
            .get_mut(id)
            .ok_or_else(|| anyhow!("Pipeline {} not found", id))?;
        pipeline.status = status;
        if last_run_at.is_some() {
            pipeline.last_run_at = last_run_at;
        }
        Ok(())
    }
}

impl DagStore for MemoryStore {
    fn insert_dag(&self, mut dag: Dag) -> Result<Dag> {
        let mut dags = lock(&self.dags);
        if dags.contains_key(&dag.id) {
            return Err(anyhow!("DAG {} already exists", dag.id));
        }
        if dag.version == 0 {
            dag.version = dags
                .values()
                .filter(|d| d.pipeline_id == dag.pipeline_id)
                .map(|d| d.version)
                .max()
                .unwrap_or(0)
                + 1;
        }
        if dag.is_active {
            for other in dags.values_mut().filter(|d| d.pipeline_id == dag.pipeline_id) {
                other.is_active = false;
            }
        }
        dags.insert(dag.id, dag.clone());
        Ok(dag)
    }

    fn get_dag(&self, id: &DagId) -> Result<Option<Dag>> {
        Ok(lock(&self.dags).get(id).cloned())
    }

    fn list_dags(&self, pipeline_id: &PipelineId) -> Result<Vec<Dag>> {
        let mut dags: Vec<Dag> = lock(&self.dags)
            .values()
            .filter(|d| d.pipeline_id == *pipeline_id)
            .cloned()
            .collect();
        sort_newest_version_first(&mut dags);
        Ok(dags)
    }

    fn active_dag(&self, pipeline_id: &PipelineId) -> Result<Option<Dag>> {
        Ok(lock(&self.dags)
            .values()
            .find(|d| d.pipeline_id == *pipeline_id && d.is_active)
            .cloned())
    }

    fn update_dag(&self, dag: &Dag) -> Result<()> {
        let mut dags = lock(&self.dags);
        let stored = dags
            .get_mut(&dag.id)
            .ok_or_else(|| anyhow!("DAG {} not found", dag.id))?;
        let is_active = stored.is_active;
        *stored = dag.clone();
        stored.is_active = is_active;
        Ok(())
    }

    fn activate_dag(&self, id: &DagId) -> Result<bool> {
        let mut dags = lock(&self.dags);
        let Some(pipeline_id) = dags.get(id).map(|d| d.pipeline_id) else {
            return Ok(false);
        };
        for dag in dags.values_mut().filter(|d| d.pipeline_id == pipeline_id) {
            dag.is_active = dag.id == *id;
        }
        Ok(true)
    }

    fn deactivate_dag(&self, id: &DagId) -> Result<bool> {
        match lock(&self.dags).get_mut(id) {
            Some(dag) => {
                dag.is_active = false;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn delete_dag(&self, id: &DagId) -> Result<bool> {
        Ok(lock(&self.dags).remove(id).is_some())
    }
}

impl RunStore for MemoryStore {
    fn create_run(&self, run: &PipelineRun) -> Result<()> {
        let mut runs = lock(&self.runs);
        if runs.contains_key(&run.id) {
            return Err(anyhow!("Run {} already exists", run.id));
        }
        runs.insert(run.id, run.clone());
        Ok(())
    }

    fn get_run(&self, id: &RunId) -> Result<Option<PipelineRun>> {
        Ok(lock(&self.runs).get(id).cloned())
    }

    fn update_run(&self, run: &PipelineRun) -> Result<()> {
        let mut runs = lock(&self.runs);
        let stored = runs
            .get_mut(&run.id)
            .ok_or_else(|| anyhow!("Run {} not found", run.id))?;
        *stored = run.clone();
        Ok(())
    }

    fn list_runs(&self, pipeline_id: &PipelineId) -> Result<Vec<PipelineRun>> {
        let mut runs: Vec<PipelineRun> = lock(&self.runs)
            .values()
            .filter(|r| r.pipeline_id == *pipeline_id)
            .cloned()
            .collect();
        sort_most_recent_first(&mut runs);
        Ok(runs)
    }

    fn record_task_update(&self, update: &TaskUpdate) -> Result<()> {
        lock(&self.task_updates)
            .entry(update.run_id)
            .or_default()
            .push(update.clone());
        Ok(())
    }

    fn task_updates(&self, run_id: &RunId) -> Result<Vec<TaskUpdate>> {
        Ok(lock(&self.task_updates)
            .get(run_id)
            .cloned()
            .unwrap_or_default())
    }
}
