use super::dag::validate;
use crate::clock::Clock;
use crate::error::{ServiceError, ServiceResult};
use crate::storage::DagStore;
use crate::types::{Dag, DagId, DagNode, PipelineId};
use std::sync::Arc;

/// Partial edit of a stored DAG; `None` leaves the field unchanged
#[derive(Debug, Clone, Default)]
pub struct DagUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub nodes: Option<Vec<DagNode>>,
    pub is_active: Option<bool>,
}

/// Per-pipeline DAG versions with at most one active version.
///
/// Every activation goes through [`DagStore::activate_dag`] or an active
/// [`DagStore::insert_dag`], both of which flip the active flag for the
/// whole pipeline in one atomic step.
pub struct DagVersionService {
    store: Arc<dyn DagStore>,
    clock: Arc<dyn Clock>,
}

impl DagVersionService {
    pub fn new(store: Arc<dyn DagStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Validate and store a DAG. A `version` of 0 gets the next free
    /// version of its pipeline.
    pub fn create(&self, mut dag: Dag) -> ServiceResult<Dag> {
        validate(&dag.nodes)?;

        let now = self.clock.now();
        dag.created_at = now;
        dag.updated_at = now;
        let stored = self.store.insert_dag(dag)?;

        tracing::info!(
            pipeline_id = %stored.pipeline_id,
            dag_id = %stored.id,
            version = stored.version,
            active = stored.is_active,
            "Created DAG version"
        );
        Ok(stored)
    }

    pub fn update(&self, id: &DagId, update: DagUpdate) -> ServiceResult<Dag> {
        let mut dag = self.get(id)?;

        if let Some(nodes) = update.nodes {
            validate(&nodes)?;
            dag.nodes = nodes;
        }
        if let Some(name) = update.name {
            dag.name = name;
        }
        if let Some(description) = update.description {
            dag.description = description;
        }
        dag.updated_at = self.clock.now();
        self.store.update_dag(&dag)?;

        match update.is_active {
            Some(true) => self.activate(id)?,
            Some(false) => {
                self.store.deactivate_dag(id)?;
            }
            None => {}
        }

        self.get(id)
    }

    /// Copy `source_id`'s nodes into a new inactive version numbered
    /// `max(existing) + 1`.
    pub fn create_version(&self, source_id: &DagId, creator: Option<String>) -> ServiceResult<Dag> {
        let source = self.get(source_id)?;
        let now = self.clock.now();

        let copy = Dag {
            id: DagId::new(),
            name: source.name.clone(),
            description: source.description.clone(),
            version: 0,
            pipeline_id: source.pipeline_id,
            nodes: source.nodes.clone(),
            is_active: false,
            creator,
            created_at: now,
            updated_at: now,
        };
        let stored = self.store.insert_dag(copy)?;

        tracing::info!(
            pipeline_id = %stored.pipeline_id,
            source = source.version,
            version = stored.version,
            "Created DAG version from existing"
        );
        Ok(stored)
    }

    pub fn activate(&self, id: &DagId) -> ServiceResult<()> {
        if !self.store.activate_dag(id)? {
            return Err(ServiceError::DagNotFound(*id));
        }
        tracing::info!(dag_id = %id, "Activated DAG version");
        Ok(())
    }

    pub fn delete(&self, id: &DagId) -> ServiceResult<()> {
        if !self.store.delete_dag(id)? {
            return Err(ServiceError::DagNotFound(*id));
        }
        tracing::info!(dag_id = %id, "Deleted DAG");
        Ok(())
    }

    pub fn get(&self, id: &DagId) -> ServiceResult<Dag> {
        self.store.get_dag(id)?.ok_or(ServiceError::DagNotFound(*id))
    }

    /// Every version of a pipeline, newest first
    pub fn history(&self, pipeline_id: &PipelineId) -> ServiceResult<Vec<Dag>> {
        Ok(self.store.list_dags(pipeline_id)?)
    }

    pub fn active(&self, pipeline_id: &PipelineId) -> ServiceResult<Dag> {
        self.store
            .active_dag(pipeline_id)?
            .ok_or(ServiceError::NoActiveDag(*pipeline_id))
    }
}
