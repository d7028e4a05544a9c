use crate::types::{DagId, NodeId, PipelineId, RunId};
use thiserror::Error;

/// Structural problems found in a DAG definition before anything runs
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DagError {
    #[error("DAG has no nodes")]
    EmptyGraph,

    #[error("node id '{0}' appears more than once")]
    DuplicateNode(NodeId),

    #[error("dependency '{0}' does not match any node")]
    MissingDependency(NodeId),

    #[error("DAG contains a dependency cycle")]
    CycleDetected,
}

/// Why a single task ended in `failed` or `canceled`
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("no executor registered for task type '{0}'")]
    NoExecutorForType(String),

    #[error("task canceled")]
    Canceled,

    #[error("{0}")]
    Failed(String),

    #[error("executor panicked: {0}")]
    Panicked(String),
}

impl From<anyhow::Error> for TaskError {
    fn from(err: anyhow::Error) -> Self {
        Self::Failed(format!("{err:#}"))
    }
}

/// Errors from one `WorkflowEngine::execute_workflow` call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("task id '{0}' appears more than once")]
    DuplicateTask(NodeId),

    #[error("task '{task}' depends on unknown task '{dependency}'")]
    DependencyNotFound { task: NodeId, dependency: NodeId },

    #[error("workflow failed: {} task(s) failed ({})", .failed.len(), join_ids(.failed))]
    WorkflowFailed { failed: Vec<NodeId> },

    #[error("workflow canceled")]
    Canceled,

    #[error("tasks can never become ready ({})", join_ids(.0))]
    Unschedulable(Vec<NodeId>),
}

fn join_ids(ids: &[NodeId]) -> String {
    ids.iter().map(NodeId::as_str).collect::<Vec<_>>().join(", ")
}

/// Errors surfaced by the orchestration and DAG versioning services
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("pipeline {0} not found")]
    PipelineNotFound(PipelineId),

    #[error("pipeline {0} has no active DAG")]
    NoActiveDag(PipelineId),

    #[error("DAG {0} not found")]
    DagNotFound(DagId),

    #[error("run {0} not found")]
    RunNotFound(RunId),

    #[error("system busy: no execution slot became free in time")]
    SystemBusy,

    #[error("invalid DAG: {0}")]
    InvalidDag(#[from] DagError),

    #[error("storage error: {0:#}")]
    Store(#[from] anyhow::Error),
}

pub type ServiceResult<T> = std::result::Result<T, ServiceError>;
