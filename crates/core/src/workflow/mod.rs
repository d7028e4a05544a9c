pub mod dag;
pub mod engine;
pub mod task;
pub mod task_executor;
pub mod versions;

pub use dag::validate;
pub use engine::WorkflowEngine;
pub use task::{tasks_from_nodes, TaskStatus, WorkflowTask};
pub use task_executor::{
    DockerExecutor, ExecutorRegistry, KubernetesExecutor, ShellExecutor, TaskContext, TaskExecutor,
};
pub use versions::{DagUpdate, DagVersionService};
