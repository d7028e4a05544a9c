use crate::types::{DagNode, NodeId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of a task inside one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Failed,
    Canceled,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        };
        f.write_str(s)
    }
}

/// Run-scoped task derived from a [`DagNode`].
///
/// Only the execution unit running the task mutates it; the engine hands
/// it back once that unit is done.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowTask {
    pub id: NodeId,
    pub name: String,
    pub task_type: String,
    pub config: serde_json::Map<String, serde_json::Value>,
    pub dependencies: Vec<NodeId>,
    pub status: TaskStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub logs: String,
    pub error: Option<String>,
}

impl WorkflowTask {
    pub fn new(id: impl Into<String>, task_type: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id: NodeId(id),
            task_type: task_type.into(),
            config: serde_json::Map::new(),
            dependencies: Vec::new(),
            status: TaskStatus::Pending,
            start_time: None,
            end_time: None,
            logs: String::new(),
            error: None,
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies
            .extend(deps.into_iter().map(|d| NodeId(d.into())));
        self
    }

    /// Append a line to the task log
    pub fn log_line(&mut self, line: impl AsRef<str>) {
        self.logs.push_str(line.as_ref());
        self.logs.push('\n');
    }
}

impl From<&DagNode> for WorkflowTask {
    fn from(node: &DagNode) -> Self {
        Self {
            id: node.id.clone(),
            name: node.name.clone(),
            task_type: node.node_type.clone(),
            config: node.config.clone(),
            dependencies: node.dependencies.clone(),
            status: TaskStatus::Pending,
            start_time: None,
            end_time: None,
            logs: String::new(),
            error: None,
        }
    }
}

/// Convert every node of a DAG into a fresh pending task
pub fn tasks_from_nodes(nodes: &[DagNode]) -> Vec<WorkflowTask> {
    nodes.iter().map(WorkflowTask::from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_from_node_copies_definition() {
        let mut node = DagNode::new("build", "docker").depends_on(["checkout"]);
        node.config
            .insert("image".to_string(), serde_json::json!("rust:1.83"));
        node.position.insert("x".to_string(), serde_json::json!(10));

        let task = WorkflowTask::from(&node);
        assert_eq!(task.id, NodeId::new("build"));
        assert_eq!(task.task_type, "docker");
        assert_eq!(task.dependencies, vec![NodeId::new("checkout")]);
        assert_eq!(task.config["image"], "rust:1.83");
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.logs.is_empty());
    }
}
