//! Pluggable per-type task execution.
//!
//! An executor receives the task it runs by mutable reference and is the
//! only code touching that task while it runs. Executors must return
//! promptly once [`TaskContext::cancel`] fires and should fill
//! `task.logs` whether they succeed or fail.

use super::task::WorkflowTask;
use crate::error::TaskError;
use crate::types::RunId;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Per-invocation context handed to an executor
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub run_id: RunId,
    pub cancel: CancellationToken,
}

impl TaskContext {
    pub fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Sleep for `duration`, returning [`TaskError::Canceled`] early if the
    /// run is canceled first.
    pub async fn sleep(&self, duration: Duration) -> Result<(), TaskError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(TaskError::Canceled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}

/// How one task type is carried out
#[async_trait::async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, ctx: &TaskContext, task: &mut WorkflowTask) -> Result<(), TaskError>;
}

/// Map from task type tag to executor, fixed once built
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn TaskExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the simulated `shell`, `docker` and `kubernetes` executors
    pub fn with_reference_executors() -> Self {
        Self::new()
            .register("shell", ShellExecutor::default())
            .register("docker", DockerExecutor::default())
            .register("kubernetes", KubernetesExecutor::default())
    }

    pub fn register(mut self, task_type: impl Into<String>, executor: impl TaskExecutor + 'static) -> Self {
        self.executors.insert(task_type.into(), Arc::new(executor));
        self
    }

    pub fn get(&self, task_type: &str) -> Result<Arc<dyn TaskExecutor>, TaskError> {
        self.executors
            .get(task_type)
            .cloned()
            .ok_or_else(|| TaskError::NoExecutorForType(task_type.to_string()))
    }

    pub fn task_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.executors.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("task_types", &self.task_types())
            .finish()
    }
}

fn config_str<'a>(task: &'a WorkflowTask, key: &str) -> Option<&'a str> {
    task.config.get(key).and_then(|v| v.as_str())
}

/// Simulated shell step (stub; does not spawn processes)
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    pub latency: Duration,
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self {
            latency: Duration::from_secs(2),
        }
    }
}

#[async_trait::async_trait]
impl TaskExecutor for ShellExecutor {
    async fn execute(&self, ctx: &TaskContext, task: &mut WorkflowTask) -> Result<(), TaskError> {
        let command = config_str(task, "command")
            .unwrap_or("echo 'Hello World'")
            .to_string();
        tracing::info!(run_id = %ctx.run_id, task_id = %task.id, %command, "Executing shell task");

        task.log_line(format!("$ {command}"));
        if let Err(e) = ctx.sleep(self.latency).await {
            task.log_line("interrupted: run canceled");
            return Err(e);
        }
        task.log_line("shell task finished with exit code 0");
        Ok(())
    }
}

/// Simulated container step (stub; does not talk to a container runtime)
#[derive(Debug, Clone)]
pub struct DockerExecutor {
    pub latency: Duration,
}

impl Default for DockerExecutor {
    fn default() -> Self {
        Self {
            latency: Duration::from_secs(3),
        }
    }
}

#[async_trait::async_trait]
impl TaskExecutor for DockerExecutor {
    async fn execute(&self, ctx: &TaskContext, task: &mut WorkflowTask) -> Result<(), TaskError> {
        let image = config_str(task, "image").unwrap_or("hello-world").to_string();
        tracing::info!(run_id = %ctx.run_id, task_id = %task.id, %image, "Executing container task");

        task.log_line(format!("$ docker run {image}"));
        if let Err(e) = ctx.sleep(self.latency).await {
            task.log_line("interrupted: run canceled, container stopped");
            return Err(e);
        }
        task.log_line(format!("container {image} exited with status 0"));
        Ok(())
    }
}

/// Simulated orchestrator-native step (stub; does not call a cluster API)
#[derive(Debug, Clone)]
pub struct KubernetesExecutor {
    pub latency: Duration,
}

impl Default for KubernetesExecutor {
    fn default() -> Self {
        Self {
            latency: Duration::from_secs(4),
        }
    }
}

#[async_trait::async_trait]
impl TaskExecutor for KubernetesExecutor {
    async fn execute(&self, ctx: &TaskContext, task: &mut WorkflowTask) -> Result<(), TaskError> {
        let manifest = config_str(task, "manifest")
            .unwrap_or("deployment.yaml")
            .to_string();
        let namespace = config_str(task, "namespace").unwrap_or("default").to_string();
        tracing::info!(
            run_id = %ctx.run_id,
            task_id = %task.id,
            %manifest,
            %namespace,
            "Executing kubernetes task"
        );

        task.log_line(format!("$ kubectl apply -n {namespace} -f {manifest}"));
        if let Err(e) = ctx.sleep(self.latency).await {
            task.log_line("interrupted: run canceled before rollout finished");
            return Err(e);
        }
        task.log_line(format!("{manifest} applied to namespace {namespace}"));
        Ok(())
    }
}
