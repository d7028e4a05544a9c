use crate::types::{NodeId, RunId};
use crate::workflow::task::TaskStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

/// A task status transition inside a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskUpdate {
    pub run_id: RunId,
    pub task_id: NodeId,
    pub status: TaskStatus,
    pub logs: String,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Receives every task status transition the engine makes.
///
/// Called from an [`UpdateSink`] delivery task, never from a task's own
/// unit of work. Errors are logged and never affect execution.
#[async_trait::async_trait]
pub trait TaskObserver: Send + Sync {
    async fn on_task_update(&self, update: &TaskUpdate) -> anyhow::Result<()>;
}

/// Queue in front of a [`TaskObserver`].
///
/// `send` never waits. One background task hands queued updates to the
/// observer in send order and exits once every clone of the sink is gone
/// and the queue is drained.
#[derive(Debug, Clone)]
pub struct UpdateSink {
    tx: mpsc::UnboundedSender<TaskUpdate>,
}

impl UpdateSink {
    /// Start the delivery task. Must be called inside a tokio runtime.
    pub fn spawn(observer: Arc<dyn TaskObserver>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<TaskUpdate>();
        tokio::spawn(async move {
            while let Some(update) = rx.recv().await {
                if let Err(e) = observer.on_task_update(&update).await {
                    tracing::warn!(
                        run_id = %update.run_id,
                        task_id = %update.task_id,
                        error = %e,
                        "Task status callback failed"
                    );
                }
            }
        });
        Self { tx }
    }

    pub fn send(&self, update: TaskUpdate) {
        if let Err(mpsc::error::SendError(update)) = self.tx.send(update) {
            tracing::debug!(
                run_id = %update.run_id,
                task_id = %update.task_id,
                "Observer gone, task update dropped"
            );
        }
    }
}

/// Observer that writes each transition to the tracing log
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingObserver;

#[async_trait::async_trait]
impl TaskObserver for LoggingObserver {
    async fn on_task_update(&self, update: &TaskUpdate) -> anyhow::Result<()> {
        match &update.error {
            Some(error) => tracing::warn!(
                run_id = %update.run_id,
                task_id = %update.task_id,
                status = %update.status,
                error = %error,
                "Task status changed"
            ),
            None => tracing::info!(
                run_id = %update.run_id,
                task_id = %update.task_id,
                status = %update.status,
                "Task status changed"
            ),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Takes a while per update, then fails
    struct DelayedObserver {
        seen: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait::async_trait]
    impl TaskObserver for DelayedObserver {
        async fn on_task_update(&self, update: &TaskUpdate) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            self.seen.lock().unwrap().push(update.task_id.to_string());
            Err(anyhow::anyhow!("database unavailable"))
        }
    }

    fn update(task: &str) -> TaskUpdate {
        TaskUpdate {
            run_id: RunId::new(),
            task_id: NodeId::new(task),
            status: TaskStatus::Running,
            logs: String::new(),
            error: None,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sink_delivers_in_order_without_waiting() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = UpdateSink::spawn(Arc::new(DelayedObserver { seen: seen.clone() }));

        let started = tokio::time::Instant::now();
        for task in ["a", "b", "c"] {
            sink.send(update(task));
        }
        assert_eq!(started.elapsed(), Duration::ZERO);
        drop(sink);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(*seen.lock().unwrap(), vec!["a", "b", "c"]);
    }
}
