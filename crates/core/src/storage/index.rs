use super::{sort_most_recent_first, sort_newest_version_first, DagStore, PipelineStore, RunStore};
use crate::events::TaskUpdate;
use crate::types::{Dag, DagId, Pipeline, PipelineId, PipelineRun, PipelineStatus, RunId};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, Table, TableDefinition};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const PIPELINES_TABLE: TableDef = TableDefinition::new("pipelines");
const DAGS_TABLE: TableDef = TableDefinition::new("dags");
const RUNS_TABLE: TableDef = TableDefinition::new("runs");
const TASK_UPDATES_TABLE: TableDef = TableDefinition::new("task_updates");

type TableDef = TableDefinition<'static, &'static str, &'static [u8]>;
type JsonTable<'txn> = Table<'txn, &'static str, &'static [u8]>;

/// Store backed by a redb file; values are JSON documents.
///
/// DAG activation and active inserts run inside a single write
/// transaction, so readers never observe zero or two active versions.
#[derive(Clone)]
pub struct RedbIndexStore {
    db: Arc<Database>,
    update_seq: Arc<AtomicU64>,
}

impl RedbIndexStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        // Create parent directory if needed
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create index directory")?;
        }

        let db = Database::create(&path).context("Failed to create redb database")?;

        // Initialize tables
        let write_txn = db.begin_write().context("Failed to begin write transaction")?;
        let recorded = {
            let _pipelines = write_txn
                .open_table(PIPELINES_TABLE)
                .context("Failed to open pipelines table")?;
            let _dags = write_txn
                .open_table(DAGS_TABLE)
                .context("Failed to open dags table")?;
            let _runs = write_txn
                .open_table(RUNS_TABLE)
                .context("Failed to open runs table")?;
            let task_updates = write_txn
                .open_table(TASK_UPDATES_TABLE)
                .context("Failed to open task updates table")?;
            // The update sequence continues past anything already stored
            count_rows(&task_updates)?
        };
        write_txn.commit().context("Failed to commit transaction")?;

        Ok(Self {
            db: Arc::new(db),
            update_seq: Arc::new(AtomicU64::new(recorded)),
        })
    }

    fn get<T: DeserializeOwned>(&self, table: TableDef, key: &str) -> Result<Option<T>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn.open_table(table).context("Failed to open table")?;
        get_json(&table, key)
    }

    fn put<T: Serialize>(&self, table: TableDef, key: &str, value: &T) -> Result<()> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        {
            let mut table = write_txn.open_table(table).context("Failed to open table")?;
            put_json(&mut table, key, value)?;
        }
        write_txn.commit().context("Failed to commit")?;
        Ok(())
    }

    fn scan<T: DeserializeOwned>(&self, table: TableDef) -> Result<Vec<T>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn.open_table(table).context("Failed to open table")?;
        scan_json(&table)
    }
}

fn get_json<T: DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    key: &str,
) -> Result<Option<T>> {
    match table.get(key).context("Failed to get value")? {
        Some(guard) => {
            let value = serde_json::from_slice(guard.value()).context("Failed to deserialize value")?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

fn scan_json<T: DeserializeOwned>(table: &impl ReadableTable<&'static str, &'static [u8]>) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for item in table.iter().context("Failed to iterate table")? {
        let (_key, value) = item.context("Failed to read item")?;
        values.push(serde_json::from_slice(value.value()).context("Failed to deserialize value")?);
    }
    Ok(values)
}

fn put_json<T: Serialize>(table: &mut JsonTable<'_>, key: &str, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec(value).context("Failed to serialize value")?;
    table
        .insert(key, bytes.as_slice())
        .context("Failed to insert value")?;
    Ok(())
}

fn remove_key(table: &mut JsonTable<'_>, key: &str) -> Result<bool> {
    Ok(table.remove(key).context("Failed to remove value")?.is_some())
}

fn count_rows(table: &impl ReadableTable<&'static str, &'static [u8]>) -> Result<u64> {
    Ok(table.iter().context("Failed to iterate table")?.count() as u64)
}

fn pipeline_dags(table: &JsonTable<'_>, pipeline_id: &PipelineId) -> Result<Vec<Dag>> {
    Ok(scan_json::<Dag>(table)?
        .into_iter()
        .filter(|d| d.pipeline_id == *pipeline_id)
        .collect())
}

impl PipelineStore for RedbIndexStore {
    fn put_pipeline(&self, pipeline: &Pipeline) -> Result<()> {
        self.put(PIPELINES_TABLE, &pipeline.id.to_string(), pipeline)
    }

    fn get_pipeline(&self, id: &PipelineId) -> Result<Option<Pipeline>> {
        self.get(PIPELINES_TABLE, &id.to_string())
    }

    fn update_pipeline_status(
        &self,
        id: &PipelineId,
        status: PipelineStatus,
        last_run_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        {
            let mut table = write_txn
                .open_table(PIPELINES_TABLE)
                .context("Failed to open table")?;
            let key = id.to_string();
            let mut pipeline: Pipeline =
                get_json(&table, &key)?.ok_or_else(|| anyhow!("Pipeline {} not found", id))?;
            pipeline.status = status;
            if last_run_at.is_some() {
                pipeline.last_run_at = last_run_at;
            }
            put_json(&mut table, &key, &pipeline)?;
        }
        write_txn.commit().context("Failed to commit")?;
        Ok(())
    }
}

impl DagStore for RedbIndexStore {
    fn insert_dag(&self, mut dag: Dag) -> Result<Dag> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        {
            let mut table = write_txn.open_table(DAGS_TABLE).context("Failed to open table")?;
            let key = dag.id.to_string();
            if table.get(key.as_str()).context("Failed to get DAG")?.is_some() {
                return Err(anyhow!("DAG {} already exists", dag.id));
            }

            let siblings = pipeline_dags(&table, &dag.pipeline_id)?;
            if dag.version == 0 {
                dag.version = siblings.iter().map(|d| d.version).max().unwrap_or(0) + 1;
            }
            if dag.is_active {
                for mut sibling in siblings.into_iter().filter(|d| d.is_active) {
                    sibling.is_active = false;
                    put_json(&mut table, &sibling.id.to_string(), &sibling)?;
                }
            }
            put_json(&mut table, &key, &dag)?;
        }
        write_txn.commit().context("Failed to commit")?;
        Ok(dag)
    }

    fn get_dag(&self, id: &DagId) -> Result<Option<Dag>> {
        self.get(DAGS_TABLE, &id.to_string())
    }

    fn list_dags(&self, pipeline_id: &PipelineId) -> Result<Vec<Dag>> {
        let mut dags: Vec<Dag> = self
            .scan::<Dag>(DAGS_TABLE)?
            .into_iter()
            .filter(|d| d.pipeline_id == *pipeline_id)
            .collect();
        sort_newest_version_first(&mut dags);
        Ok(dags)
    }

    fn active_dag(&self, pipeline_id: &PipelineId) -> Result<Option<Dag>> {
        Ok(self
            .scan::<Dag>(DAGS_TABLE)?
            .into_iter()
            .find(|d| d.pipeline_id == *pipeline_id && d.is_active))
    }

    fn update_dag(&self, dag: &Dag) -> Result<()> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        {
            let mut table = write_txn.open_table(DAGS_TABLE).context("Failed to open table")?;
            let key = dag.id.to_string();
            let stored: Dag = get_json(&table, &key)?.ok_or_else(|| anyhow!("DAG {} not found", dag.id))?;
            let mut updated = dag.clone();
            updated.is_active = stored.is_active;
            put_json(&mut table, &key, &updated)?;
        }
        write_txn.commit().context("Failed to commit")?;
        Ok(())
    }

    fn activate_dag(&self, id: &DagId) -> Result<bool> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        {
            let mut table = write_txn.open_table(DAGS_TABLE).context("Failed to open table")?;
            let Some(target) = get_json::<Dag>(&table, &id.to_string())? else {
                return Ok(false);
            };
            for mut dag in pipeline_dags(&table, &target.pipeline_id)? {
                let should_be_active = dag.id == *id;
                if dag.is_active != should_be_active {
                    dag.is_active = should_be_active;
                    put_json(&mut table, &dag.id.to_string(), &dag)?;
                }
            }
        }
        write_txn.commit().context("Failed to commit")?;
        Ok(true)
    }

    fn deactivate_dag(&self, id: &DagId) -> Result<bool> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        {
            let mut table = write_txn.open_table(DAGS_TABLE).context("Failed to open table")?;
            let key = id.to_string();
            let Some(mut dag) = get_json::<Dag>(&table, &key)? else {
                return Ok(false);
            };
            dag.is_active = false;
            put_json(&mut table, &key, &dag)?;
        }
        write_txn.commit().context("Failed to commit")?;
        Ok(true)
    }

    fn delete_dag(&self, id: &DagId) -> Result<bool> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        let removed = {
            let mut table = write_txn.open_table(DAGS_TABLE).context("Failed to open table")?;
            remove_key(&mut table, &id.to_string())?
        };
        write_txn.commit().context("Failed to commit")?;
        Ok(removed)
    }
}

impl RunStore for RedbIndexStore {
    fn create_run(&self, run: &PipelineRun) -> Result<()> {
        if self.get_run(&run.id)?.is_some() {
            return Err(anyhow!("Run {} already exists", run.id));
        }
        self.put(RUNS_TABLE, &run.id.to_string(), run)
    }

    fn get_run(&self, id: &RunId) -> Result<Option<PipelineRun>> {
        self.get(RUNS_TABLE, &id.to_string())
    }

    fn update_run(&self, run: &PipelineRun) -> Result<()> {
        if self.get_run(&run.id)?.is_none() {
            return Err(anyhow!("Run {} not found", run.id));
        }
        self.put(RUNS_TABLE, &run.id.to_string(), run)
    }

    fn list_runs(&self, pipeline_id: &PipelineId) -> Result<Vec<PipelineRun>> {
        let mut runs: Vec<PipelineRun> = self
            .scan::<PipelineRun>(RUNS_TABLE)?
            .into_iter()
            .filter(|r| r.pipeline_id == *pipeline_id)
            .collect();
        sort_most_recent_first(&mut runs);
        Ok(runs)
    }

    fn record_task_update(&self, update: &TaskUpdate) -> Result<()> {
        // run/sequence keeps a run's updates contiguous and in write order
        let seq = self.update_seq.fetch_add(1, Ordering::Relaxed);
        let key = format!("{}/{:020}", update.run_id, seq);
        self.put(TASK_UPDATES_TABLE, &key, update)
    }

    fn task_updates(&self, run_id: &RunId) -> Result<Vec<TaskUpdate>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn
            .open_table(TASK_UPDATES_TABLE)
            .context("Failed to open table")?;

        // '0' sorts right after '/', bounding the run's key prefix
        let start = format!("{run_id}/");
        let end = format!("{run_id}0");
        let mut updates = Vec::new();
        for item in table
            .range(start.as_str()..end.as_str())
            .context("Failed to scan task updates")?
        {
            let (_key, value) = item.context("Failed to read item")?;
            updates.push(
                serde_json::from_slice(value.value()).context("Failed to deserialize task update")?,
            );
        }
        Ok(updates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DagNode, NodeId, RunStatus};
    use crate::workflow::task::TaskStatus;
    use tempfile::TempDir;

    fn open() -> (TempDir, RedbIndexStore) {
        let temp_dir = TempDir::new().unwrap();
        let store = RedbIndexStore::new(temp_dir.path().join("index.redb")).unwrap();
        (temp_dir, store)
    }

    fn dag(pipeline_id: PipelineId) -> Dag {
        Dag::new(pipeline_id, "build", vec![DagNode::new("a", "shell")])
    }

    #[test]
    fn test_dag_versions_and_activation() {
        let (_dir, store) = open();
        let pipeline_id = PipelineId::new();

        let v1 = store.insert_dag(dag(pipeline_id).active()).unwrap();
        let v2 = store.insert_dag(dag(pipeline_id)).unwrap();
        assert_eq!((v1.version, v2.version), (1, 2));
        assert_eq!(store.active_dag(&pipeline_id).unwrap().unwrap().id, v1.id);

        assert!(store.activate_dag(&v2.id).unwrap());
        let active: Vec<u32> = store
            .list_dags(&pipeline_id)
            .unwrap()
            .iter()
            .filter(|d| d.is_active)
            .map(|d| d.version)
            .collect();
        assert_eq!(active, vec![2]);

        assert!(!store.activate_dag(&DagId::new()).unwrap());

        assert!(store.delete_dag(&v1.id).unwrap());
        assert!(!store.delete_dag(&v1.id).unwrap());
        assert_eq!(store.list_dags(&pipeline_id).unwrap().len(), 1);
    }

    #[test]
    fn test_run_round_trip_and_listing() {
        let (_dir, store) = open();
        let pipeline = Pipeline::new("api", "git@example.com:api.git", "main");
        store.put_pipeline(&pipeline).unwrap();

        let mut run = PipelineRun {
            id: RunId::new(),
            pipeline_id: pipeline.id,
            dag_id: DagId::new(),
            dag_version: 1,
            status: RunStatus::Pending,
            start_time: Some(Utc::now()),
            end_time: None,
            duration_secs: 0,
            branch: "main".to_string(),
            triggered_by: "alice".to_string(),
            logs: String::new(),
        };
        store.create_run(&run).unwrap();
        assert!(store.create_run(&run).is_err());

        run.status = RunStatus::Success;
        store.update_run(&run).unwrap();
        let reloaded = store.get_run(&run.id).unwrap().unwrap();
        assert_eq!(reloaded.status, RunStatus::Success);
        assert_eq!(store.list_runs(&pipeline.id).unwrap().len(), 1);
        assert!(store.list_runs(&PipelineId::new()).unwrap().is_empty());
    }

    #[test]
    fn test_task_updates_are_scoped_and_ordered() {
        let (_dir, store) = open();
        let run_id = RunId::new();
        let other_run = RunId::new();

        // the wall clock steps backwards between writes; order follows writes
        let base = Utc::now();
        let steps = [("a", TaskStatus::Running), ("a", TaskStatus::Success), ("b", TaskStatus::Running)];
        for (i, (task, status)) in steps.into_iter().enumerate() {
            store
                .record_task_update(&TaskUpdate {
                    run_id,
                    task_id: NodeId::new(task),
                    status,
                    logs: String::new(),
                    error: None,
                    timestamp: base - chrono::Duration::seconds(i as i64 * 60),
                })
                .unwrap();
        }
        store
            .record_task_update(&TaskUpdate {
                run_id: other_run,
                task_id: NodeId::new("z"),
                status: TaskStatus::Failed,
                logs: String::new(),
                error: Some("boom".to_string()),
                timestamp: Utc::now(),
            })
            .unwrap();

        let updates = store.task_updates(&run_id).unwrap();
        let seen: Vec<(String, TaskStatus)> = updates
            .iter()
            .map(|u| (u.task_id.to_string(), u.status))
            .collect();
        assert_eq!(
            seen,
            vec![
                ("a".to_string(), TaskStatus::Running),
                ("a".to_string(), TaskStatus::Success),
                ("b".to_string(), TaskStatus::Running),
            ]
        );
        assert_eq!(store.task_updates(&other_run).unwrap().len(), 1);
    }

    #[test]
    fn test_reopen_keeps_data() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("index.redb");
        let pipeline_id = PipelineId::new();
        let stored = {
            let store = RedbIndexStore::new(path.clone()).unwrap();
            store.insert_dag(dag(pipeline_id).active()).unwrap()
        };

        let store = RedbIndexStore::new(path).unwrap();
        assert_eq!(store.active_dag(&pipeline_id).unwrap().unwrap().id, stored.id);
    }

    #[test]
    fn test_task_update_order_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("index.redb");
        let run_id = RunId::new();
        let update = |task: &str| TaskUpdate {
            run_id,
            task_id: NodeId::new(task),
            status: TaskStatus::Success,
            logs: String::new(),
            error: None,
            timestamp: Utc::now(),
        };

        {
            let store = RedbIndexStore::new(path.clone()).unwrap();
            store.record_task_update(&update("first")).unwrap();
            store.record_task_update(&update("second")).unwrap();
        }
        let store = RedbIndexStore::new(path).unwrap();
        store.record_task_update(&update("third")).unwrap();

        let ids: Vec<String> = store
            .task_updates(&run_id)
            .unwrap()
            .iter()
            .map(|u| u.task_id.to_string())
            .collect();
        assert_eq!(ids, vec!["first", "second", "third"]);
    }
}
