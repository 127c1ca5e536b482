use crate::types::{Run, RunId, Schedule, WorkflowId, WorkflowRecord};
use anyhow::{Context, Result};
use redb::{Database, DatabaseError, ReadableTable, TableDefinition, TableError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::Instant;

const WORKFLOWS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("workflows");
const RUNS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("runs");

/// How long an operation waits for another holder of the index file
const LOCK_TIMEOUT: Duration = Duration::from_secs(30);
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(20);

/// Lookup of registered workflows and run summaries
#[async_trait::async_trait]
pub trait IndexStore: Send + Sync {
    /// Store or replace a workflow record
    async fn put_workflow(&self, workflow: &WorkflowRecord) -> Result<()>;

    /// Get a workflow by ID
    async fn get_workflow(&self, workflow_id: &WorkflowId) -> Result<Option<WorkflowRecord>>;

    /// List all workflows
    async fn list_workflows(&self) -> Result<Vec<WorkflowRecord>>;

    /// Update the schedule stored on a workflow
    async fn update_schedule(&self, workflow_id: &WorkflowId, schedule: &Schedule) -> Result<()>;

    /// Index a run
    async fn index_run(&self, run: &Run) -> Result<()>;

    /// Get a run by ID
    async fn get_run(&self, run_id: &RunId) -> Result<Option<Run>>;

    /// List all runs, most recent first
    async fn list_runs(&self) -> Result<Vec<Run>>;
}

/// Index store for fast queries using redb
///
/// The database file is single-writer across processes, so it is opened for
/// each operation and closed right after. Long runs in other processes never
/// keep it locked.
#[derive(Debug, Clone)]
pub struct RedbIndexStore {
    path: PathBuf,
}

impl RedbIndexStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create index directory")?;
        }
        Ok(Self { path })
    }

    async fn open(&self) -> Result<Database> {
        let deadline = Instant::now() + LOCK_TIMEOUT;
        loop {
            match Database::create(&self.path) {
                Ok(db) => return Ok(db),
                Err(DatabaseError::DatabaseAlreadyOpen) if Instant::now() < deadline => {
                    tokio::time::sleep(LOCK_RETRY_INTERVAL).await;
                }
                Err(e) => return Err(e).context("Failed to open redb database"),
            }
        }
    }

    async fn insert<T: Serialize + Sync>(
        &self,
        table: TableDefinition<'static, &'static str, &'static [u8]>,
        key: &str,
        value: &T,
    ) -> Result<()> {
        let value = serde_json::to_vec(value).context("Failed to serialize value")?;
        let db = self.open().await?;
        let write_txn = db.begin_write().context("Failed to begin write")?;
        {
            let mut table = write_txn.open_table(table).context("Failed to open table")?;
            table
                .insert(key, value.as_slice())
                .context("Failed to insert value")?;
        }
        write_txn.commit().context("Failed to commit")?;
        Ok(())
    }

    async fn get<T: DeserializeOwned>(
        &self,
        table: TableDefinition<'static, &'static str, &'static [u8]>,
        key: &str,
    ) -> Result<Option<T>> {
        let db = self.open().await?;
        let read_txn = db.begin_read().context("Failed to begin read")?;
        let table = match read_txn.open_table(table) {
            Ok(table) => table,
            // Nothing was ever written to it
            Err(TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(e).context("Failed to open table"),
        };

        let value = match table.get(key).context("Failed to get value")? {
            Some(guard) => Some(
                serde_json::from_slice(guard.value()).context("Failed to deserialize value")?,
            ),
            None => None,
        };
        Ok(value)
    }

    async fn list<T: DeserializeOwned>(
        &self,
        table: TableDefinition<'static, &'static str, &'static [u8]>,
    ) -> Result<Vec<T>> {
        let db = self.open().await?;
        let read_txn = db.begin_read().context("Failed to begin read")?;
        let table = match read_txn.open_table(table) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e).context("Failed to open table"),
        };

        let mut values = Vec::new();
        for item in table.iter().context("Failed to iterate table")? {
            let (_key, value) = item.context("Failed to read item")?;
            values.push(serde_json::from_slice(value.value()).context("Failed to deserialize value")?);
        }
        Ok(values)
    }
}

#[async_trait::async_trait]
impl IndexStore for RedbIndexStore {
    async fn put_workflow(&self, workflow: &WorkflowRecord) -> Result<()> {
        self.insert(WORKFLOWS_TABLE, &workflow.id.to_string(), workflow).await
    }

    async fn get_workflow(&self, workflow_id: &WorkflowId) -> Result<Option<WorkflowRecord>> {
        self.get(WORKFLOWS_TABLE, &workflow_id.to_string()).await
    }

    async fn list_workflows(&self) -> Result<Vec<WorkflowRecord>> {
        let mut workflows: Vec<WorkflowRecord> = self.list(WORKFLOWS_TABLE).await?;
        workflows.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(workflows)
    }

    async fn update_schedule(&self, workflow_id: &WorkflowId, schedule: &Schedule) -> Result<()> {
        let mut workflow = self
            .get_workflow(workflow_id)
            .await?
            .context("Workflow not found")?;

        workflow.schedule = schedule.clone();
        workflow.updated_at = chrono::Utc::now();

        self.put_workflow(&workflow).await
    }

    async fn index_run(&self, run: &Run) -> Result<()> {
        self.insert(RUNS_TABLE, &run.id.to_string(), run).await
    }

    async fn get_run(&self, run_id: &RunId) -> Result<Option<Run>> {
        self.get(RUNS_TABLE, &run_id.to_string()).await
    }

    async fn list_runs(&self) -> Result<Vec<Run>> {
        let mut runs: Vec<Run> = self.list(RUNS_TABLE).await?;
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(runs)
    }
}
