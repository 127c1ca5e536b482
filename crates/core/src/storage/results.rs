use super::BlobStore;
use crate::events::{Event, EventLog, EventType};
use crate::types::*;
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;

/// Durable record of one run's operator and artifact results
pub struct ResultStore {
    run_id: RunId,
    event_log: Arc<dyn EventLog>,
    blob_store: Arc<dyn BlobStore>,
}

impl ResultStore {
    pub fn new(run_id: RunId, event_log: Arc<dyn EventLog>, blob_store: Arc<dyn BlobStore>) -> Self {
        Self {
            run_id,
            event_log,
            blob_store,
        }
    }

    pub async fn initialize(&self, workflow_id: WorkflowId, dag_id: DagId) -> Result<()> {
        self.event_log
            .append(Event::new(
                self.run_id,
                EventType::RunStarted {
                    workflow_id,
                    dag_id,
                },
            ))
            .await
            .context("Failed to record run start")
    }

    pub async fn record_operator(
        &self,
        operator_id: OperatorId,
        name: &str,
        state: &ExecutionState,
    ) -> Result<()> {
        self.event_log
            .append(Event::new(
                self.run_id,
                EventType::OperatorResult {
                    operator_id,
                    name: name.to_string(),
                    state: state.clone(),
                },
            ))
            .await
            .with_context(|| format!("Failed to record result of operator {}", name))
    }

    /// Store the artifact's content, when there is any, and record the result
    pub async fn record_artifact(
        &self,
        artifact_id: ArtifactId,
        name: &str,
        computed: bool,
        content_path: &Path,
    ) -> Result<()> {
        let content_hash = if computed {
            self.blob_store
                .put_file(content_path)
                .await
                .with_context(|| format!("Failed to store content of artifact {}", name))?
        } else {
            None
        };

        self.event_log
            .append(Event::new(
                self.run_id,
                EventType::ArtifactResult {
                    artifact_id,
                    name: name.to_string(),
                    computed,
                    content_hash,
                },
            ))
            .await
            .with_context(|| format!("Failed to record result of artifact {}", name))
    }

    pub async fn record_run(&self, status: ExecutionStatus) -> Result<()> {
        self.event_log
            .append(Event::new(self.run_id, EventType::RunFinished { status }))
            .await
            .context("Failed to record run result")?;
        self.event_log.flush(self.run_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{FilesystemBlobStore, JsonlEventLog};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_result_store_records_run() {
        let temp_dir = TempDir::new().unwrap();
        let event_log = Arc::new(JsonlEventLog::new(temp_dir.path().join("events")).unwrap());
        let blob_store = Arc::new(FilesystemBlobStore::new(temp_dir.path().join("blobs")).unwrap());
        let run_id = RunId::new();
        let results = ResultStore::new(run_id, event_log.clone(), blob_store.clone());

        let content_path = temp_dir.path().join("metric");
        std::fs::write(&content_path, "0.93").unwrap();

        results
            .initialize(WorkflowId::new(), DagId::new())
            .await
            .unwrap();
        results
            .record_operator(OperatorId::new(), "score", &ExecutionState::pending())
            .await
            .unwrap();
        results
            .record_artifact(ArtifactId::new(), "accuracy", true, &content_path)
            .await
            .unwrap();
        results.record_run(ExecutionStatus::Succeeded).await.unwrap();

        let events = event_log.get_run_events(run_id).await.unwrap();
        assert_eq!(events.len(), 4);

        let hash = events
            .iter()
            .find_map(|e| match &e.event_type {
                EventType::ArtifactResult { content_hash, .. } => content_hash.clone(),
                _ => None,
            })
            .unwrap();
        assert_eq!(
            blob_store.get(&hash).await.unwrap().unwrap().as_ref(),
            b"0.93"
        );
    }
}
