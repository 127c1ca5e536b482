use super::artifact::{Artifact, DagArtifact};
use crate::error::JobError;
use crate::job::{JobSpec, PollResult};
use crate::storage::ResultStore;
use crate::types::*;
use chrono::Utc;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Per-operator handle the orchestrator drives
#[async_trait::async_trait]
pub trait Operator: Send + Sync {
    fn id(&self) -> OperatorId;

    fn name(&self) -> &str;

    fn spec(&self) -> &OperatorSpec;

    /// Immutable launch specification
    fn job_spec(&self) -> &JobSpec;

    /// Last known execution state; never polls the backend
    fn exec_state(&self) -> ExecutionState;

    /// Record that the job was handed to the backend
    fn mark_launched(&self);

    /// Fold a poll result into the execution state
    fn observe(&self, result: &PollResult);

    /// Durably record the terminal outcome and output artifacts
    async fn persist_result(&self) -> anyhow::Result<()>;

    /// Best-effort removal of local job state
    async fn finish(&self);
}

/// Operator backed by a job on a [`crate::job::JobBackend`]
pub struct JobOperator {
    id: OperatorId,
    name: String,
    spec: OperatorSpec,
    job_spec: JobSpec,
    job_dir: PathBuf,
    outputs: Vec<Arc<DagArtifact>>,
    state: Mutex<ExecutionState>,
    results: Option<Arc<ResultStore>>,
}

impl JobOperator {
    pub fn new(
        def: &OperatorDef,
        job_spec: JobSpec,
        job_dir: PathBuf,
        outputs: Vec<Arc<DagArtifact>>,
        results: Option<Arc<ResultStore>>,
    ) -> Self {
        Self {
            id: def.id,
            name: def.name.clone(),
            spec: def.spec.clone(),
            job_spec,
            job_dir,
            outputs,
            state: Mutex::new(ExecutionState::pending()),
            results,
        }
    }

    fn state(&self) -> MutexGuard<'_, ExecutionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait::async_trait]
impl Operator for JobOperator {
    fn id(&self) -> OperatorId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn spec(&self) -> &OperatorSpec {
        &self.spec
    }

    fn job_spec(&self) -> &JobSpec {
        &self.job_spec
    }

    fn exec_state(&self) -> ExecutionState {
        self.state().clone()
    }

    fn mark_launched(&self) {
        let mut state = self.state();
        if state.status == ExecutionStatus::Pending {
            state.status = ExecutionStatus::Running;
            state.timestamps.running_at = Some(Utc::now());
        }
    }

    fn observe(&self, result: &PollResult) {
        let mut state = self.state();
        if state.is_terminal() {
            return;
        }

        match result.status {
            // Once launched, a job that the backend still queues counts as running
            ExecutionStatus::Pending | ExecutionStatus::Running => {
                state.status = ExecutionStatus::Running;
            }
            ExecutionStatus::Unknown => {
                state.status = ExecutionStatus::Unknown;
            }
            ExecutionStatus::Succeeded => {
                state.status = ExecutionStatus::Succeeded;
                state.timestamps.finished_at = Some(Utc::now());
                for artifact in &self.outputs {
                    artifact.mark_computed();
                }
            }
            ExecutionStatus::Failed => {
                state.status = ExecutionStatus::Failed;
                state.timestamps.finished_at = Some(Utc::now());
                state.failure_type = Some(
                    result
                        .failure_type
                        .or_else(|| result.diagnosis.as_ref().map(JobError::failure_type))
                        .unwrap_or(FailureType::System),
                );
                if let Some(diagnosis) = &result.diagnosis {
                    state.error = Some(ErrorInfo {
                        context: diagnosis.to_string(),
                        tip: None,
                    });
                }
            }
        }
    }

    async fn persist_result(&self) -> anyhow::Result<()> {
        let Some(results) = &self.results else {
            return Ok(());
        };

        let state = self.exec_state();
        results.record_operator(self.id, &self.name, &state).await?;
        for artifact in &self.outputs {
            results
                .record_artifact(
                    artifact.id(),
                    artifact.name(),
                    artifact.computed(),
                    artifact.content_path(),
                )
                .await?;
        }
        Ok(())
    }

    async fn finish(&self) {
        if let Err(e) = tokio::fs::remove_dir_all(&self.job_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Unable to clean up operator {}: {}", self.name, e);
            }
        }
        for artifact in &self.outputs {
            if let Err(e) = tokio::fs::remove_file(artifact.content_path()).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!("Unable to remove artifact {}: {}", artifact.name(), e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::OperatorJob;
    use tempfile::TempDir;

    fn operator(dir: &TempDir) -> (JobOperator, Arc<DagArtifact>) {
        let def = OperatorDef {
            id: OperatorId::new(),
            name: "train".to_string(),
            spec: OperatorSpec::Param {
                val: "3".to_string(),
            },
            inputs: vec![],
            outputs: vec![],
        };
        let output = Arc::new(DagArtifact::new(
            ArtifactId::new(),
            "model".to_string(),
            ArtifactType::Bytes,
            dir.path().join("model"),
            false,
        ));
        let job_dir = dir.path().join("train");
        let job_spec = JobSpec::Operator(OperatorJob {
            job_name: "train-1".to_string(),
            operator_id: def.id,
            operator_name: def.name.clone(),
            spec: def.spec.clone(),
            input_paths: vec![],
            output_paths: vec![output.content_path().to_path_buf()],
            metadata_path: job_dir.join("exec_state.json"),
        });
        (
            JobOperator::new(&def, job_spec, job_dir, vec![output.clone()], None),
            output,
        )
    }

    #[test]
    fn test_launched_operator_never_reads_pending() {
        let dir = TempDir::new().unwrap();
        let (op, _) = operator(&dir);
        assert_eq!(op.exec_state().status, ExecutionStatus::Pending);

        op.mark_launched();
        op.observe(&PollResult::status(ExecutionStatus::Pending));
        assert_eq!(op.exec_state().status, ExecutionStatus::Running);
    }

    #[test]
    fn test_terminal_state_is_monotonic() {
        let dir = TempDir::new().unwrap();
        let (op, output) = operator(&dir);

        op.mark_launched();
        op.observe(&PollResult::succeeded());
        assert!(output.computed());

        op.observe(&PollResult::failed(FailureType::User));
        assert_eq!(op.exec_state().status, ExecutionStatus::Succeeded);
    }

    #[test]
    fn test_failure_classification() {
        let dir = TempDir::new().unwrap();
        let (op, output) = operator(&dir);

        op.mark_launched();
        op.observe(
            &PollResult::status(ExecutionStatus::Failed)
                .with_diagnosis(JobError::User("out of memory".to_string())),
        );

        let state = op.exec_state();
        assert_eq!(state.failure_type, Some(FailureType::User));
        assert!(state.error.unwrap().context.contains("out of memory"));
        assert!(!output.computed());
    }

    #[tokio::test]
    async fn test_finish_removes_local_state() {
        let dir = TempDir::new().unwrap();
        let (op, output) = operator(&dir);
        std::fs::create_dir_all(dir.path().join("train")).unwrap();
        std::fs::write(output.content_path(), b"weights").unwrap();

        op.finish().await;
        op.finish().await;

        assert!(!dir.path().join("train").exists());
        assert!(!output.content_path().exists());
    }
}
