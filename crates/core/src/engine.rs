//! Entrypoints: execute, preview, trigger and schedule workflows.

use crate::error::{EngineError, RunError};
use crate::events::{Event, EventLog};
use crate::job::{BackendFactory, JobBackend, JobSpec, WorkflowJob};
use crate::policy::FailurePolicy;
use crate::scheduler::parse_period;
use crate::storage::{BlobStore, IndexStore, ResultStore};
use crate::types::*;
use crate::workflow::{Dag, DagContext, Orchestrator, PreviewPayload, RunState, WorkflowDag};
use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Name of the cron entry that triggers a workflow
pub fn cron_job_name(workflow_id: &WorkflowId) -> String {
    format!("opflow-{}", workflow_id)
}

/// Outcome of a preview run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreviewResult {
    pub run_id: RunId,
    pub status: ExecutionStatus,
    pub operators: HashMap<OperatorId, ExecutionState>,
    pub artifacts: HashMap<ArtifactId, PreviewPayload>,
    pub failure: Option<RunFailure>,
}

/// Storage the engine records workflows and results in
#[derive(Clone)]
pub struct EngineStores {
    pub index: Arc<dyn IndexStore>,
    pub event_log: Arc<dyn EventLog>,
    pub blob_store: Arc<dyn BlobStore>,
}

pub struct Engine {
    stores: EngineStores,
    backends: Arc<dyn BackendFactory>,
    // Long-lived backend that owns cron entries and out-of-band workflow jobs
    scheduler: Arc<dyn JobBackend>,
    storage_root: PathBuf,
    policy: FailurePolicy,
    // Timing handed to runs started by cron entries
    scheduled_time: TimeConfig,
}

impl Engine {
    pub fn new(
        stores: EngineStores,
        backends: Arc<dyn BackendFactory>,
        scheduler: Arc<dyn JobBackend>,
        storage_root: PathBuf,
    ) -> Self {
        Self {
            stores,
            backends,
            scheduler,
            storage_root,
            policy: FailurePolicy::default(),
            scheduled_time: TimeConfig::default(),
        }
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_scheduled_time(mut self, time: TimeConfig) -> Self {
        self.scheduled_time = time;
        self
    }

    /// Store a workflow (or a new DAG version of it) and install its schedule
    pub async fn register_workflow(
        &self,
        name: &str,
        description: Option<String>,
        dag: DagSpec,
        schedule: Schedule,
    ) -> Result<WorkflowRecord, EngineError> {
        // Validate before storing anything
        Dag::build(
            &dag,
            DagContext {
                run_id: RunId::new(),
                storage_root: self.storage_root.clone(),
                results: None,
            },
        )?;

        let now = Utc::now();
        let created_at = self
            .stores
            .index
            .get_workflow(&dag.workflow_id)
            .await?
            .map(|existing| existing.created_at)
            .unwrap_or(now);

        let record = WorkflowRecord {
            id: dag.workflow_id,
            name: name.to_string(),
            description,
            schedule: Schedule::default(),
            dag,
            created_at,
            updated_at: now,
        };
        self.stores.index.put_workflow(&record).await?;
        tracing::info!("Registered workflow {} ({})", record.name, record.id);

        self.edit_schedule(record.id, schedule.clone()).await?;
        Ok(WorkflowRecord { schedule, ..record })
    }

    /// Run the workflow's latest DAG to completion, persisting every result
    pub async fn execute_workflow(
        &self,
        workflow_id: WorkflowId,
        time: TimeConfig,
        parameters: HashMap<String, String>,
    ) -> Result<ExecutionStatus, EngineError> {
        let record = self.workflow(&workflow_id).await?;
        let mut spec = record.dag;
        apply_parameters(&mut spec, &parameters)?;

        let backend = self.backends.for_engine(&spec.engine)?;
        let run_id = RunId::new();
        let results = Arc::new(ResultStore::new(
            run_id,
            self.stores.event_log.clone(),
            self.stores.blob_store.clone(),
        ));
        let dag = Arc::new(Dag::build(
            &spec,
            DagContext {
                run_id,
                storage_root: self.storage_root.clone(),
                results: Some(results),
            },
        )?);

        let started_at = Utc::now();
        tracing::info!("Executing workflow {} as run {}", record.name, run_id);
        let (status, outcome) = self.orchestrate(run_id, dag.clone(), backend, time).await;

        // Runs whatever happened above, including a failed initialization
        if let Err(e) = dag.persist_result(status).await {
            tracing::error!("Unable to persist result of run {}: {:#}", run_id, e);
        }
        for op in dag.operators() {
            op.finish().await;
        }

        let run = Run {
            id: run_id,
            workflow_id,
            dag_id: spec.id,
            status,
            started_at,
            completed_at: Some(Utc::now()),
            parameters,
            failure: outcome.as_ref().err().map(RunError::to_failure),
            operators: dag
                .operators()
                .iter()
                .map(|op| OperatorExecution {
                    id: op.id(),
                    name: op.name().to_string(),
                    state: op.exec_state(),
                })
                .collect(),
        };
        let indexed = self.stores.index.index_run(&run).await;

        outcome?;
        indexed?;
        Ok(status)
    }

    async fn orchestrate(
        &self,
        run_id: RunId,
        dag: Arc<Dag>,
        backend: Arc<dyn JobBackend>,
        time: TimeConfig,
    ) -> (ExecutionStatus, Result<(), RunError>) {
        let mut state = match RunState::new(dag.as_ref()) {
            Ok(state) => state,
            Err(e) => return (ExecutionStatus::Failed, Err(e.into())),
        };
        if let Err(e) = dag.initialize_results().await {
            return (ExecutionStatus::Failed, Err(RunError::Initialize(e)));
        }

        let outcome = Orchestrator::new(run_id, dag, backend, time)
            .with_policy(self.policy.clone())
            .persisting_results(true)
            .run(&mut state)
            .await;
        (state.status(), outcome)
    }

    /// Run a DAG without persisting anything and return what it produced
    pub async fn preview_workflow(
        &self,
        spec: &DagSpec,
        time: TimeConfig,
    ) -> Result<PreviewResult, EngineError> {
        let backend = self.backends.for_engine(&EngineConfig::Process)?;
        let run_id = RunId::new();
        let dag = Arc::new(Dag::build(
            spec,
            DagContext {
                run_id,
                storage_root: self.storage_root.clone(),
                results: None,
            },
        )?);

        let mut state = RunState::new(dag.as_ref())?;
        dag.initialize_results().await?;

        let outcome = Orchestrator::new(run_id, dag.clone(), backend, time)
            .with_policy(self.policy.clone())
            .run(&mut state)
            .await;

        let operators = dag
            .operators()
            .iter()
            .map(|op| (op.id(), op.exec_state()))
            .collect();
        let mut artifacts = HashMap::new();
        for artifact in dag.artifacts() {
            if let Some(preview) = artifact.preview().await {
                artifacts.insert(artifact.id(), preview);
            }
        }

        // Preview artifacts are ephemeral
        for op in dag.operators() {
            op.finish().await;
        }
        if let Err(e) = tokio::fs::remove_dir_all(dag.run_dir()).await {
            tracing::debug!("Unable to remove preview directory: {}", e);
        }

        let failure = match outcome {
            Ok(()) => None,
            Err(e) if e.is_internal() => return Err(e.into()),
            Err(e) => Some(e.to_failure()),
        };

        Ok(PreviewResult {
            run_id,
            status: state.status(),
            operators,
            artifacts,
            failure,
        })
    }

    /// Launch an out-of-band job that executes the workflow; returns right away
    pub async fn trigger_workflow(
        &self,
        workflow_id: WorkflowId,
        name: &str,
        time: TimeConfig,
        parameters: HashMap<String, String>,
    ) -> Result<ExecutionStatus, EngineError> {
        self.workflow(&workflow_id).await?;

        let job_name = format!("{}-{}", name, Utc::now().timestamp());
        let spec = JobSpec::Workflow(WorkflowJob {
            job_name: job_name.clone(),
            workflow_id,
            parameters,
            time_config: time,
        });
        self.scheduler.launch(&job_name, &spec).await?;

        tracing::info!("Triggered workflow {} as job {}", workflow_id, job_name);
        Ok(ExecutionStatus::Pending)
    }

    /// Install a recurring trigger for the workflow
    pub async fn schedule_workflow(
        &self,
        workflow_id: WorkflowId,
        name: &str,
        period: &str,
    ) -> Result<(), EngineError> {
        self.workflow(&workflow_id).await?;
        validate_period(period)?;

        self.scheduler
            .deploy_cron_job(&cron_job_name(&workflow_id), period, &self.workflow_job(workflow_id, name))
            .await?;
        self.stores
            .index
            .update_schedule(&workflow_id, &Schedule::periodic(period))
            .await?;
        Ok(())
    }

    /// Move the workflow's trigger to a new schedule, editing the entry in place
    pub async fn edit_schedule(
        &self,
        workflow_id: WorkflowId,
        schedule: Schedule,
    ) -> Result<(), EngineError> {
        let record = self.workflow(&workflow_id).await?;
        if let Some(period) = schedule.active_period() {
            validate_period(period)?;
        }

        let cron_name = cron_job_name(&workflow_id);
        let exists = self.scheduler.cron_job_exists(&cron_name).await?;

        match (exists, schedule.active_period()) {
            (false, Some(period)) => {
                self.scheduler
                    .deploy_cron_job(&cron_name, period, &self.workflow_job(workflow_id, &record.name))
                    .await?;
            }
            (true, Some(period)) => {
                self.scheduler.edit_cron_job(&cron_name, period).await?;
            }
            // Keep the entry so resuming reuses it
            (true, None) => {
                self.scheduler.edit_cron_job(&cron_name, "").await?;
            }
            (false, None) => {}
        }

        self.stores.index.update_schedule(&workflow_id, &schedule).await?;
        tracing::info!(
            "Schedule of workflow {} is now {:?} (paused: {})",
            record.name,
            schedule.cron_schedule,
            schedule.paused
        );
        Ok(())
    }

    /// Remove the workflow's recurring trigger, if any
    pub async fn unschedule_workflow(&self, workflow_id: WorkflowId) -> Result<(), EngineError> {
        let cron_name = cron_job_name(&workflow_id);
        if self.scheduler.cron_job_exists(&cron_name).await? {
            self.scheduler.delete_cron_job(&cron_name).await?;
        }
        if self.stores.index.get_workflow(&workflow_id).await?.is_some() {
            self.stores
                .index
                .update_schedule(&workflow_id, &Schedule::default())
                .await?;
        }
        Ok(())
    }

    pub async fn list_workflows(&self) -> Result<Vec<WorkflowRecord>, EngineError> {
        Ok(self.stores.index.list_workflows().await?)
    }

    pub async fn list_runs(&self) -> Result<Vec<Run>, EngineError> {
        Ok(self.stores.index.list_runs().await?)
    }

    /// A run summary with the results recorded for it
    pub async fn run_details(&self, run_id: RunId) -> Result<Option<(Run, Vec<Event>)>, EngineError> {
        let Some(run) = self.stores.index.get_run(&run_id).await? else {
            return Ok(None);
        };
        let events = self.stores.event_log.get_run_events(run_id).await?;
        Ok(Some((run, events)))
    }

    /// Stored content of an artifact, by the hash recorded in its result
    pub async fn artifact_content(&self, hash: &BlobHash) -> Result<Option<Bytes>, EngineError> {
        Ok(self.stores.blob_store.get(hash).await?)
    }

    fn workflow_job(&self, workflow_id: WorkflowId, name: &str) -> JobSpec {
        JobSpec::Workflow(WorkflowJob {
            job_name: name.to_string(),
            workflow_id,
            parameters: HashMap::new(),
            time_config: self.scheduled_time,
        })
    }

    async fn workflow(&self, workflow_id: &WorkflowId) -> Result<WorkflowRecord, EngineError> {
        self.stores
            .index
            .get_workflow(workflow_id)
            .await?
            .ok_or_else(|| EngineError::WorkflowNotFound(workflow_id.to_string()))
    }
}

fn validate_period(period: &str) -> Result<(), EngineError> {
    match parse_period(period) {
        Ok(Some(_)) => Ok(()),
        Ok(None) => Err(EngineError::InvalidSchedule("empty cron expression".to_string())),
        Err(e) => Err(EngineError::InvalidSchedule(e.to_string())),
    }
}

/// Override the values of parameter operators by name
fn apply_parameters(spec: &mut DagSpec, parameters: &HashMap<String, String>) -> Result<(), EngineError> {
    for (name, value) in parameters {
        let Some(op) = spec.operators.iter_mut().find(|op| &op.name == name) else {
            tracing::debug!("Ignoring parameter {}: no such operator", name);
            continue;
        };
        match &mut op.spec {
            OperatorSpec::Param { val } => *val = value.clone(),
            _ => return Err(EngineError::InvalidParameter { name: name.clone() }),
        }
    }
    Ok(())
}
