//! Job backends: the substrate that runs operator code out of process.
//!
//! The orchestrator only talks to [`JobBackend`]. Which implementation sits
//! behind it is decided once, from configuration, by [`new_job_backend`].

pub mod config;
pub mod process;

pub use config::{new_job_backend, BackendFactory, ConfiguredBackends, JobBackendConfig, ProcessConfig};
pub use process::ProcessBackend;

use crate::error::JobError;
use crate::types::*;
use anyhow::Context;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Environment variable carrying the encoded [`JobSpec`] into a job process
pub const JOB_SPEC_ENV: &str = "JOB_SPEC";

/// Outcome of polling a job
#[derive(Debug, Clone, PartialEq)]
pub struct PollResult {
    pub status: ExecutionStatus,
    pub failure_type: Option<FailureType>,
    /// Richer explanation of a failure, e.g. the job ran out of memory
    pub diagnosis: Option<JobError>,
}

impl PollResult {
    pub fn running() -> Self {
        Self::status(ExecutionStatus::Running)
    }

    pub fn succeeded() -> Self {
        Self::status(ExecutionStatus::Succeeded)
    }

    pub fn failed(failure_type: FailureType) -> Self {
        Self {
            status: ExecutionStatus::Failed,
            failure_type: Some(failure_type),
            diagnosis: None,
        }
    }

    pub fn status(status: ExecutionStatus) -> Self {
        Self {
            status,
            failure_type: None,
            diagnosis: None,
        }
    }

    pub fn with_diagnosis(mut self, diagnosis: JobError) -> Self {
        self.diagnosis = Some(diagnosis);
        self
    }
}

/// Launch specification for a single operator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorJob {
    pub job_name: String,
    pub operator_id: OperatorId,
    pub operator_name: String,
    pub spec: OperatorSpec,
    pub input_paths: Vec<PathBuf>,
    pub output_paths: Vec<PathBuf>,
    /// Where the job writes its own execution state
    pub metadata_path: PathBuf,
}

/// Launch specification for an out-of-band workflow run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowJob {
    pub job_name: String,
    pub workflow_id: WorkflowId,
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    #[serde(default)]
    pub time_config: TimeConfig,
}

/// What a backend is asked to run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobSpec {
    Operator(OperatorJob),
    Workflow(WorkflowJob),
}

impl JobSpec {
    pub fn job_name(&self) -> &str {
        match self {
            Self::Operator(job) => &job.job_name,
            Self::Workflow(job) => &job.job_name,
        }
    }

    /// Same spec under another job name
    pub fn renamed(&self, job_name: impl Into<String>) -> Self {
        let mut spec = self.clone();
        match &mut spec {
            Self::Operator(job) => job.job_name = job_name.into(),
            Self::Workflow(job) => job.job_name = job_name.into(),
        }
        spec
    }

    /// Base64-encoded JSON, as passed in [`JOB_SPEC_ENV`]
    pub fn encode(&self) -> Result<String, JobError> {
        let json = serde_json::to_vec(self)
            .map_err(|e| JobError::System(format!("unable to encode job spec: {}", e)))?;
        Ok(base64::engine::general_purpose::STANDARD.encode(json))
    }

    pub fn decode(encoded: &str) -> anyhow::Result<Self> {
        let json = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .context("Job spec is not valid base64")?;
        serde_json::from_slice(&json).context("Job spec is not a valid spec")
    }
}

/// Capability interface every job backend implements
#[async_trait::async_trait]
pub trait JobBackend: Send + Sync {
    /// Short name of the backend, for logs
    fn kind(&self) -> &'static str;

    /// Start a job; returns once the job is submitted, not finished
    async fn launch(&self, name: &str, spec: &JobSpec) -> Result<(), JobError>;

    /// Current status of a job, without side effects
    async fn poll(&self, name: &str) -> Result<PollResult, JobError>;

    /// Install a recurring trigger that launches `spec` on every tick of `period`
    async fn deploy_cron_job(&self, name: &str, period: &str, spec: &JobSpec) -> Result<(), JobError>;

    async fn cron_job_exists(&self, name: &str) -> Result<bool, JobError>;

    /// Change the recurrence of a trigger; an empty period pauses it
    async fn edit_cron_job(&self, name: &str, period: &str) -> Result<(), JobError>;

    async fn delete_cron_job(&self, name: &str) -> Result<(), JobError>;
}
