use super::{JobBackend, ProcessBackend};
use crate::error::JobError;
use crate::types::EngineConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

/// Settings of the local-process backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessConfig {
    /// Binary that runs a single operator
    #[serde(default = "default_executor_binary")]
    pub executor_binary: PathBuf,

    /// Binary invoked with `run-job` for out-of-band workflow runs; defaults to the current executable
    #[serde(default)]
    pub workflow_binary: Option<PathBuf>,

    #[serde(default = "default_operator_storage_dir")]
    pub operator_storage_dir: PathBuf,

    #[serde(default = "default_logs_dir")]
    pub logs_dir: PathBuf,

    /// Conda environment operators run in, if any
    #[serde(default)]
    pub conda_env: Option<String>,
}

fn default_executor_binary() -> PathBuf {
    PathBuf::from("opflow-executor")
}

fn default_operator_storage_dir() -> PathBuf {
    PathBuf::from("operators")
}

fn default_logs_dir() -> PathBuf {
    PathBuf::from("logs")
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            executor_binary: default_executor_binary(),
            workflow_binary: None,
            operator_storage_dir: default_operator_storage_dir(),
            logs_dir: default_logs_dir(),
            conda_env: None,
        }
    }
}

/// Which job backend to construct
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobBackendConfig {
    Process(ProcessConfig),
    K8s {
        cluster_name: String,
        kubeconfig_path: Option<String>,
    },
    Lambda {
        role_arn: String,
    },
    Databricks {
        workspace_url: String,
    },
    Spark {
        livy_server_url: String,
    },
}

impl JobBackendConfig {
    /// Backend configuration for a workflow's engine
    pub fn for_engine(engine: &EngineConfig, process: &ProcessConfig) -> Self {
        match engine {
            EngineConfig::Process => Self::Process(process.clone()),
            EngineConfig::Conda { env } => Self::Process(ProcessConfig {
                conda_env: Some(env.clone()),
                ..process.clone()
            }),
            EngineConfig::K8s {
                cluster_name,
                kubeconfig_path,
            } => Self::K8s {
                cluster_name: cluster_name.clone(),
                kubeconfig_path: kubeconfig_path.clone(),
            },
            EngineConfig::Lambda { role_arn } => Self::Lambda {
                role_arn: role_arn.clone(),
            },
            EngineConfig::Databricks { workspace_url } => Self::Databricks {
                workspace_url: workspace_url.clone(),
            },
            EngineConfig::Spark { livy_server_url } => Self::Spark {
                livy_server_url: livy_server_url.clone(),
            },
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Process(_) => "process",
            Self::K8s { .. } => "k8s",
            Self::Lambda { .. } => "lambda",
            Self::Databricks { .. } => "databricks",
            Self::Spark { .. } => "spark",
        }
    }
}

/// Construct the job backend described by `config`
pub fn new_job_backend(config: &JobBackendConfig) -> Result<Arc<dyn JobBackend>, JobError> {
    match config {
        JobBackendConfig::Process(process) => Ok(Arc::new(ProcessBackend::new(process.clone())?)),
        other => Err(JobError::System(format!(
            "{} engine is not available in this build",
            other.kind()
        ))),
    }
}

/// Source of job backends for the engine a DAG runs on
pub trait BackendFactory: Send + Sync {
    fn for_engine(&self, engine: &EngineConfig) -> Result<Arc<dyn JobBackend>, JobError>;
}

/// Builds backends from configuration through [`new_job_backend`]
#[derive(Debug, Clone, Default)]
pub struct ConfiguredBackends {
    process: ProcessConfig,
}

impl ConfiguredBackends {
    pub fn new(process: ProcessConfig) -> Self {
        Self { process }
    }
}

impl BackendFactory for ConfiguredBackends {
    fn for_engine(&self, engine: &EngineConfig) -> Result<Arc<dyn JobBackend>, JobError> {
        new_job_backend(&JobBackendConfig::for_engine(engine, &self.process))
    }
}
