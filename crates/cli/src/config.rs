use anyhow::{Context, Result};
use opflow_core::engine::{Engine, EngineStores};
use opflow_core::job::{ConfiguredBackends, JobBackend, ProcessBackend, ProcessConfig};
use opflow_core::policy::FailurePolicy;
use opflow_core::storage::{FilesystemBlobStore, JsonlEventLog, RedbIndexStore};
use opflow_core::{FailureType, TimeConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpflowConfig {
    #[serde(skip)]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    #[serde(default)]
    pub process: ProcessConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_blob_dir")]
    pub blob_dir: String,

    #[serde(default = "default_event_log_dir")]
    pub event_log_dir: String,

    #[serde(default = "default_index_file")]
    pub index_file: String,
}

fn default_blob_dir() -> String {
    "blobs".to_string()
}

fn default_event_log_dir() -> String {
    "events".to_string()
}

fn default_index_file() -> String {
    "index.redb".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            blob_dir: default_blob_dir(),
            event_log_dir: default_event_log_dir(),
            index_file: default_index_file(),
        }
    }
}

/// Timing and failure policy of runs started from this binary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_exec_timeout_secs")]
    pub exec_timeout_secs: u64,

    #[serde(default = "default_cleanup_timeout_secs")]
    pub cleanup_timeout_secs: u64,

    /// Failure types that do not stop a run
    #[serde(default = "default_tolerated_failures")]
    pub tolerated_failures: Vec<FailureType>,
}

fn default_poll_interval_ms() -> u64 {
    300
}

fn default_exec_timeout_secs() -> u64 {
    15 * 60
}

fn default_cleanup_timeout_secs() -> u64 {
    60
}

fn default_tolerated_failures() -> Vec<FailureType> {
    vec![FailureType::UserNonFatal]
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            exec_timeout_secs: default_exec_timeout_secs(),
            cleanup_timeout_secs: default_cleanup_timeout_secs(),
            tolerated_failures: default_tolerated_failures(),
        }
    }
}

impl OrchestratorConfig {
    pub fn time_config(&self) -> TimeConfig {
        TimeConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            exec_timeout: Duration::from_secs(self.exec_timeout_secs),
            cleanup_timeout: Duration::from_secs(self.cleanup_timeout_secs),
        }
    }

    pub fn policy(&self) -> FailurePolicy {
        FailurePolicy::tolerate(self.tolerated_failures.iter().copied())
    }
}

impl OpflowConfig {
    pub fn load(config_path: &Path, data_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        let mut config: Self = if config_path.exists() {
            let content = std::fs::read_to_string(config_path)
                .context("Failed to read configuration file")?;
            toml::from_str(&content).context("Failed to parse configuration file")?
        } else {
            tracing::debug!("Configuration file not found, using defaults");
            Self {
                data_dir: data_dir.clone(),
                storage: Default::default(),
                orchestrator: Default::default(),
                process: Default::default(),
            }
        };

        config.data_dir = data_dir;
        config.process = config.resolved_process();

        Ok(config)
    }

    /// Process settings with relative directories anchored in the data directory
    fn resolved_process(&self) -> ProcessConfig {
        let anchor = |path: &PathBuf| {
            if path.is_absolute() {
                path.clone()
            } else {
                self.data_dir.join(path)
            }
        };
        ProcessConfig {
            operator_storage_dir: anchor(&self.process.operator_storage_dir),
            logs_dir: anchor(&self.process.logs_dir),
            ..self.process.clone()
        }
    }

    pub fn blob_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.blob_dir)
    }

    pub fn event_log_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.event_log_dir)
    }

    pub fn index_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.index_file)
    }

    /// Open the stores and wire an engine whose cron entries live on `scheduler`
    pub fn engine(&self, scheduler: Arc<dyn JobBackend>) -> Result<Engine> {
        let stores = EngineStores {
            index: Arc::new(
                RedbIndexStore::new(self.index_path()).context("Failed to create index store")?,
            ),
            event_log: Arc::new(
                JsonlEventLog::new(self.event_log_path()).context("Failed to create event log")?,
            ),
            blob_store: Arc::new(
                FilesystemBlobStore::new(self.blob_path())
                    .context("Failed to create blob store")?,
            ),
        };

        Ok(Engine::new(
            stores,
            Arc::new(ConfiguredBackends::new(self.process.clone())),
            scheduler,
            self.process.operator_storage_dir.clone(),
        )
        .with_policy(self.orchestrator.policy()))
    }

    pub fn scheduler(&self) -> Result<Arc<dyn JobBackend>> {
        Ok(Arc::new(
            ProcessBackend::new(self.process.clone()).context("Failed to create process backend")?,
        ))
    }
}
