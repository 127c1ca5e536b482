use super::{JobBackend, JobSpec, PollResult, ProcessConfig, JOB_SPEC_ENV};
use crate::error::JobError;
use crate::scheduler::CronTable;
use crate::types::{ExecutionState, ExecutionStatus, FailureType};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::process::{Child, Command};

enum ProcessJob {
    /// Polled by the orchestrator, forgotten once a terminal status is returned
    Operator { child: Child, metadata_path: PathBuf },
    /// Awaited by a reaper task that removes the entry when the process exits
    Workflow,
}

struct Launcher {
    config: ProcessConfig,
    jobs: Mutex<HashMap<String, ProcessJob>>,
}

impl Launcher {
    fn jobs(&self) -> MutexGuard<'_, HashMap<String, ProcessJob>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn command(&self, spec: &JobSpec) -> Result<Command, JobError> {
        let mut command = match spec {
            JobSpec::Operator(_) => match &self.config.conda_env {
                Some(env) => {
                    let mut command = Command::new("conda");
                    command
                        .args(["run", "--no-capture-output", "-n", env])
                        .arg(&self.config.executor_binary);
                    command
                }
                None => Command::new(&self.config.executor_binary),
            },
            JobSpec::Workflow(_) => {
                let binary = match &self.config.workflow_binary {
                    Some(binary) => binary.clone(),
                    None => std::env::current_exe().map_err(|e| {
                        JobError::System(format!("unable to locate workflow binary: {}", e))
                    })?,
                };
                let mut command = Command::new(binary);
                command.arg("run-job");
                command
            }
        };
        command.env(JOB_SPEC_ENV, spec.encode()?);
        Ok(command)
    }

    fn log_files(&self, name: &str) -> Result<(Stdio, Stdio), JobError> {
        std::fs::create_dir_all(&self.config.logs_dir)
            .map_err(|e| JobError::System(format!("unable to create logs directory: {}", e)))?;

        let open = |suffix: &str| {
            std::fs::File::create(self.config.logs_dir.join(format!("{}.{}", name, suffix)))
                .map(Stdio::from)
                .map_err(|e| JobError::System(format!("unable to create log file for {}: {}", name, e)))
        };
        Ok((open("stdout")?, open("stderr")?))
    }

    fn spawn(self: &Arc<Self>, name: &str, spec: &JobSpec) -> Result<(), JobError> {
        let mut jobs = self.jobs();
        if jobs.contains_key(name) {
            return Err(JobError::User(format!("job {} is already running", name)));
        }

        let (stdout, stderr) = self.log_files(name)?;
        let mut command = self.command(spec)?;
        let child = command
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
            .map_err(|e| JobError::System(format!("unable to start job {}: {}", name, e)))?;

        tracing::debug!("Started job {} (pid {:?})", name, child.id());

        let job = match spec {
            JobSpec::Operator(job) => ProcessJob::Operator {
                child,
                metadata_path: job.metadata_path.clone(),
            },
            JobSpec::Workflow(_) => {
                self.reap(name.to_string(), child);
                ProcessJob::Workflow
            }
        };
        jobs.insert(name.to_string(), job);
        Ok(())
    }

    fn reap(self: &Arc<Self>, name: String, mut child: Child) {
        let launcher = Arc::clone(self);
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => tracing::info!("Workflow job {} exited with {}", name, status),
                Err(e) => tracing::warn!("Unable to wait for workflow job {}: {}", name, e),
            }
            launcher.jobs().remove(&name);
        });
    }
}

/// Runs jobs as local child processes and cron entries as in-process timers
pub struct ProcessBackend {
    launcher: Arc<Launcher>,
    crons: CronTable,
}

impl ProcessBackend {
    pub fn new(config: ProcessConfig) -> Result<Self, JobError> {
        std::fs::create_dir_all(&config.operator_storage_dir)
            .map_err(|e| JobError::System(format!("unable to create operator storage: {}", e)))?;

        let launcher = Arc::new(Launcher {
            config,
            jobs: Mutex::new(HashMap::new()),
        });
        let cron_launcher = launcher.clone();
        let crons = CronTable::new(Arc::new(move |name: &str, spec: &JobSpec| {
            cron_launcher.spawn(name, spec)
        }));

        Ok(Self { launcher, crons })
    }
}

#[async_trait::async_trait]
impl JobBackend for ProcessBackend {
    fn kind(&self) -> &'static str {
        "process"
    }

    async fn launch(&self, name: &str, spec: &JobSpec) -> Result<(), JobError> {
        self.launcher.spawn(name, spec)
    }

    async fn poll(&self, name: &str) -> Result<PollResult, JobError> {
        let (exit, metadata_path) = {
            let mut jobs = self.launcher.jobs();
            let (child, metadata_path) = match jobs.get_mut(name) {
                Some(ProcessJob::Operator {
                    child,
                    metadata_path,
                }) => (child, metadata_path.clone()),
                Some(ProcessJob::Workflow) => return Ok(PollResult::running()),
                None => return Err(JobError::JobMissing(name.to_string())),
            };

            let exit = child
                .try_wait()
                .map_err(|e| JobError::System(format!("unable to poll job {}: {}", name, e)))?;
            let Some(exit) = exit else {
                return Ok(PollResult::running());
            };
            jobs.remove(name);
            (exit, metadata_path)
        };

        if exit.success() {
            return Ok(PollResult::succeeded());
        }

        match exit.code() {
            Some(code) => {
                tracing::debug!("Job {} exited with code {}", name, code);
                let failure_type = reported_failure_type(&metadata_path).await;
                Ok(PollResult::failed(failure_type.unwrap_or(FailureType::User)))
            }
            // Terminated by a signal, most often the OOM killer
            None => Ok(PollResult::failed(FailureType::User).with_diagnosis(JobError::User(
                format!("job {} was killed, it may have run out of memory", name),
            ))),
        }
    }

    async fn deploy_cron_job(&self, name: &str, period: &str, spec: &JobSpec) -> Result<(), JobError> {
        self.crons.deploy(name, period, spec)
    }

    async fn cron_job_exists(&self, name: &str) -> Result<bool, JobError> {
        Ok(self.crons.exists(name))
    }

    async fn edit_cron_job(&self, name: &str, period: &str) -> Result<(), JobError> {
        self.crons.edit(name, period)
    }

    async fn delete_cron_job(&self, name: &str) -> Result<(), JobError> {
        self.crons.delete(name)
    }
}

/// Failure type the job wrote into its execution-state file
async fn reported_failure_type(path: &Path) -> Option<FailureType> {
    let content = tokio::fs::read(path).await.ok()?;
    match serde_json::from_slice::<ExecutionState>(&content) {
        Ok(state) if state.status == ExecutionStatus::Failed => state.failure_type,
        Ok(_) => None,
        Err(e) => {
            tracing::warn!("Ignoring unreadable execution state {}: {}", path.display(), e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{OperatorJob, WorkflowJob};
    use crate::types::{OperatorId, OperatorSpec, TimeConfig, WorkflowId};
    use std::time::Duration;
    use tempfile::TempDir;

    fn backend(temp_dir: &TempDir, executor: &str) -> ProcessBackend {
        ProcessBackend::new(ProcessConfig {
            executor_binary: PathBuf::from(executor),
            workflow_binary: Some(PathBuf::from("sleep")),
            operator_storage_dir: temp_dir.path().join("operators"),
            logs_dir: temp_dir.path().join("logs"),
            conda_env: None,
        })
        .unwrap()
    }

    fn operator_job(temp_dir: &TempDir, name: &str) -> JobSpec {
        JobSpec::Operator(OperatorJob {
            job_name: name.to_string(),
            operator_id: OperatorId::new(),
            operator_name: "extract".to_string(),
            spec: OperatorSpec::Param {
                val: "1".to_string(),
            },
            input_paths: vec![],
            output_paths: vec![],
            metadata_path: temp_dir.path().join("operators").join(name).join("exec_state.json"),
        })
    }

    async fn wait_terminal(backend: &ProcessBackend, name: &str) -> PollResult {
        for _ in 0..200 {
            let result = backend.poll(name).await.unwrap();
            if result.status.is_terminal() {
                return result;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("job {} never finished", name);
    }

    fn executor_script(temp_dir: &TempDir, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let script = temp_dir.path().join("executor.sh");
        std::fs::write(&script, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        script
    }

    #[tokio::test]
    async fn test_exit_codes_map_to_status() {
        let temp_dir = TempDir::new().unwrap();

        let ok = backend(&temp_dir, "true");
        ok.launch("op-ok", &operator_job(&temp_dir, "op-ok")).await.unwrap();
        assert_eq!(wait_terminal(&ok, "op-ok").await.status, ExecutionStatus::Succeeded);

        let failing = backend(&temp_dir, "false");
        failing
            .launch("op-fail", &operator_job(&temp_dir, "op-fail"))
            .await
            .unwrap();
        let result = wait_terminal(&failing, "op-fail").await;
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.failure_type, Some(FailureType::User));
    }

    #[tokio::test]
    async fn test_failure_type_from_execution_state_file() {
        let temp_dir = TempDir::new().unwrap();
        let backend = backend(&temp_dir, "false");
        let spec = operator_job(&temp_dir, "op-check");

        if let JobSpec::Operator(job) = &spec {
            std::fs::create_dir_all(job.metadata_path.parent().unwrap()).unwrap();
            let state = ExecutionState {
                status: ExecutionStatus::Failed,
                failure_type: Some(FailureType::UserNonFatal),
                ..ExecutionState::pending()
            };
            std::fs::write(&job.metadata_path, serde_json::to_vec(&state).unwrap()).unwrap();
        }

        backend.launch("op-check", &spec).await.unwrap();
        let result = wait_terminal(&backend, "op-check").await;
        assert_eq!(result.failure_type, Some(FailureType::UserNonFatal));
    }

    #[tokio::test]
    async fn test_duplicate_in_flight_name_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let script = executor_script(&temp_dir, "sleep 2");

        let backend = backend(&temp_dir, script.to_str().unwrap());
        let spec = operator_job(&temp_dir, "op-slow");

        backend.launch("op-slow", &spec).await.unwrap();
        assert_eq!(backend.poll("op-slow").await.unwrap().status, ExecutionStatus::Running);
        assert!(matches!(
            backend.launch("op-slow", &spec).await,
            Err(JobError::User(_))
        ));
    }

    #[tokio::test]
    async fn test_killed_job_is_a_user_failure() {
        let temp_dir = TempDir::new().unwrap();
        let script = executor_script(&temp_dir, "kill -KILL $$");
        let backend = backend(&temp_dir, script.to_str().unwrap());

        backend
            .launch("op-oom", &operator_job(&temp_dir, "op-oom"))
            .await
            .unwrap();
        let result = wait_terminal(&backend, "op-oom").await;

        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.failure_type, Some(FailureType::User));
        let diagnosis = result.diagnosis.unwrap();
        assert_eq!(diagnosis.failure_type(), FailureType::User);
        assert!(diagnosis.to_string().contains("out of memory"));
    }

    #[tokio::test]
    async fn test_terminal_operator_job_is_forgotten() {
        let temp_dir = TempDir::new().unwrap();
        let backend = backend(&temp_dir, "true");
        let spec = operator_job(&temp_dir, "op-once");

        backend.launch("op-once", &spec).await.unwrap();
        assert_eq!(
            wait_terminal(&backend, "op-once").await.status,
            ExecutionStatus::Succeeded
        );
        assert!(backend.launcher.jobs().is_empty());
        assert!(matches!(
            backend.poll("op-once").await,
            Err(JobError::JobMissing(_))
        ));

        // The name is free again
        backend.launch("op-once", &spec).await.unwrap();
        assert_eq!(
            wait_terminal(&backend, "op-once").await.status,
            ExecutionStatus::Succeeded
        );
    }

    #[tokio::test]
    async fn test_workflow_jobs_are_reaped() {
        let temp_dir = TempDir::new().unwrap();
        let backend = backend(&temp_dir, "true");

        // The workflow binary is `sleep`, which rejects `run-job` and exits at once
        for i in 0..5 {
            let name = format!("wf-{}", i);
            let spec = JobSpec::Workflow(WorkflowJob {
                job_name: name.clone(),
                workflow_id: WorkflowId::new(),
                parameters: HashMap::new(),
                time_config: TimeConfig::default(),
            });
            backend.launch(&name, &spec).await.unwrap();
        }

        for _ in 0..200 {
            if backend.launcher.jobs().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert!(backend.launcher.jobs().is_empty());
        assert!(matches!(
            backend.poll("wf-0").await,
            Err(JobError::JobMissing(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_job_is_missing() {
        let temp_dir = TempDir::new().unwrap();
        let backend = backend(&temp_dir, "true");
        assert!(matches!(
            backend.poll("nope").await,
            Err(JobError::JobMissing(_))
        ));
    }
}
