//! Test doubles shared by the unit tests.

use crate::error::JobError;
use crate::events::{Event, EventLog, EventType};
use crate::job::{JobBackend, JobSpec, PollResult};
use crate::types::*;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

/// Builds DAG descriptions where every operator produces one artifact
#[derive(Default)]
pub struct DagBuilder {
    operators: Vec<OperatorDef>,
    artifacts: Vec<ArtifactDef>,
}

impl DagBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an operator consuming the outputs of `upstream`; returns its handle
    pub fn operator(&mut self, name: &str, upstream: &[usize]) -> usize {
        self.add(
            name,
            OperatorSpec::Function(FunctionSpec {
                storage_path: format!("ops/{}.zip", name),
                entry_point: "main".to_string(),
                resources: None,
            }),
            ArtifactType::Table,
            upstream,
        )
    }

    pub fn param(&mut self, name: &str, val: &str) -> usize {
        self.add(
            name,
            OperatorSpec::Param {
                val: val.to_string(),
            },
            ArtifactType::String,
            &[],
        )
    }

    pub fn metric(&mut self, name: &str, upstream: &[usize]) -> usize {
        self.add(
            name,
            OperatorSpec::Metric(FunctionSpec {
                storage_path: format!("ops/{}.zip", name),
                entry_point: "main".to_string(),
                resources: None,
            }),
            ArtifactType::Numeric,
            upstream,
        )
    }

    fn add(
        &mut self,
        name: &str,
        spec: OperatorSpec,
        output_type: ArtifactType,
        upstream: &[usize],
    ) -> usize {
        let output = ArtifactDef {
            id: ArtifactId::new(),
            name: format!("{} output", name),
            artifact_type: output_type,
        };
        let inputs = upstream
            .iter()
            .map(|handle| self.operators[*handle].outputs[0])
            .collect();

        self.operators.push(OperatorDef {
            id: OperatorId::new(),
            name: name.to_string(),
            spec,
            inputs,
            outputs: vec![output.id],
        });
        self.artifacts.push(output);
        self.operators.len() - 1
    }

    pub fn id(&self, handle: usize) -> OperatorId {
        self.operators[handle].id
    }

    pub fn output(&self, handle: usize) -> ArtifactId {
        self.operators[handle].outputs[0]
    }

    pub fn build(&self) -> DagSpec {
        DagSpec {
            id: DagId::new(),
            workflow_id: WorkflowId::new(),
            engine: EngineConfig::Process,
            operators: self.operators.clone(),
            artifacts: self.artifacts.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CronCall {
    Deploy { name: String, period: String },
    Edit { name: String, period: String },
    Delete { name: String },
}

/// Backend that records launches and answers polls from per-operator scripts
///
/// A script's last answer repeats forever; operators without a script
/// succeed on their first poll.
#[derive(Default)]
pub struct ScriptedBackend {
    scripts: Mutex<HashMap<OperatorId, VecDeque<PollResult>>>,
    launch_errors: Mutex<HashMap<OperatorId, JobError>>,
    poll_errors: Mutex<HashMap<OperatorId, JobError>>,
    outputs: Mutex<HashMap<OperatorId, String>>,
    jobs: Mutex<HashMap<String, Option<OperatorId>>>,
    launches: Mutex<Vec<JobSpec>>,
    crons: Mutex<HashMap<String, String>>,
    cron_calls: Mutex<Vec<CronCall>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, operator: OperatorId, results: impl IntoIterator<Item = PollResult>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(operator, results.into_iter().collect());
    }

    pub fn fail_launch(&self, operator: OperatorId, error: JobError) {
        self.launch_errors.lock().unwrap().insert(operator, error);
    }

    pub fn fail_poll(&self, operator: OperatorId, error: JobError) {
        self.poll_errors.lock().unwrap().insert(operator, error);
    }

    /// Write `content` to the operator's outputs when it is launched, like a real executor
    pub fn produce(&self, operator: OperatorId, content: &str) {
        self.outputs
            .lock()
            .unwrap()
            .insert(operator, content.to_string());
    }

    pub fn launches(&self) -> Vec<JobSpec> {
        self.launches.lock().unwrap().clone()
    }

    pub fn launched_operators(&self) -> Vec<OperatorId> {
        self.launches()
            .iter()
            .filter_map(|spec| match spec {
                JobSpec::Operator(job) => Some(job.operator_id),
                JobSpec::Workflow(_) => None,
            })
            .collect()
    }

    pub fn cron_calls(&self) -> Vec<CronCall> {
        self.cron_calls.lock().unwrap().clone()
    }

    pub fn cron_period(&self, name: &str) -> Option<String> {
        self.crons.lock().unwrap().get(name).cloned()
    }
}

#[async_trait::async_trait]
impl JobBackend for ScriptedBackend {
    fn kind(&self) -> &'static str {
        "scripted"
    }

    async fn launch(&self, name: &str, spec: &JobSpec) -> Result<(), JobError> {
        let operator = match spec {
            JobSpec::Operator(job) => Some(job.operator_id),
            JobSpec::Workflow(_) => None,
        };
        if let Some(error) = operator.and_then(|id| self.launch_errors.lock().unwrap().get(&id).cloned()) {
            return Err(error);
        }

        if let JobSpec::Operator(job) = spec {
            if let Some(content) = self.outputs.lock().unwrap().get(&job.operator_id) {
                std::fs::create_dir_all(job.metadata_path.parent().unwrap()).unwrap();
                for path in &job.output_paths {
                    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
                    std::fs::write(path, content).unwrap();
                }
            }
        }

        self.jobs.lock().unwrap().insert(name.to_string(), operator);
        self.launches.lock().unwrap().push(spec.clone());
        Ok(())
    }

    async fn poll(&self, name: &str) -> Result<PollResult, JobError> {
        let operator = self
            .jobs
            .lock()
            .unwrap()
            .get(name)
            .copied()
            .ok_or_else(|| JobError::JobMissing(name.to_string()))?;

        let Some(operator) = operator else {
            return Ok(PollResult::running());
        };
        if let Some(error) = self.poll_errors.lock().unwrap().get(&operator).cloned() {
            return Err(error);
        }

        let mut scripts = self.scripts.lock().unwrap();
        let Some(script) = scripts.get_mut(&operator) else {
            return Ok(PollResult::succeeded());
        };
        let result = if script.len() > 1 {
            script.pop_front()
        } else {
            script.front().cloned()
        };
        Ok(result.unwrap_or_else(PollResult::succeeded))
    }

    async fn deploy_cron_job(&self, name: &str, period: &str, _spec: &JobSpec) -> Result<(), JobError> {
        self.crons
            .lock()
            .unwrap()
            .insert(name.to_string(), period.to_string());
        self.cron_calls.lock().unwrap().push(CronCall::Deploy {
            name: name.to_string(),
            period: period.to_string(),
        });
        Ok(())
    }

    async fn cron_job_exists(&self, name: &str) -> Result<bool, JobError> {
        Ok(self.crons.lock().unwrap().contains_key(name))
    }

    async fn edit_cron_job(&self, name: &str, period: &str) -> Result<(), JobError> {
        let mut crons = self.crons.lock().unwrap();
        let entry = crons
            .get_mut(name)
            .ok_or_else(|| JobError::JobMissing(name.to_string()))?;
        *entry = period.to_string();
        self.cron_calls.lock().unwrap().push(CronCall::Edit {
            name: name.to_string(),
            period: period.to_string(),
        });
        Ok(())
    }

    async fn delete_cron_job(&self, name: &str) -> Result<(), JobError> {
        self.crons
            .lock()
            .unwrap()
            .remove(name)
            .ok_or_else(|| JobError::JobMissing(name.to_string()))?;
        self.cron_calls.lock().unwrap().push(CronCall::Delete {
            name: name.to_string(),
        });
        Ok(())
    }
}

/// Event log that rejects the events matching `rejects` and forwards the rest
pub struct FailingEventLog {
    inner: Arc<dyn EventLog>,
    rejects: fn(&EventType) -> bool,
}

impl FailingEventLog {
    pub fn new(inner: Arc<dyn EventLog>, rejects: fn(&EventType) -> bool) -> Self {
        Self { inner, rejects }
    }
}

#[async_trait::async_trait]
impl EventLog for FailingEventLog {
    async fn append(&self, event: Event) -> anyhow::Result<()> {
        if (self.rejects)(&event.event_type) {
            anyhow::bail!("event log rejected {:?}", event.event_type);
        }
        self.inner.append(event).await
    }

    async fn flush(&self, run_id: RunId) -> anyhow::Result<()> {
        self.inner.flush(run_id).await
    }

    async fn get_run_events(&self, run_id: RunId) -> anyhow::Result<Vec<Event>> {
        self.inner.get_run_events(run_id).await
    }
}
