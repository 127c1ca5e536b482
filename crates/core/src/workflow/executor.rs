use super::dag::WorkflowDag;
use super::operator::Operator;
use super::run_state::RunState;
use crate::error::{InternalError, RunError};
use crate::job::JobBackend;
use crate::policy::FailurePolicy;
use crate::types::{ExecutionState, ExecutionStatus, FailureType, RunId, TimeConfig};
use std::sync::Arc;
use tokio::time::Instant;

/// Drives one run of a DAG to completion, failure or timeout
pub struct Orchestrator {
    run_id: RunId,
    dag: Arc<dyn WorkflowDag>,
    backend: Arc<dyn JobBackend>,
    time: TimeConfig,
    policy: FailurePolicy,
    persist_results: bool,
}

impl Orchestrator {
    pub fn new(
        run_id: RunId,
        dag: Arc<dyn WorkflowDag>,
        backend: Arc<dyn JobBackend>,
        time: TimeConfig,
    ) -> Self {
        Self {
            run_id,
            dag,
            backend,
            time,
            policy: FailurePolicy::default(),
            persist_results: false,
        }
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Persist each terminal operator's result as it completes
    pub fn persisting_results(mut self, persist: bool) -> Self {
        self.persist_results = persist;
        self
    }

    /// Run the loop, then give in-flight operators the cleanup grace period
    pub async fn run(&self, state: &mut RunState) -> Result<(), RunError> {
        tracing::info!(
            "Starting run {} on {} backend ({} operators)",
            self.run_id,
            self.backend.kind(),
            self.dag.operators().len()
        );
        state.set_status(ExecutionStatus::Running);

        let result = self.drive(state).await;
        self.wait_for_in_progress(state).await;

        match &result {
            Ok(()) => {
                state.set_status(ExecutionStatus::Succeeded);
                tracing::info!("Run {} succeeded", self.run_id);
            }
            Err(e) => {
                state.set_status(ExecutionStatus::Failed);
                tracing::error!("Run {} failed: {}", self.run_id, e);
            }
        }
        result
    }

    async fn drive(&self, state: &mut RunState) -> Result<(), RunError> {
        state.seed()?;
        let started = Instant::now();

        loop {
            if started.elapsed() > self.time.exec_timeout {
                return Err(RunError::Timeout {
                    limit: self.time.exec_timeout,
                });
            }

            for id in state.in_progress() {
                let op = self
                    .dag
                    .operator(&id)
                    .ok_or(InternalError::UnknownOperator(id))?;
                let exec_state = self.refresh(op.as_ref()).await?;

                match exec_state.status {
                    ExecutionStatus::Pending => {
                        self.launch(op.as_ref()).await?;
                        continue;
                    }
                    ExecutionStatus::Running => continue,
                    ExecutionStatus::Succeeded | ExecutionStatus::Failed => {}
                    status => {
                        return Err(InternalError::UnexpectedStatus {
                            operator: op.name().to_string(),
                            status,
                        }
                        .into())
                    }
                }

                if self.persist_results {
                    op.persist_result()
                        .await
                        .map_err(|source| RunError::Persist {
                            operator: op.name().to_string(),
                            source,
                        })?;
                }

                if self.policy.should_stop(&exec_state) {
                    return Err(operator_failure(op.name(), &exec_state));
                }
                if exec_state.status == ExecutionStatus::Failed {
                    tracing::warn!(
                        "Run {}: operator {} failed with a tolerated {} failure, continuing",
                        self.run_id,
                        op.name(),
                        exec_state.failure_type.unwrap_or(FailureType::System)
                    );
                }

                state.complete(id)?;
                for artifact in self.dag.operator_outputs(&id)? {
                    for consumer in self.dag.operators_on_artifact(&artifact)? {
                        state.release(consumer)?;
                    }
                }
                tracing::info!("Run {}: operator {} completed", self.run_id, op.name());
            }

            if !state.has_in_progress() {
                break;
            }
            tokio::time::sleep(self.time.poll_interval).await;
        }

        state.verify_finished()?;
        Ok(())
    }

    async fn launch(&self, op: &dyn Operator) -> Result<(), RunError> {
        let spec = op.job_spec();
        self.backend
            .launch(spec.job_name(), spec)
            .await
            .map_err(|source| RunError::Launch {
                operator: op.name().to_string(),
                source,
            })?;
        op.mark_launched();
        tracing::info!(
            "Run {}: launched {} operator {} as job {}",
            self.run_id,
            op.spec().kind(),
            op.name(),
            spec.job_name()
        );
        Ok(())
    }

    /// Poll a launched, unfinished operator and return its state
    async fn refresh(&self, op: &dyn Operator) -> Result<ExecutionState, RunError> {
        if op.exec_state().status == ExecutionStatus::Running {
            let result = self
                .backend
                .poll(op.job_spec().job_name())
                .await
                .map_err(|source| RunError::Poll {
                    operator: op.name().to_string(),
                    source,
                })?;
            op.observe(&result);
        }
        Ok(op.exec_state())
    }

    /// Wait, at most the cleanup timeout, for launched operators to finish
    async fn wait_for_in_progress(&self, state: &RunState) {
        // No deadline when the timeout is too large to represent
        let deadline = Instant::now().checked_add(self.time.cleanup_timeout);

        loop {
            let mut running = Vec::new();
            for id in state.in_progress() {
                let Some(op) = self.dag.operator(&id) else {
                    continue;
                };
                if op.exec_state().status != ExecutionStatus::Running {
                    continue;
                }
                match self.refresh(op.as_ref()).await {
                    Ok(exec_state) if !exec_state.is_terminal() => running.push(op.name().to_string()),
                    Ok(_) => {}
                    Err(e) => tracing::warn!("Run {}: {}", self.run_id, e),
                }
            }

            if running.is_empty() {
                return;
            }

            let now = Instant::now();
            let wait = match deadline {
                Some(deadline) if now >= deadline => {
                    tracing::warn!(
                        "Run {}: operators still running after cleanup timeout: {}",
                        self.run_id,
                        running.join(", ")
                    );
                    return;
                }
                Some(deadline) => self.time.poll_interval.min(deadline - now),
                None => self.time.poll_interval,
            };
            tokio::time::sleep(wait).await;
        }
    }
}

fn operator_failure(name: &str, state: &ExecutionState) -> RunError {
    RunError::OperatorFailed {
        operator: name.to_string(),
        failure_type: state.failure_type.unwrap_or(FailureType::System),
        message: state
            .error
            .as_ref()
            .map(|e| e.context.clone())
            .unwrap_or_else(|| "operator failed".to_string()),
    }
}
