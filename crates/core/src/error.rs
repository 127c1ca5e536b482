//! Error types for orchestration.
//!
//! Three layers: [`JobError`] comes from job backends, [`RunError`] is the
//! outcome of one orchestration loop, and [`EngineError`] is what the
//! entrypoints return. [`InternalError`] is kept apart from all of them so
//! orchestrator defects never blend in with legitimate run failures.

use crate::types::{ArtifactId, ExecutionStatus, FailureType, OperatorId, RunFailure};
use std::time::Duration;

/// Error raised by a job backend
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum JobError {
    /// Infrastructure malfunction.
    #[error("system error: {0}")]
    System(String),

    /// Job-level misconfiguration, e.g. an unsupported resource request.
    #[error("user error: {0}")]
    User(String),

    /// The backend has no record of the job.
    #[error("job {0} not found")]
    JobMissing(String),
}

impl JobError {
    pub fn failure_type(&self) -> FailureType {
        match self {
            Self::System(_) | Self::JobMissing(_) => FailureType::System,
            Self::User(_) => FailureType::User,
        }
    }
}

/// Broken orchestrator invariant; never retried
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InternalError {
    #[error("internal error: operator {operator} has a negative dependency count")]
    NegativeDependencyCount { operator: OperatorId },

    #[error("internal error: operator {operator} was completed twice")]
    CompletedTwice { operator: OperatorId },

    #[error("internal error: operator {operator} was expected to have terminated, but has status {status}")]
    UnexpectedStatus {
        operator: String,
        status: ExecutionStatus,
    },

    #[error("internal error: {total} operators were provided but only {completed} completed")]
    IncompleteRun { total: usize, completed: usize },

    #[error("internal error: operator {operator} has a non-zero dependency count {count}")]
    NonZeroDependencyCount { operator: OperatorId, count: usize },

    #[error("internal error: operator {0} is not part of the dag")]
    UnknownOperator(OperatorId),

    #[error("internal error: artifact {0} is not part of the dag")]
    UnknownArtifact(ArtifactId),
}

/// Error building a DAG from its description
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DagError {
    #[error("duplicate operator id {0}")]
    DuplicateOperator(OperatorId),

    #[error("duplicate artifact id {0}")]
    DuplicateArtifact(ArtifactId),

    #[error("operator {operator} references unknown artifact {artifact}")]
    UnknownArtifact {
        operator: String,
        artifact: ArtifactId,
    },

    #[error("artifact {artifact} has more than one producer")]
    MultipleProducers { artifact: ArtifactId },

    #[error("artifact {artifact} is consumed but never produced")]
    MissingProducer { artifact: ArtifactId },

    #[error("dag contains circular dependencies")]
    Cycle,

    #[error("dag has no operators")]
    Empty,
}

/// Fatal outcome of an orchestration loop
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("no initial operators to schedule")]
    NoEntryPoint,

    #[error("reached timeout of {limit:?} waiting for workflow to complete")]
    Timeout { limit: Duration },

    #[error("unable to schedule operator {operator}")]
    Launch {
        operator: String,
        #[source]
        source: JobError,
    },

    #[error("unable to poll operator {operator}")]
    Poll {
        operator: String,
        #[source]
        source: JobError,
    },

    #[error("error when persisting result of operator {operator}")]
    Persist {
        operator: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("operator {operator} failed with {failure_type} failure: {message}")]
    OperatorFailed {
        operator: String,
        failure_type: FailureType,
        message: String,
    },

    #[error("unable to initialize run results")]
    Initialize(#[source] anyhow::Error),

    #[error("invalid dag: {0}")]
    Dag(#[from] DagError),

    #[error(transparent)]
    Internal(#[from] InternalError),
}

impl RunError {
    pub fn is_internal(&self) -> bool {
        matches!(self, Self::Internal(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Operator the failure is attributed to
    pub fn operator(&self) -> Option<&str> {
        match self {
            Self::Launch { operator, .. }
            | Self::Poll { operator, .. }
            | Self::Persist { operator, .. }
            | Self::OperatorFailed { operator, .. } => Some(operator),
            _ => None,
        }
    }

    pub fn failure_type(&self) -> Option<FailureType> {
        match self {
            Self::Launch { source, .. } | Self::Poll { source, .. } => Some(source.failure_type()),
            Self::Persist { .. } | Self::Initialize(_) | Self::Internal(_) | Self::Dag(_) => {
                Some(FailureType::System)
            }
            Self::OperatorFailed { failure_type, .. } => Some(*failure_type),
            Self::NoEntryPoint | Self::Timeout { .. } => None,
        }
    }

    pub fn to_failure(&self) -> RunFailure {
        RunFailure {
            operator: self.operator().map(str::to_string),
            failure_type: self.failure_type(),
            timed_out: self.is_timeout(),
            message: format_chain(self),
        }
    }
}

/// Error returned by the engine entrypoints
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("error when executing workflow: {0}")]
    Run(#[from] RunError),

    #[error("workflow {0} not found")]
    WorkflowNotFound(String),

    #[error("cannot set parameters on non-parameter operator {name}")]
    InvalidParameter { name: String },

    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("job backend error: {0}")]
    Backend(#[from] JobError),

    #[error("invalid dag: {0}")]
    Dag(#[from] DagError),

    #[error("internal error: {0}")]
    Internal(#[from] InternalError),

    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

fn format_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_error_classification() {
        assert_eq!(JobError::System("boom".into()).failure_type(), FailureType::System);
        assert_eq!(JobError::JobMissing("j".into()).failure_type(), FailureType::System);
        assert_eq!(JobError::User("oom".into()).failure_type(), FailureType::User);
    }

    #[test]
    fn test_run_failure_keeps_classification() {
        let err = RunError::Launch {
            operator: "extract".to_string(),
            source: JobError::User("unsupported gpu".to_string()),
        };
        let failure = err.to_failure();
        assert_eq!(failure.operator.as_deref(), Some("extract"));
        assert_eq!(failure.failure_type, Some(FailureType::User));
        assert!(!failure.timed_out);
        assert!(failure.message.contains("unsupported gpu"));
    }

    #[test]
    fn test_timeout_is_distinct() {
        let err = RunError::Timeout {
            limit: Duration::from_secs(1),
        };
        let failure = err.to_failure();
        assert!(failure.timed_out);
        assert!(failure.operator.is_none());
        assert!(failure.failure_type.is_none());
        assert!(!err.is_internal());
    }
}
