use crate::types::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An event in a run's result log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub run_id: RunId,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
}

impl Event {
    pub fn new(run_id: RunId, event_type: EventType) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            run_id,
            timestamp: Utc::now(),
            event_type,
        }
    }
}

/// Types of events recorded for a run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventType {
    // Run lifecycle events
    RunStarted {
        workflow_id: WorkflowId,
        dag_id: DagId,
    },
    RunFinished {
        status: ExecutionStatus,
    },

    // Operator results
    OperatorResult {
        operator_id: OperatorId,
        name: String,
        state: ExecutionState,
    },

    // Artifact results
    ArtifactResult {
        artifact_id: ArtifactId,
        name: String,
        computed: bool,
        content_hash: Option<BlobHash>,
    },
}

/// Event log writer trait
#[async_trait::async_trait]
pub trait EventLog: Send + Sync {
    /// Append an event to the log
    async fn append(&self, event: Event) -> anyhow::Result<()>;

    /// Write any buffered events for a run to durable storage
    async fn flush(&self, run_id: RunId) -> anyhow::Result<()>;

    /// Get all events for a run
    async fn get_run_events(&self, run_id: RunId) -> anyhow::Result<Vec<Event>>;
}
