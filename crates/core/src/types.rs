use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

uuid_id!(
    /// Unique identifier for a workflow run
    RunId
);
uuid_id!(
    /// Unique identifier for a registered workflow
    WorkflowId
);
uuid_id!(
    /// Unique identifier for one version of a workflow's DAG
    DagId
);
uuid_id!(
    /// Unique identifier for an operator
    OperatorId
);
uuid_id!(
    /// Unique identifier for an artifact
    ArtifactId
);

/// Content-addressed blob hash (SHA-256)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobHash(pub String);

impl BlobHash {
    pub fn from_bytes(data: &[u8]) -> Self {
        use sha2::{Digest, Sha256};
        let hash = Sha256::digest(data);
        Self(hex::encode(hash))
    }
}

impl std::fmt::Display for BlobHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for BlobHash {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit()) {
            Ok(Self(s.to_ascii_lowercase()))
        } else {
            Err(format!("invalid blob hash `{}`: expected 64 hex characters", s))
        }
    }
}

/// Status of an operator, a job, or a whole run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Classification of a terminal failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureType {
    /// Infrastructure malfunction
    System,
    /// Failure caused by the operator's code or configuration
    User,
    /// User failure that should not stop the run, e.g. a warning-level check
    UserNonFatal,
}

impl std::fmt::Display for FailureType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::System => "system",
            Self::User => "user",
            Self::UserNonFatal => "user_non_fatal",
        };
        f.write_str(s)
    }
}

/// Error details surfaced alongside a failed execution state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub context: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tip: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionTimestamps {
    pub registered_at: Option<DateTime<Utc>>,
    pub pending_at: Option<DateTime<Utc>>,
    pub running_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Last known execution state of an operator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_type: Option<FailureType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    #[serde(default)]
    pub timestamps: ExecutionTimestamps,
}

impl ExecutionState {
    pub fn pending() -> Self {
        let now = Utc::now();
        Self {
            status: ExecutionStatus::Pending,
            failure_type: None,
            error: None,
            timestamps: ExecutionTimestamps {
                registered_at: Some(now),
                pending_at: Some(now),
                ..Default::default()
            },
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Compute resources requested by a function operator
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceConfig {
    pub num_cpus: Option<u32>,
    pub memory_mb: Option<u64>,
    pub gpu_resource_name: Option<String>,
    pub cuda_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionSpec {
    /// Location of the packaged operator code
    pub storage_path: String,
    pub entry_point: String,
    #[serde(default)]
    pub resources: Option<ResourceConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorSpec {
    pub connector: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

/// Typed specification of an operator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OperatorSpec {
    Function(FunctionSpec),
    Param { val: String },
    Extract(ConnectorSpec),
    Load(ConnectorSpec),
    Metric(FunctionSpec),
    Check {
        #[serde(flatten)]
        function: FunctionSpec,
        severity: CheckSeverity,
    },
    SystemMetric { metric_name: String },
    Discover(ConnectorSpec),
    Authenticate(ConnectorSpec),
}

impl OperatorSpec {
    pub fn is_param(&self) -> bool {
        matches!(self, Self::Param { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Function(_) => "function",
            Self::Param { .. } => "param",
            Self::Extract(_) => "extract",
            Self::Load(_) => "load",
            Self::Metric(_) => "metric",
            Self::Check { .. } => "check",
            Self::SystemMetric { .. } => "system_metric",
            Self::Discover(_) => "discover",
            Self::Authenticate(_) => "authenticate",
        }
    }
}

/// Declared type of an artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    Table,
    Numeric,
    Boolean,
    String,
    Json,
    Bytes,
}

/// Engine a workflow's operators run on
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineConfig {
    #[default]
    Process,
    Conda { env: String },
    K8s { cluster_name: String, kubeconfig_path: Option<String> },
    Lambda { role_arn: String },
    Databricks { workspace_url: String },
    Spark { livy_server_url: String },
}

/// Operator as described in a serialized DAG
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorDef {
    pub id: OperatorId,
    pub name: String,
    pub spec: OperatorSpec,
    #[serde(default)]
    pub inputs: Vec<ArtifactId>,
    #[serde(default)]
    pub outputs: Vec<ArtifactId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactDef {
    pub id: ArtifactId,
    pub name: String,
    #[serde(rename = "type")]
    pub artifact_type: ArtifactType,
}

/// Serialized description of one DAG version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DagSpec {
    pub id: DagId,
    pub workflow_id: WorkflowId,
    #[serde(default)]
    pub engine: EngineConfig,
    pub operators: Vec<OperatorDef>,
    #[serde(default)]
    pub artifacts: Vec<ArtifactDef>,
}

impl DagSpec {
    pub fn operator_by_name(&self, name: &str) -> Option<&OperatorDef> {
        self.operators.iter().find(|op| op.name == name)
    }
}

/// Recurrence of a workflow
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    /// Cron expression (e.g., "0 0 * * *" for daily at midnight); `None` means manual
    #[serde(default)]
    pub cron_schedule: Option<String>,
    #[serde(default)]
    pub paused: bool,
}

impl Schedule {
    pub fn periodic(cron: impl Into<String>) -> Self {
        Self {
            cron_schedule: Some(cron.into()),
            paused: false,
        }
    }

    /// The recurrence to install, if the schedule is periodic and not paused
    pub fn active_period(&self) -> Option<&str> {
        if self.paused {
            return None;
        }
        self.cron_schedule.as_deref().filter(|c| !c.trim().is_empty())
    }
}

/// A workflow as stored in the index
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub id: WorkflowId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub schedule: Schedule,
    pub dag: DagSpec,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Timing budgets for one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeConfig {
    /// Wait between two sweeps over in-progress operators
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,
    /// Wall-clock budget for the whole run
    #[serde(with = "duration_ms")]
    pub exec_timeout: Duration,
    /// Grace period for in-flight operators after the run has ended
    #[serde(with = "duration_ms")]
    pub cleanup_timeout: Duration,
}

impl Default for TimeConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(300),
            exec_timeout: Duration::from_secs(15 * 60),
            cleanup_timeout: Duration::from_secs(60),
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Why a run failed, as shown to callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFailure {
    /// Operator the failure is attributed to, if any
    pub operator: Option<String>,
    pub failure_type: Option<FailureType>,
    pub timed_out: bool,
    pub message: String,
}

/// Final state of one operator within a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorExecution {
    pub id: OperatorId,
    pub name: String,
    pub state: ExecutionState,
}

/// A specific execution of a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub workflow_id: WorkflowId,
    pub dag_id: DagId,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    #[serde(default)]
    pub failure: Option<RunFailure>,
    pub operators: Vec<OperatorExecution>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(ExecutionStatus::Succeeded.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(!ExecutionStatus::Unknown.is_terminal());
    }

    #[test]
    fn test_blob_hash_parse() {
        let hash = BlobHash::from_bytes(b"0.93");
        assert_eq!(hash.to_string().parse::<BlobHash>().unwrap(), hash);
        assert_eq!(
            hash.0.to_ascii_uppercase().parse::<BlobHash>().unwrap(),
            hash
        );
        assert!("ab".parse::<BlobHash>().is_err());
        assert!("../".repeat(22)[..64].parse::<BlobHash>().is_err());
    }

    #[test]
    fn test_schedule_active_period() {
        assert_eq!(Schedule::periodic("*/5 * * * *").active_period(), Some("*/5 * * * *"));
        assert_eq!(Schedule::default().active_period(), None);

        let paused = Schedule {
            cron_schedule: Some("0 * * * *".to_string()),
            paused: true,
        };
        assert_eq!(paused.active_period(), None);
    }

    #[test]
    fn test_operator_spec_serde() {
        let spec: OperatorSpec = serde_json::from_value(serde_json::json!({
            "type": "check",
            "storage_path": "ops/check.zip",
            "entry_point": "main",
            "severity": "warning",
        }))
        .unwrap();

        assert_eq!(spec.kind(), "check");
        match spec {
            OperatorSpec::Check { function, severity } => {
                assert_eq!(function.entry_point, "main");
                assert_eq!(severity, CheckSeverity::Warning);
            }
            other => panic!("unexpected spec {:?}", other),
        }

        let param: OperatorSpec =
            serde_json::from_value(serde_json::json!({"type": "param", "val": "\"5\""})).unwrap();
        assert!(param.is_param());
    }

    #[test]
    fn test_time_config_serde_in_millis() {
        let config = TimeConfig {
            poll_interval: Duration::from_millis(250),
            exec_timeout: Duration::from_secs(10),
            cleanup_timeout: Duration::from_secs(2),
        };
        let json = serde_json::to_value(config).unwrap();
        assert_eq!(json["poll_interval"], 250);
        assert_eq!(json["exec_timeout"], 10_000);

        let back: TimeConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back, config);
    }
}
