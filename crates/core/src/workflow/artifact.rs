use crate::types::{ArtifactId, ArtifactType};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

/// Materialized view of an artifact, returned by previews
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PreviewPayload {
    Table {
        table_schema: serde_json::Value,
        data: serde_json::Value,
    },
    Metric {
        val: f64,
    },
    Check {
        passed: bool,
    },
    Param {
        val: String,
    },
}

/// Read-only view of an artifact during a run
#[async_trait::async_trait]
pub trait Artifact: Send + Sync {
    fn id(&self) -> ArtifactId;

    fn name(&self) -> &str;

    fn artifact_type(&self) -> ArtifactType;

    /// Whether the producing operator succeeded
    fn computed(&self) -> bool;

    /// Raw content, if the artifact was computed
    async fn content(&self) -> Option<Vec<u8>>;

    /// Preview payload for the artifact's type, if it has one
    async fn preview(&self) -> Option<PreviewPayload>;
}

/// Artifact whose content lives in a file under the run directory
pub struct DagArtifact {
    id: ArtifactId,
    name: String,
    artifact_type: ArtifactType,
    content_path: PathBuf,
    from_param: bool,
    computed: AtomicBool,
}

impl DagArtifact {
    pub fn new(
        id: ArtifactId,
        name: String,
        artifact_type: ArtifactType,
        content_path: PathBuf,
        from_param: bool,
    ) -> Self {
        Self {
            id,
            name,
            artifact_type,
            content_path,
            from_param,
            computed: AtomicBool::new(false),
        }
    }

    pub fn content_path(&self) -> &Path {
        &self.content_path
    }

    pub(crate) fn mark_computed(&self) {
        self.computed.store(true, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl Artifact for DagArtifact {
    fn id(&self) -> ArtifactId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn artifact_type(&self) -> ArtifactType {
        self.artifact_type
    }

    fn computed(&self) -> bool {
        self.computed.load(Ordering::SeqCst)
    }

    async fn content(&self) -> Option<Vec<u8>> {
        if !self.computed() {
            return None;
        }
        match tokio::fs::read(&self.content_path).await {
            Ok(content) => Some(content),
            Err(e) => {
                tracing::warn!("Unable to read content of artifact {}: {}", self.name, e);
                None
            }
        }
    }

    async fn preview(&self) -> Option<PreviewPayload> {
        let content = self.content().await?;
        let text = String::from_utf8_lossy(&content);

        if self.from_param {
            return Some(PreviewPayload::Param {
                val: text.into_owned(),
            });
        }

        match self.artifact_type {
            ArtifactType::Table => Some(table_preview(&text)),
            ArtifactType::Numeric => text
                .trim()
                .parse()
                .ok()
                .map(|val| PreviewPayload::Metric { val }),
            ArtifactType::Boolean => text
                .trim()
                .parse()
                .ok()
                .map(|passed| PreviewPayload::Check { passed }),
            ArtifactType::String | ArtifactType::Json | ArtifactType::Bytes => None,
        }
    }
}

// Tables are written as {"table_schema": ..., "data": ...}; anything else is shown as raw data
fn table_preview(text: &str) -> PreviewPayload {
    match serde_json::from_str::<serde_json::Value>(text) {
        Ok(mut value) if value.get("data").is_some() => PreviewPayload::Table {
            table_schema: value["table_schema"].take(),
            data: value["data"].take(),
        },
        _ => PreviewPayload::Table {
            table_schema: serde_json::Value::Null,
            data: serde_json::Value::String(text.to_string()),
        },
    }
}
