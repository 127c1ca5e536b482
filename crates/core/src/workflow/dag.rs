use super::artifact::{Artifact, DagArtifact};
use super::operator::{JobOperator, Operator};
use crate::error::{DagError, InternalError};
use crate::job::{JobSpec, OperatorJob};
use crate::storage::ResultStore;
use crate::types::*;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Topology and result hooks the orchestrator consumes
#[async_trait::async_trait]
pub trait WorkflowDag: Send + Sync {
    fn operators(&self) -> Vec<Arc<dyn Operator>>;

    fn operator(&self, id: &OperatorId) -> Option<Arc<dyn Operator>>;

    fn artifacts(&self) -> Vec<Arc<dyn Artifact>>;

    /// Artifacts the operator consumes
    fn operator_inputs(&self, id: &OperatorId) -> Result<Vec<ArtifactId>, InternalError>;

    /// Artifacts the operator produces
    fn operator_outputs(&self, id: &OperatorId) -> Result<Vec<ArtifactId>, InternalError>;

    /// Operators consuming the artifact
    fn operators_on_artifact(&self, id: &ArtifactId) -> Result<Vec<OperatorId>, InternalError>;

    async fn initialize_results(&self) -> anyhow::Result<()>;

    async fn persist_result(&self, status: ExecutionStatus) -> anyhow::Result<()>;
}

/// Where a DAG keeps its run-local files and results
pub struct DagContext {
    pub run_id: RunId,
    pub storage_root: PathBuf,
    /// `None` for runs that must not persist anything
    pub results: Option<Arc<ResultStore>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Node {
    Operator(OperatorId),
    Artifact(ArtifactId),
}

/// DAG built from a serialized [`DagSpec`]
pub struct Dag {
    workflow_id: WorkflowId,
    dag_id: DagId,
    run_dir: PathBuf,
    graph: DiGraph<Node, ()>,
    indices: HashMap<Node, NodeIndex>,
    // Declaration order, for stable iteration
    operators: Vec<Arc<JobOperator>>,
    artifacts: Vec<Arc<DagArtifact>>,
    results: Option<Arc<ResultStore>>,
}

impl Dag {
    /// Validate the description and lay out the run directory
    pub fn build(spec: &DagSpec, context: DagContext) -> Result<Self, DagError> {
        if spec.operators.is_empty() {
            return Err(DagError::Empty);
        }

        let mut graph = DiGraph::new();
        let mut indices = HashMap::new();

        for artifact in &spec.artifacts {
            let node = Node::Artifact(artifact.id);
            if indices.contains_key(&node) {
                return Err(DagError::DuplicateArtifact(artifact.id));
            }
            indices.insert(node, graph.add_node(node));
        }

        for op in &spec.operators {
            let node = Node::Operator(op.id);
            if indices.contains_key(&node) {
                return Err(DagError::DuplicateOperator(op.id));
            }
            indices.insert(node, graph.add_node(node));
        }

        let mut producers: HashMap<ArtifactId, OperatorId> = HashMap::new();
        for op in &spec.operators {
            let op_idx = indices[&Node::Operator(op.id)];
            let artifact_idx = |artifact: &ArtifactId| {
                indices
                    .get(&Node::Artifact(*artifact))
                    .copied()
                    .ok_or_else(|| DagError::UnknownArtifact {
                        operator: op.name.clone(),
                        artifact: *artifact,
                    })
            };

            for input in &op.inputs {
                graph.add_edge(artifact_idx(input)?, op_idx, ());
            }
            for output in &op.outputs {
                if producers.insert(*output, op.id).is_some() {
                    return Err(DagError::MultipleProducers { artifact: *output });
                }
                graph.add_edge(op_idx, artifact_idx(output)?, ());
            }
        }

        for op in &spec.operators {
            if let Some(artifact) = op.inputs.iter().find(|a| !producers.contains_key(a)) {
                return Err(DagError::MissingProducer {
                    artifact: *artifact,
                });
            }
        }

        if petgraph::algo::is_cyclic_directed(&graph) {
            return Err(DagError::Cycle);
        }

        let run_dir = context.storage_root.join(context.run_id.to_string());
        let nonce: String = context.run_id.0.simple().to_string().chars().take(8).collect();

        let artifacts: Vec<Arc<DagArtifact>> = spec
            .artifacts
            .iter()
            .map(|def| {
                let from_param = producers
                    .get(&def.id)
                    .and_then(|producer| spec.operators.iter().find(|op| op.id == *producer))
                    .is_some_and(|producer| producer.spec.is_param());
                Arc::new(DagArtifact::new(
                    def.id,
                    def.name.clone(),
                    def.artifact_type,
                    run_dir.join("artifacts").join(def.id.to_string()),
                    from_param,
                ))
            })
            .collect();
        let by_id: HashMap<ArtifactId, Arc<DagArtifact>> =
            artifacts.iter().map(|a| (a.id(), a.clone())).collect();

        let operators = spec
            .operators
            .iter()
            .map(|def| {
                let job_dir = run_dir.join(def.id.to_string());
                let outputs: Vec<Arc<DagArtifact>> =
                    def.outputs.iter().filter_map(|id| by_id.get(id).cloned()).collect();
                let job_spec = JobSpec::Operator(OperatorJob {
                    job_name: format!("{}-{}", def.id, nonce),
                    operator_id: def.id,
                    operator_name: def.name.clone(),
                    spec: def.spec.clone(),
                    input_paths: def
                        .inputs
                        .iter()
                        .filter_map(|id| by_id.get(id))
                        .map(|a| a.content_path().to_path_buf())
                        .collect(),
                    output_paths: outputs.iter().map(|a| a.content_path().to_path_buf()).collect(),
                    metadata_path: job_dir.join("exec_state.json"),
                });
                Arc::new(JobOperator::new(
                    def,
                    job_spec,
                    job_dir,
                    outputs,
                    context.results.clone(),
                ))
            })
            .collect();

        Ok(Self {
            workflow_id: spec.workflow_id,
            dag_id: spec.id,
            run_dir,
            graph,
            indices,
            operators,
            artifacts,
            results: context.results,
        })
    }

    pub fn run_dir(&self) -> &std::path::Path {
        &self.run_dir
    }

    fn neighbors(
        &self,
        node: Node,
        direction: petgraph::Direction,
    ) -> Result<impl Iterator<Item = Node> + '_, InternalError> {
        let idx = self.indices.get(&node).ok_or(match node {
            Node::Operator(id) => InternalError::UnknownOperator(id),
            Node::Artifact(id) => InternalError::UnknownArtifact(id),
        })?;
        Ok(self
            .graph
            .neighbors_directed(*idx, direction)
            .map(|n| self.graph[n]))
    }

    fn artifacts_of(
        &self,
        id: &OperatorId,
        direction: petgraph::Direction,
    ) -> Result<Vec<ArtifactId>, InternalError> {
        Ok(self
            .neighbors(Node::Operator(*id), direction)?
            .filter_map(|node| match node {
                Node::Artifact(id) => Some(id),
                Node::Operator(_) => None,
            })
            .collect())
    }
}

#[async_trait::async_trait]
impl WorkflowDag for Dag {
    fn operators(&self) -> Vec<Arc<dyn Operator>> {
        self.operators
            .iter()
            .map(|op| op.clone() as Arc<dyn Operator>)
            .collect()
    }

    fn operator(&self, id: &OperatorId) -> Option<Arc<dyn Operator>> {
        self.operators
            .iter()
            .find(|op| op.id() == *id)
            .map(|op| op.clone() as Arc<dyn Operator>)
    }

    fn artifacts(&self) -> Vec<Arc<dyn Artifact>> {
        self.artifacts
            .iter()
            .map(|a| a.clone() as Arc<dyn Artifact>)
            .collect()
    }

    fn operator_inputs(&self, id: &OperatorId) -> Result<Vec<ArtifactId>, InternalError> {
        self.artifacts_of(id, petgraph::Direction::Incoming)
    }

    fn operator_outputs(&self, id: &OperatorId) -> Result<Vec<ArtifactId>, InternalError> {
        self.artifacts_of(id, petgraph::Direction::Outgoing)
    }

    fn operators_on_artifact(&self, id: &ArtifactId) -> Result<Vec<OperatorId>, InternalError> {
        Ok(self
            .neighbors(Node::Artifact(*id), petgraph::Direction::Outgoing)?
            .filter_map(|node| match node {
                Node::Operator(id) => Some(id),
                Node::Artifact(_) => None,
            })
            .collect())
    }

    async fn initialize_results(&self) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(self.run_dir.join("artifacts")).await?;
        if let Some(results) = &self.results {
            results.initialize(self.workflow_id, self.dag_id).await?;
        }
        Ok(())
    }

    async fn persist_result(&self, status: ExecutionStatus) -> anyhow::Result<()> {
        if let Some(results) = &self.results {
            results.record_run(status).await?;
        }
        Ok(())
    }
}
