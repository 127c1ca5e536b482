pub mod artifact;
pub mod dag;
pub mod executor;
pub mod operator;
pub mod run_state;

pub use artifact::{Artifact, DagArtifact, PreviewPayload};
pub use dag::{Dag, DagContext, WorkflowDag};
pub use executor::Orchestrator;
pub use operator::{JobOperator, Operator};
pub use run_state::RunState;
