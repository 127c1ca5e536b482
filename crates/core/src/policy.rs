// Failure policy deciding which terminal operator failures stop a run

use crate::types::{ExecutionState, ExecutionStatus, FailureType};
use std::sync::Arc;

/// Predicate over a terminal execution state
#[derive(Clone)]
pub enum FailurePolicy {
    /// Failures whose type is in the list are tolerated
    Tolerate(Vec<FailureType>),
    /// Custom predicate returning true when the failure is tolerated
    Custom(Arc<dyn Fn(FailureType) -> bool + Send + Sync>),
}

impl FailurePolicy {
    pub fn tolerate(types: impl IntoIterator<Item = FailureType>) -> Self {
        Self::Tolerate(types.into_iter().collect())
    }

    /// Every failure stops the run
    pub fn strict() -> Self {
        Self::Tolerate(Vec::new())
    }

    pub fn tolerates(&self, failure_type: FailureType) -> bool {
        match self {
            Self::Tolerate(types) => types.contains(&failure_type),
            Self::Custom(predicate) => predicate(failure_type),
        }
    }

    /// Whether orchestration must abort after an operator reached this state
    pub fn should_stop(&self, state: &ExecutionState) -> bool {
        if state.status != ExecutionStatus::Failed {
            return false;
        }
        // An unclassified failure is treated as infrastructure breakage
        let failure_type = state.failure_type.unwrap_or(FailureType::System);
        !self.tolerates(failure_type)
    }
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self::tolerate([FailureType::UserNonFatal])
    }
}

impl std::fmt::Debug for FailurePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tolerate(types) => f.debug_tuple("Tolerate").field(types).finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}
