use super::dag::WorkflowDag;
use crate::error::{InternalError, RunError};
use crate::types::{ExecutionStatus, OperatorId};
use std::collections::{BTreeSet, HashMap, HashSet};

/// Bookkeeping for one run, owned by the orchestrator
///
/// An operator is either waiting on dependencies, in progress, or completed,
/// never two of these at once.
#[derive(Debug)]
pub struct RunState {
    dependency_counts: HashMap<OperatorId, usize>,
    in_progress: BTreeSet<OperatorId>,
    completed: HashSet<OperatorId>,
    status: ExecutionStatus,
    total: usize,
}

impl RunState {
    /// Count every operator's unsatisfied inputs
    pub fn new(dag: &dyn WorkflowDag) -> Result<Self, InternalError> {
        let operators = dag.operators();
        let mut dependency_counts = HashMap::with_capacity(operators.len());
        for op in &operators {
            dependency_counts.insert(op.id(), dag.operator_inputs(&op.id())?.len());
        }

        Ok(Self {
            dependency_counts,
            in_progress: BTreeSet::new(),
            completed: HashSet::new(),
            status: ExecutionStatus::Pending,
            total: operators.len(),
        })
    }

    /// Put every operator without dependencies in progress
    pub fn seed(&mut self) -> Result<(), RunError> {
        for (id, count) in &self.dependency_counts {
            if *count == 0 && !self.completed.contains(id) {
                self.in_progress.insert(*id);
            }
        }
        if self.in_progress.is_empty() {
            return Err(RunError::NoEntryPoint);
        }
        Ok(())
    }

    pub fn status(&self) -> ExecutionStatus {
        self.status
    }

    pub fn set_status(&mut self, status: ExecutionStatus) {
        self.status = status;
    }

    /// Snapshot of the in-progress set, safe to iterate while mutating the state
    pub fn in_progress(&self) -> Vec<OperatorId> {
        self.in_progress.iter().copied().collect()
    }

    pub fn has_in_progress(&self) -> bool {
        !self.in_progress.is_empty()
    }

    pub fn is_completed(&self, id: &OperatorId) -> bool {
        self.completed.contains(id)
    }

    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }

    pub fn dependency_count(&self, id: &OperatorId) -> Option<usize> {
        self.dependency_counts.get(id).copied()
    }

    /// Move an operator from in progress to completed
    pub fn complete(&mut self, id: OperatorId) -> Result<(), InternalError> {
        if !self.completed.insert(id) {
            return Err(InternalError::CompletedTwice { operator: id });
        }
        self.in_progress.remove(&id);
        Ok(())
    }

    /// One input of `consumer` became available
    pub fn release(&mut self, consumer: OperatorId) -> Result<(), InternalError> {
        let count = self
            .dependency_counts
            .get_mut(&consumer)
            .ok_or(InternalError::UnknownOperator(consumer))?;

        *count = count
            .checked_sub(1)
            .ok_or(InternalError::NegativeDependencyCount { operator: consumer })?;

        if *count == 0 {
            self.in_progress.insert(consumer);
        }
        Ok(())
    }

    /// Checks that must hold once the loop drained the in-progress set
    pub fn verify_finished(&self) -> Result<(), InternalError> {
        if self.completed.len() != self.total {
            return Err(InternalError::IncompleteRun {
                total: self.total,
                completed: self.completed.len(),
            });
        }

        if let Some((id, count)) = self.dependency_counts.iter().find(|(_, c)| **c != 0) {
            return Err(InternalError::NonZeroDependencyCount {
                operator: *id,
                count: *count,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::DagBuilder;
    use crate::workflow::dag::{Dag, DagContext};
    use tempfile::TempDir;

    fn chain(dir: &TempDir) -> (Dag, Vec<OperatorId>) {
        let mut builder = DagBuilder::new();
        let a = builder.operator("a", &[]);
        let b = builder.operator("b", &[a]);
        let c = builder.operator("c", &[b]);
        let ids = vec![builder.id(a), builder.id(b), builder.id(c)];
        let dag = Dag::build(
            &builder.build(),
            DagContext {
                run_id: crate::types::RunId::new(),
                storage_root: dir.path().to_path_buf(),
                results: None,
            },
        )
        .unwrap();
        (dag, ids)
    }

    #[test]
    fn test_seed_and_release() {
        let dir = TempDir::new().unwrap();
        let (dag, ids) = chain(&dir);
        let mut state = RunState::new(&dag).unwrap();

        state.seed().unwrap();
        assert_eq!(state.in_progress(), vec![ids[0]]);
        assert_eq!(state.dependency_count(&ids[1]), Some(1));

        state.complete(ids[0]).unwrap();
        state.release(ids[1]).unwrap();
        assert_eq!(state.in_progress(), vec![ids[1]]);
        assert!(state.is_completed(&ids[0]));

        assert!(matches!(
            state.verify_finished(),
            Err(InternalError::IncompleteRun { total: 3, completed: 1 })
        ));
    }

    #[test]
    fn test_invariant_violations() {
        let dir = TempDir::new().unwrap();
        let (dag, ids) = chain(&dir);
        let mut state = RunState::new(&dag).unwrap();
        state.seed().unwrap();

        state.complete(ids[0]).unwrap();
        assert_eq!(
            state.complete(ids[0]),
            Err(InternalError::CompletedTwice { operator: ids[0] })
        );

        state.release(ids[1]).unwrap();
        assert_eq!(
            state.release(ids[1]),
            Err(InternalError::NegativeDependencyCount { operator: ids[1] })
        );
    }

    #[test]
    fn test_no_entry_point() {
        let dir = TempDir::new().unwrap();
        let (dag, ids) = chain(&dir);
        let mut state = RunState::new(&dag).unwrap();
        state.dependency_counts.insert(ids[0], 1);
        assert!(matches!(state.seed(), Err(RunError::NoEntryPoint)));
    }
}
