//! The coordinator's task-status table.
//!
//! This is the only cross-task shared mutable state in the pipeline. It is
//! never exposed as a bare map: every mutation goes through a validated
//! state transition, and readers get consistent snapshots.

use crate::model::{BuildTask, Package, StateError, TargetTriple, TaskState};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

type TaskKey = (String, TargetTriple);

/// Mutex-guarded store of every [`BuildTask`] in the run.
///
/// One worker writes per key; the report reader only snapshots after the
/// merge barrier, so it always observes terminal states.
#[derive(Default)]
pub struct TaskTable {
    inner: Mutex<HashMap<TaskKey, BuildTask>>,
}

impl TaskTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TaskKey, BuildTask>> {
        // A poisoned lock means a worker panicked mid-transition; the data
        // is still a valid map, so carry on and let the report show it.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers a fresh `Pending` task for a (package, triple) pair.
    pub fn insert(&self, package: &Package, triple: TargetTriple) {
        self.lock().insert(
            (package.name.clone(), triple),
            BuildTask::new(package.clone(), triple),
        );
    }

    /// Moves a task to `next`, enforcing the state-machine ordering.
    ///
    /// # Errors
    ///
    /// [`StateError`] if the task is unknown or the transition is illegal;
    /// the stored state is left untouched in both cases.
    pub fn advance(
        &self,
        package: &Package,
        triple: TargetTriple,
        next: TaskState,
    ) -> Result<(), StateError> {
        let mut guard = self.lock();
        let task = guard
            .get_mut(&(package.name.clone(), triple))
            .ok_or_else(|| StateError {
                from: "<unknown task>".to_string(),
                to: next.label().to_string(),
            })?;

        if !task.state.can_advance_to(&next) {
            return Err(StateError {
                from: task.state.label().to_string(),
                to: next.label().to_string(),
            });
        }

        debug!(
            package = %package,
            triple = %triple,
            from = task.state.label(),
            to = next.label(),
            "task transition"
        );
        task.state = next;
        Ok(())
    }

    /// Stores the artifact paths a successful build produced.
    pub fn record_artifacts(
        &self,
        package: &Package,
        triple: TargetTriple,
        artifacts: Vec<PathBuf>,
    ) {
        if let Some(task) = self.lock().get_mut(&(package.name.clone(), triple)) {
            task.artifacts = artifacts;
        }
    }

    /// Current state of one task, if it exists.
    pub fn state_of(&self, package: &Package, triple: TargetTriple) -> Option<TaskState> {
        self.lock()
            .get(&(package.name.clone(), triple))
            .map(|t| t.state.clone())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Consistent copy of every task, ordered by registry rank then
    /// triple, so reports are deterministic.
    pub fn snapshot(&self) -> Vec<BuildTask> {
        let mut tasks: Vec<BuildTask> = self.lock().values().cloned().collect();
        tasks.sort_by(|a, b| {
            (a.package.rank, &a.package.name, a.triple.name()).cmp(&(
                b.package.rank,
                &b.package.name,
                b.triple.name(),
            ))
        });
        tasks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FailStage, TaskFailure};

    const LINUX: TargetTriple = TargetTriple::X86_64UnknownLinuxGnu;
    const WINDOWS: TargetTriple = TargetTriple::X86_64PcWindowsMsvc;

    fn pkg(name: &str, rank: usize) -> Package {
        Package {
            name: name.to_string(),
            version: "1.0.0".to_string(),
            rank,
        }
    }

    #[test]
    fn test_insert_and_advance_happy_path() {
        let table = TaskTable::new();
        let p = pkg("serde", 1);
        table.insert(&p, LINUX);

        for next in [
            TaskState::Fetching,
            TaskState::Fetched,
            TaskState::Building,
            TaskState::Built,
            TaskState::Extracting,
            TaskState::Extracted,
            TaskState::Done,
        ] {
            table.advance(&p, LINUX, next).unwrap();
        }
        assert_eq!(table.state_of(&p, LINUX), Some(TaskState::Done));
    }

    #[test]
    fn test_illegal_transition_leaves_state_untouched() {
        let table = TaskTable::new();
        let p = pkg("serde", 1);
        table.insert(&p, LINUX);
        table.advance(&p, LINUX, TaskState::Fetching).unwrap();

        let err = table.advance(&p, LINUX, TaskState::Done).unwrap_err();
        assert_eq!(err.from, "fetching");
        assert_eq!(err.to, "done");
        assert_eq!(table.state_of(&p, LINUX), Some(TaskState::Fetching));
    }

    #[test]
    fn test_unknown_task_is_an_error() {
        let table = TaskTable::new();
        let err = table
            .advance(&pkg("ghost", 1), LINUX, TaskState::Fetching)
            .unwrap_err();
        assert_eq!(err.from, "<unknown task>");
    }

    #[test]
    fn test_failed_is_terminal_in_table() {
        let table = TaskTable::new();
        let p = pkg("serde", 1);
        table.insert(&p, LINUX);
        table.advance(&p, LINUX, TaskState::Fetching).unwrap();
        table
            .advance(
                &p,
                LINUX,
                TaskState::Failed(TaskFailure {
                    stage: FailStage::Fetch,
                    reason: "gone".to_string(),
                }),
            )
            .unwrap();

        assert!(table.advance(&p, LINUX, TaskState::Fetched).is_err());
    }

    #[test]
    fn test_snapshot_is_rank_ordered() {
        let table = TaskTable::new();
        let second = pkg("rand", 2);
        let first = pkg("serde", 1);
        table.insert(&second, LINUX);
        table.insert(&first, WINDOWS);
        table.insert(&first, LINUX);

        let snapshot = table.snapshot();
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot[0].package.name, "serde");
        assert_eq!(snapshot[0].triple, WINDOWS);
        assert_eq!(snapshot[1].package.name, "serde");
        assert_eq!(snapshot[2].package.name, "rand");
    }
}
