//! End-of-run reporting and exit-code mapping.

use crate::model::{BuildTask, FailStage, Package, SignatureBundle, TargetTriple, TaskState};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Full success.
pub const EXIT_SUCCESS: i32 = 0;
/// The run completed, but at least one package or merge failed.
pub const EXIT_PARTIAL: i32 = 1;
/// Fatal: registry unavailable, or the run was aborted mid-flight.
pub const EXIT_FATAL: i32 = 2;

/// Outcome counts for one target triple.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TripleSummary {
    pub triple: TargetTriple,
    pub done: usize,
    pub failed: usize,

    /// Tasks that never reached a terminal state (aborted runs only)
    pub unfinished: usize,
}

/// One failed task, with its originating stage and reason.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureReport {
    pub package: Package,
    pub triple: TargetTriple,
    pub stage: FailStage,
    pub reason: String,
}

/// A merge that errored; fatal for its triple, not for the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeFailure {
    pub triple: TargetTriple,
    pub reason: String,
}

/// Aggregate outcome of a pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    /// How many packages the registry resolved
    pub resolved: usize,

    pub triples: Vec<TripleSummary>,
    pub failures: Vec<FailureReport>,
    pub merge_failures: Vec<MergeFailure>,
    pub bundles: Vec<SignatureBundle>,

    /// True when the run was cancelled before completing
    pub aborted: bool,
}

impl RunReport {
    /// Builds the report from the coordinator's terminal task snapshot.
    pub fn from_outcomes(
        resolved: usize,
        triples: &[TargetTriple],
        tasks: &[BuildTask],
        bundles: Vec<SignatureBundle>,
        merge_failures: Vec<MergeFailure>,
        aborted: bool,
    ) -> Self {
        let mut summaries = Vec::with_capacity(triples.len());
        for &triple in triples {
            let mut summary = TripleSummary {
                triple,
                done: 0,
                failed: 0,
                unfinished: 0,
            };
            for task in tasks.iter().filter(|t| t.triple == triple) {
                match &task.state {
                    TaskState::Done => summary.done += 1,
                    TaskState::Failed(_) => summary.failed += 1,
                    _ => summary.unfinished += 1,
                }
            }
            summaries.push(summary);
        }

        let failures = tasks
            .iter()
            .filter_map(|task| match &task.state {
                TaskState::Failed(failure) => Some(FailureReport {
                    package: task.package.clone(),
                    triple: task.triple,
                    stage: failure.stage,
                    reason: failure.reason.clone(),
                }),
                _ => None,
            })
            .collect();

        Self {
            resolved,
            triples: summaries,
            failures,
            merge_failures,
            bundles,
            aborted,
        }
    }

    /// Process exit code for this outcome.
    pub fn exit_code(&self) -> i32 {
        if self.aborted {
            EXIT_FATAL
        } else if !self.failures.is_empty() || !self.merge_failures.is_empty() {
            EXIT_PARTIAL
        } else {
            EXIT_SUCCESS
        }
    }

    /// Logs the human-readable end-of-run summary.
    pub fn log_summary(&self) {
        info!(resolved = self.resolved, aborted = self.aborted, "run finished");
        for summary in &self.triples {
            info!(
                triple = %summary.triple,
                done = summary.done,
                failed = summary.failed,
                unfinished = summary.unfinished,
                "triple summary"
            );
        }
        for bundle in &self.bundles {
            info!(
                triple = %bundle.triple,
                contributors = bundle.contributors.len(),
                collisions = bundle.collisions.len(),
                sig = %bundle
                    .sig_path
                    .as_deref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "<empty>".to_string()),
                "signature bundle"
            );
        }
        for failure in &self.failures {
            warn!(
                package = %failure.package,
                triple = %failure.triple,
                stage = %failure.stage,
                reason = %failure.reason,
                "package failed"
            );
        }
        for merge in &self.merge_failures {
            warn!(triple = %merge.triple, reason = %merge.reason, "merge failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TaskFailure;

    const LINUX: TargetTriple = TargetTriple::X86_64UnknownLinuxGnu;

    fn task(name: &str, state: TaskState) -> BuildTask {
        let mut task = BuildTask::new(
            Package {
                name: name.to_string(),
                version: "1.0.0".to_string(),
                rank: 1,
            },
            LINUX,
        );
        task.state = state;
        task
    }

    fn failed_state() -> TaskState {
        TaskState::Failed(TaskFailure {
            stage: FailStage::Build,
            reason: "build for x86_64-unknown-linux-gnu failed: boom".to_string(),
        })
    }

    #[test]
    fn test_counts_and_failure_list() {
        let tasks = vec![
            task("a", TaskState::Done),
            task("b", failed_state()),
            task("c", TaskState::Done),
        ];
        let report = RunReport::from_outcomes(3, &[LINUX], &tasks, vec![], vec![], false);

        assert_eq!(report.triples.len(), 1);
        assert_eq!(report.triples[0].done, 2);
        assert_eq!(report.triples[0].failed, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].package.name, "b");
        assert_eq!(report.failures[0].stage, FailStage::Build);
    }

    #[test]
    fn test_exit_code_mapping() {
        let clean = RunReport::from_outcomes(
            1,
            &[LINUX],
            &[task("a", TaskState::Done)],
            vec![],
            vec![],
            false,
        );
        assert_eq!(clean.exit_code(), EXIT_SUCCESS);

        let partial = RunReport::from_outcomes(
            1,
            &[LINUX],
            &[task("a", failed_state())],
            vec![],
            vec![],
            false,
        );
        assert_eq!(partial.exit_code(), EXIT_PARTIAL);

        let merge_failed = RunReport::from_outcomes(
            1,
            &[LINUX],
            &[task("a", TaskState::Done)],
            vec![],
            vec![MergeFailure {
                triple: LINUX,
                reason: "sigmake failed".to_string(),
            }],
            false,
        );
        assert_eq!(merge_failed.exit_code(), EXIT_PARTIAL);

        let aborted = RunReport::from_outcomes(1, &[LINUX], &[], vec![], vec![], true);
        assert_eq!(aborted.exit_code(), EXIT_FATAL);
    }

    #[test]
    fn test_unfinished_tasks_counted_on_abort() {
        let tasks = vec![task("a", TaskState::Building), task("b", TaskState::Done)];
        let report = RunReport::from_outcomes(2, &[LINUX], &tasks, vec![], vec![], true);
        assert_eq!(report.triples[0].unfinished, 1);
        assert_eq!(report.triples[0].done, 1);
    }

    #[test]
    fn test_report_serializes() {
        let report = RunReport::from_outcomes(0, &[LINUX], &[], vec![], vec![], false);
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"resolved\":0"));
    }
}
