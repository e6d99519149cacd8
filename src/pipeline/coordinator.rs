//! Pipeline coordinator: fan-out per package, fan-in per triple.
//!
//! The coordinator resolves the package list, creates one task per
//! (package, triple), and dispatches package work units into a bounded
//! worker pool. Each unit runs fetch → build → extract, recording every
//! transition in the [`TaskTable`]. A per-triple barrier holds the merge
//! back until all of that triple's tasks are terminal; merges for
//! different triples complete independently.
//!
//! Package-local failures never cross the coordinator: they become the
//! task's terminal state and a report entry. Only registry failure aborts
//! the run; a merge failure loses its triple and nothing else.

use crate::config::HarvestConfig;
use crate::model::{Package, PatternRecord, TargetTriple, TaskState};
use crate::pipeline::table::TaskTable;
use crate::report::{MergeFailure, RunReport};
use crate::traits::{
    CrossBuilder, PackageRegistry, PatternTool, RegistryError, SignatureTool, SourceFetcher,
    TaskError,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Failure that aborts the whole run.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

// ============================================================================
// Per-triple barrier
// ============================================================================

/// Counts down terminal tasks per triple and wakes merge waiters when a
/// triple's count reaches zero.
struct TripleBarrier {
    remaining: Mutex<HashMap<TargetTriple, usize>>,
    notify: Notify,
}

impl TripleBarrier {
    fn new(triples: &[TargetTriple], tasks_per_triple: usize) -> Self {
        let remaining = triples.iter().map(|&t| (t, tasks_per_triple)).collect();
        Self {
            remaining: Mutex::new(remaining),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TargetTriple, usize>> {
        self.remaining.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Marks one task for `triple` terminal.
    fn task_finished(&self, triple: TargetTriple) {
        let mut remaining = self.lock();
        if let Some(count) = remaining.get_mut(&triple) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.notify.notify_waiters();
            }
        }
    }

    /// Resolves once every task targeting `triple` is terminal.
    async fn wait(&self, triple: TargetTriple) {
        loop {
            // Register interest before checking, so a wake between the
            // check and the await is not lost.
            let notified = self.notify.notified();
            if self.lock().get(&triple).copied().unwrap_or(0) == 0 {
                return;
            }
            notified.await;
        }
    }
}

// ============================================================================
// Worker context
// ============================================================================

struct WorkerCtx {
    fetcher: Arc<dyn SourceFetcher>,
    builder: Arc<dyn CrossBuilder>,
    patterns: Arc<dyn PatternTool>,
    table: Arc<TaskTable>,
    records: Arc<Mutex<Vec<PatternRecord>>>,
    barrier: Arc<TripleBarrier>,
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
    triples: Vec<TargetTriple>,
}

impl WorkerCtx {
    /// Records a transition; an illegal one is a coordinator bug and gets
    /// logged loudly rather than silently dropped.
    fn mark(&self, package: &Package, triple: TargetTriple, next: TaskState) {
        if let Err(e) = self.table.advance(package, triple, next) {
            error!(package = %package, triple = %triple, error = %e, "state machine violation");
        }
    }

    fn fail(&self, package: &Package, triple: TargetTriple, error: TaskError) {
        warn!(package = %package, triple = %triple, error = %error, "task failed");
        self.mark(package, triple, TaskState::Failed(error.into_failure()));
        self.barrier.task_finished(triple);
    }
}

/// One package's full unit of work: fetch once, then build and extract
/// per triple. Every task this worker owns reaches a terminal state and
/// signals the barrier, unless the run is cancelled (in which case the
/// merge waiters are cancelled too).
async fn package_worker(ctx: Arc<WorkerCtx>, package: Package) {
    let _permit = tokio::select! {
        _ = ctx.cancel.cancelled() => return,
        permit = ctx.semaphore.clone().acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => return,
        },
    };

    for &triple in &ctx.triples {
        ctx.mark(&package, triple, TaskState::Fetching);
    }
    let fetched = tokio::select! {
        _ = ctx.cancel.cancelled() => return,
        res = ctx.fetcher.fetch(&package) => res,
    };
    let source_dir = match fetched {
        Ok(dir) => {
            for &triple in &ctx.triples {
                ctx.mark(&package, triple, TaskState::Fetched);
            }
            dir
        }
        Err(e) => {
            // One shared download feeds every triple, so all of this
            // package's tasks fail together.
            let failure = TaskError::from(e).into_failure();
            for &triple in &ctx.triples {
                ctx.mark(&package, triple, TaskState::Failed(failure.clone()));
                ctx.barrier.task_finished(triple);
            }
            return;
        }
    };

    for &triple in &ctx.triples {
        ctx.mark(&package, triple, TaskState::Building);
        let built = tokio::select! {
            _ = ctx.cancel.cancelled() => return,
            res = ctx.builder.build(&source_dir, triple) => res,
        };
        let artifacts = match built {
            Ok(artifacts) => {
                ctx.table.record_artifacts(&package, triple, artifacts.clone());
                ctx.mark(&package, triple, TaskState::Built);
                artifacts
            }
            Err(e) => {
                ctx.fail(&package, triple, e.into());
                continue;
            }
        };

        ctx.mark(&package, triple, TaskState::Extracting);
        let extracted = tokio::select! {
            _ = ctx.cancel.cancelled() => return,
            res = ctx.patterns.extract(&package, triple, &artifacts) => res,
        };
        match extracted {
            Ok(new_records) => {
                ctx.mark(&package, triple, TaskState::Extracted);
                ctx.records
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .extend(new_records);
                ctx.mark(&package, triple, TaskState::Done);
                ctx.barrier.task_finished(triple);
            }
            Err(e) => ctx.fail(&package, triple, e.into()),
        }
    }
}

// ============================================================================
// Coordinator
// ============================================================================

/// Drives the whole harvest run. See the module docs for the shape.
pub struct Coordinator {
    registry: Arc<dyn PackageRegistry>,
    fetcher: Arc<dyn SourceFetcher>,
    builder: Arc<dyn CrossBuilder>,
    patterns: Arc<dyn PatternTool>,
    signatures: Arc<dyn SignatureTool>,
    config: HarvestConfig,
    cancel: CancellationToken,
}

impl Coordinator {
    pub fn new(
        registry: Arc<dyn PackageRegistry>,
        fetcher: Arc<dyn SourceFetcher>,
        builder: Arc<dyn CrossBuilder>,
        patterns: Arc<dyn PatternTool>,
        signatures: Arc<dyn SignatureTool>,
        config: HarvestConfig,
    ) -> Self {
        Self {
            registry,
            fetcher,
            builder,
            patterns,
            signatures,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Token that aborts the run when cancelled. In-flight external
    /// processes are killed, not abandoned.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Executes the full pipeline and produces the run report.
    ///
    /// # Errors
    ///
    /// [`PipelineError::Registry`] when package resolution fails; no
    /// tasks are created in that case.
    pub async fn run(&self) -> Result<RunReport, PipelineError> {
        let started = Instant::now();
        let packages = tokio::select! {
            _ = self.cancel.cancelled() => {
                return Ok(RunReport::from_outcomes(
                    0, &self.config.triples, &[], Vec::new(), Vec::new(), true,
                ))
            }
            res = self.registry.top_packages(self.config.package_count, &self.config.exclude) => res?,
        };
        info!(resolved = packages.len(), "package resolution complete");

        let table = Arc::new(TaskTable::new());
        for package in &packages {
            for &triple in &self.config.triples {
                table.insert(package, triple);
            }
        }
        debug!(tasks = table.len(), "task table initialized");

        let ctx = Arc::new(WorkerCtx {
            fetcher: self.fetcher.clone(),
            builder: self.builder.clone(),
            patterns: self.patterns.clone(),
            table: table.clone(),
            records: Arc::new(Mutex::new(Vec::new())),
            barrier: Arc::new(TripleBarrier::new(&self.config.triples, packages.len())),
            semaphore: Arc::new(Semaphore::new(self.config.workers)),
            cancel: self.cancel.clone(),
            triples: self.config.triples.clone(),
        });

        let mut workers = JoinSet::new();
        for package in packages.iter().cloned() {
            let ctx = ctx.clone();
            workers.spawn(async move {
                debug!(package = %package, "worker started");
                package_worker(ctx, package).await;
            });
        }

        let merges = self.config.triples.iter().map(|&triple| {
            let ctx = ctx.clone();
            let signatures = self.signatures.clone();
            let output_dir = self.config.output_dir.clone();
            async move {
                tokio::select! {
                    _ = ctx.cancel.cancelled() => None,
                    _ = ctx.barrier.wait(triple) => {
                        let triple_records: Vec<PatternRecord> = ctx
                            .records
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .iter()
                            .filter(|r| r.triple == triple)
                            .cloned()
                            .collect();
                        info!(
                            triple = %triple,
                            records = triple_records.len(),
                            "all tasks terminal, merging"
                        );
                        Some((triple, signatures.merge(triple, &triple_records, &output_dir).await))
                    }
                }
            }
        });
        // Triples with disjoint outstanding work merge independently; the
        // barrier, not worker completion, gates each one.
        let merges = tokio::spawn(futures::future::join_all(merges.collect::<Vec<_>>()));

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "package worker panicked");
            }
        }

        let mut bundles = Vec::new();
        let mut merge_failures = Vec::new();
        match merges.await {
            Ok(outcomes) => {
                for outcome in outcomes.into_iter().flatten() {
                    match outcome {
                        (_, Ok(bundle)) => bundles.push(bundle),
                        (triple, Err(e)) => {
                            error!(triple = %triple, error = %e, "signature merge failed");
                            merge_failures.push(MergeFailure {
                                triple,
                                reason: e.to_string(),
                            });
                        }
                    }
                }
            }
            Err(e) => error!(error = %e, "merge task panicked"),
        }

        bundles.sort_by_key(|b| b.triple.name());
        let report = RunReport::from_outcomes(
            packages.len(),
            &self.config.triples,
            &table.snapshot(),
            bundles,
            merge_failures,
            self.cancel.is_cancelled(),
        );
        info!(
            elapsed_secs = started.elapsed().as_secs(),
            exit_code = report.exit_code(),
            "pipeline run complete"
        );
        Ok(report)
    }
}

// ============================================================================
// Tests
// ============================================================================
