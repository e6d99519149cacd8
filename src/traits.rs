//! Collaborator seams for the external processes the pipeline drives.
//!
//! Each trait isolates one failure-prone external dependency — the package
//! registry, the source download, the compiler toolchain, and the FLAIR
//! pattern/merge tools — so the coordinator can be tested against fakes.
//!
//! # Thread Safety
//!
//! All implementations must be `Send + Sync`; the coordinator shares them
//! across worker tasks behind `Arc`.

use crate::model::{
    FailStage, Package, PatternRecord, SignatureBundle, TargetTriple, TaskFailure,
};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use thiserror::Error;

// ============================================================================
// Error taxonomy
// ============================================================================

/// Registry resolution failure. Fatal: no packages proceed.
#[derive(Error, Debug)]
pub enum RegistryError {
    /// The query could not complete after the configured retry attempts
    #[error("registry unavailable after {attempts} attempts: {last_error}")]
    Unavailable { attempts: u32, last_error: String },

    /// The registry answered, but not in the shape we require
    #[error("malformed registry response: {0}")]
    Schema(String),
}

/// Source materialization failure, scoped to one package.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("download failed after {attempts} attempts: {last_error}")]
    Network { attempts: u32, last_error: String },

    #[error("no such version {version} of {name}")]
    MissingVersion { name: String, version: String },

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("malformed version metadata: {0}")]
    Metadata(String),

    #[error("failed to unpack source archive: {0}")]
    Unpack(String),

    #[error("I/O error during fetch: {0}")]
    Io(#[from] std::io::Error),
}

/// Cross-build failure, scoped to one (package, triple).
#[derive(Error, Debug)]
pub enum BuildError {
    /// Compiler exited non-zero. Not retried: compiler failures are
    /// deterministic given identical source and toolchain.
    #[error("build for {triple} failed: {stderr_excerpt}")]
    Failed {
        triple: TargetTriple,
        stderr_excerpt: String,
    },

    /// Deadline exceeded. Treated as a failure, never a retry, so one
    /// pathological package cannot stall the run.
    #[error("build for {triple} timed out after {limit_secs}s")]
    Timeout {
        triple: TargetTriple,
        limit_secs: u64,
    },

    #[error("failed to rewrite Cargo.toml: {0}")]
    ManifestRewrite(String),

    /// The build succeeded but produced no static library
    #[error("no static library produced for {triple}")]
    NoArtifact { triple: TargetTriple },

    #[error("I/O error during build: {0}")]
    Io(#[from] std::io::Error),
}

/// Pattern extraction failure, scoped to one (package, triple).
#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("FLAIR tool not found: {0}")]
    ToolMissing(PathBuf),

    #[error("{tool} failed: {stderr_excerpt}")]
    ToolFailed {
        tool: String,
        stderr_excerpt: String,
    },

    #[error("{tool} exited cleanly but produced no pattern file at {path}")]
    NoOutput { tool: String, path: PathBuf },

    #[error("pattern extraction timed out after {limit_secs}s")]
    Timeout { limit_secs: u64 },

    #[error("I/O error during extraction: {0}")]
    Io(#[from] std::io::Error),
}

/// Signature merge failure. Fatal for the affected triple only.
#[derive(Error, Debug)]
pub enum MergeError {
    #[error("sigmake not found: {0}")]
    ToolMissing(PathBuf),

    #[error("sigmake failed: {stderr_excerpt}")]
    ToolFailed { stderr_excerpt: String },

    #[error("signature merge timed out after {limit_secs}s")]
    Timeout { limit_secs: u64 },

    #[error("I/O error during merge: {0}")]
    Io(#[from] std::io::Error),
}

/// Whichever package-local error terminated a task.
#[derive(Error, Debug)]
pub enum TaskError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Extract(#[from] ExtractError),
}

impl TaskError {
    /// The pipeline stage this error belongs to.
    pub fn stage(&self) -> FailStage {
        match self {
            TaskError::Fetch(_) => FailStage::Fetch,
            TaskError::Build(_) => FailStage::Build,
            TaskError::Extract(_) => FailStage::Extract,
        }
    }

    /// Renders this error into the clonable form the task table stores.
    pub fn into_failure(self) -> TaskFailure {
        TaskFailure {
            stage: self.stage(),
            reason: self.to_string(),
        }
    }
}

// ============================================================================
// Collaborator traits
// ============================================================================

/// Ranked package listing from the external registry.
#[async_trait]
pub trait PackageRegistry: Send + Sync {
    /// Returns up to `count` packages in registry rank order, skipping any
    /// name in `exclude`. Fewer than `count` results is not an error; the
    /// registry may simply have run out of eligible entries.
    ///
    /// # Errors
    ///
    /// [`RegistryError::Unavailable`] once retries are exhausted — the
    /// caller must treat this as fatal for the whole run.
    async fn top_packages(
        &self,
        count: usize,
        exclude: &[String],
    ) -> Result<Vec<Package>, RegistryError>;
}

/// Materializes package source on local storage.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// Returns the local source directory for `package`.
    ///
    /// # Idempotence
    ///
    /// Fetching an already-present, checksum-verified source must be a
    /// no-op that performs no network calls.
    async fn fetch(&self, package: &Package) -> Result<PathBuf, FetchError>;
}

/// Invokes the compiler toolchain for one (source, triple) pair.
#[async_trait]
pub trait CrossBuilder: Send + Sync {
    /// Produces the static-library artifact paths for `triple`.
    ///
    /// Implementations must bound the build with a deadline and kill the
    /// compiler process when the returned future is dropped, so that run
    /// cancellation leaves no orphaned children behind.
    async fn build(
        &self,
        source_dir: &Path,
        triple: TargetTriple,
    ) -> Result<Vec<PathBuf>, BuildError>;
}

/// Converts compiled artifacts into pattern records.
#[async_trait]
pub trait PatternTool: Send + Sync {
    /// One [`PatternRecord`] per artifact.
    async fn extract(
        &self,
        package: &Package,
        triple: TargetTriple,
        artifacts: &[PathBuf],
    ) -> Result<Vec<PatternRecord>, ExtractError>;
}

/// Merges one triple's pattern records into a signature bundle.
#[async_trait]
pub trait SignatureTool: Send + Sync {
    /// Runs the merge for `triple` over `records`, writing outputs under
    /// `output_dir`. An empty `records` slice yields an empty bundle, not
    /// an error.
    ///
    /// Collision precedence is the merge tool's own; implementations only
    /// translate what the tool reports into [`CollisionRecord`]s.
    ///
    /// [`CollisionRecord`]: crate::model::CollisionRecord
    async fn merge(
        &self,
        triple: TargetTriple,
        records: &[PatternRecord],
        output_dir: &Path,
    ) -> Result<SignatureBundle, MergeError>;
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_error_stage_mapping() {
        let fetch: TaskError = FetchError::MissingVersion {
            name: "serde".to_string(),
            version: "9.9.9".to_string(),
        }
        .into();
        assert_eq!(fetch.stage(), FailStage::Fetch);

        let build: TaskError = BuildError::NoArtifact {
            triple: TargetTriple::X86_64PcWindowsMsvc,
        }
        .into();
        assert_eq!(build.stage(), FailStage::Build);

        let extract: TaskError = ExtractError::Timeout { limit_secs: 60 }.into();
        assert_eq!(extract.stage(), FailStage::Extract);
    }

    #[test]
    fn test_into_failure_keeps_tool_output() {
        let err: TaskError = BuildError::Failed {
            triple: TargetTriple::X86_64UnknownLinuxGnu,
            stderr_excerpt: "error[E0432]: unresolved import".to_string(),
        }
        .into();
        let failure = err.into_failure();
        assert_eq!(failure.stage, FailStage::Build);
        assert!(failure.reason.contains("E0432"));
    }
}
