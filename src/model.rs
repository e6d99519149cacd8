//! Core data model for the signature harvest pipeline.
//!
//! Everything the coordinator tracks flows through these types:
//! - [`Package`] identities resolved from the registry
//! - [`TargetTriple`] — the fixed set of cross-compile targets
//! - [`TaskState`] — the per-(package, triple) state machine
//! - [`PatternRecord`] / [`SignatureBundle`] — extraction and merge outputs

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

// ============================================================================
// Package identity
// ============================================================================

/// A resolved package identity. Immutable once produced by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Package {
    /// Registry package name (e.g., "serde")
    pub name: String,

    /// Latest stable version at resolution time (e.g., "1.0.210")
    pub version: String,

    /// 1-based rank in the registry's download ordering
    pub rank: usize,
}

impl Package {
    /// Canonical `name-version` form used for staging paths and file names.
    pub fn slug(&self) -> String {
        format!("{}-{}", self.name, self.version)
    }
}

impl fmt::Display for Package {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.version)
    }
}

// ============================================================================
// Target triples
// ============================================================================

/// Cross-compile targets the pipeline produces signatures for.
///
/// The set is closed on purpose: each variant knows which static-library
/// extension the build produces and which FLAIR tool understands that
/// object format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetTriple {
    /// ELF static archives (`.a`), patterns via `pelf`
    X86_64UnknownLinuxGnu,

    /// COFF libraries (`.lib`), patterns via `pcf`
    X86_64PcWindowsMsvc,
}

impl TargetTriple {
    /// All triples the pipeline knows about, in build order.
    pub const ALL: [TargetTriple; 2] = [
        TargetTriple::X86_64UnknownLinuxGnu,
        TargetTriple::X86_64PcWindowsMsvc,
    ];

    /// The canonical triple string cargo understands.
    pub fn name(&self) -> &'static str {
        match self {
            TargetTriple::X86_64UnknownLinuxGnu => "x86_64-unknown-linux-gnu",
            TargetTriple::X86_64PcWindowsMsvc => "x86_64-pc-windows-msvc",
        }
    }

    /// `--target` argument for cargo, or `None` when the host default
    /// already produces this triple (the Linux build runs without a flag,
    /// so its artifacts land under plain `target/release`).
    pub fn cargo_target(&self) -> Option<&'static str> {
        match self {
            TargetTriple::X86_64UnknownLinuxGnu => None,
            TargetTriple::X86_64PcWindowsMsvc => Some("x86_64-pc-windows-msvc"),
        }
    }

    /// Extension of the static library artifact this triple produces.
    pub fn artifact_ext(&self) -> &'static str {
        match self {
            TargetTriple::X86_64UnknownLinuxGnu => "a",
            TargetTriple::X86_64PcWindowsMsvc => "lib",
        }
    }

    /// Name of the FLAIR pattern tool for this object format.
    pub fn pattern_tool(&self) -> &'static str {
        match self {
            TargetTriple::X86_64UnknownLinuxGnu => "pelf",
            TargetTriple::X86_64PcWindowsMsvc => "pcf",
        }
    }

    /// Short suffix used in output file names (e.g., `serde_linux.pat`).
    pub fn suffix(&self) -> &'static str {
        match self {
            TargetTriple::X86_64UnknownLinuxGnu => "linux",
            TargetTriple::X86_64PcWindowsMsvc => "win",
        }
    }

    /// Parses a cargo triple string.
    pub fn parse(s: &str) -> Option<TargetTriple> {
        TargetTriple::ALL.iter().copied().find(|t| t.name() == s)
    }
}

impl fmt::Display for TargetTriple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Task state machine
// ============================================================================

/// Pipeline stage at which a task failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailStage {
    Fetch,
    Build,
    Extract,
}

impl fmt::Display for FailStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FailStage::Fetch => "fetch",
            FailStage::Build => "build",
            FailStage::Extract => "extract",
        })
    }
}

/// Terminal failure detail carried by [`TaskState::Failed`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    /// Which stage produced the failure
    pub stage: FailStage,

    /// Rendered error, including external-tool output where available
    pub reason: String,
}

/// Per-(package, triple) state. Transitions are strictly ordered and
/// one-directional; [`TaskState::can_advance_to`] is the single source of
/// truth for legality. `Failed` is reachable only from the three in-flight
/// states, `Done` only from `Extracted`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TaskState {
    Pending,
    Fetching,
    Fetched,
    Building,
    Built,
    Extracting,
    Extracted,
    Done,
    Failed(TaskFailure),
}

impl TaskState {
    /// Short label for logs and error messages.
    pub fn label(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Fetching => "fetching",
            TaskState::Fetched => "fetched",
            TaskState::Building => "building",
            TaskState::Built => "built",
            TaskState::Extracting => "extracting",
            TaskState::Extracted => "extracted",
            TaskState::Done => "done",
            TaskState::Failed(_) => "failed",
        }
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_advance_to(&self, next: &TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Pending, Fetching)
                | (Fetching, Fetched)
                | (Fetching, Failed(_))
                | (Fetched, Building)
                | (Building, Built)
                | (Building, Failed(_))
                | (Built, Extracting)
                | (Extracting, Extracted)
                | (Extracting, Failed(_))
                | (Extracted, Done)
        )
    }

    /// Whether this state ends the task (no further transitions).
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Done | TaskState::Failed(_))
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Rejected state transition. Always a coordinator bug, never an expected
/// runtime condition, so it carries enough context to pinpoint the caller.
#[derive(Debug, Error, PartialEq)]
#[error("illegal task state transition {from} -> {to}")]
pub struct StateError {
    pub from: String,
    pub to: String,
}

// ============================================================================
// Work units and outputs
// ============================================================================

/// One (package, triple) unit of work, owned by the coordinator's task
/// table and mutated only through validated transitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildTask {
    pub package: Package,
    pub triple: TargetTriple,
    pub state: TaskState,

    /// Static-library paths, populated once the build succeeds
    pub artifacts: Vec<PathBuf>,
}

impl BuildTask {
    pub fn new(package: Package, triple: TargetTriple) -> Self {
        Self {
            package,
            triple,
            state: TaskState::Pending,
            artifacts: Vec::new(),
        }
    }
}

/// Pattern file produced for one successful build. Exists if and only if
/// the owning task reached `Extracted`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternRecord {
    pub package: Package,
    pub triple: TargetTriple,

    /// Path to the `.pat` file on disk (payload stays opaque to us)
    pub pat_path: PathBuf,
}

/// One collision reported by the merge tool, translated from its raw
/// exclusion-file output into a stable internal shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollisionRecord {
    /// Colliding symbol or pattern identifier
    pub identifier: String,

    /// Names of the packages whose patterns contained the identifier
    pub packages: Vec<String>,
}

/// Final merged output for one target triple. Written once by the merge
/// step, never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureBundle {
    pub triple: TargetTriple,

    /// Merged `.sig` path; `None` for an empty bundle (zero survivors)
    pub sig_path: Option<PathBuf>,

    /// Packages whose patterns went into the merge
    pub contributors: Vec<Package>,

    /// Collisions the merge tool reported while building this bundle
    pub collisions: Vec<CollisionRecord>,
}

impl SignatureBundle {
    /// Bundle for a triple with nothing to merge.
    pub fn empty(triple: TargetTriple) -> Self {
        Self {
            triple,
            sig_path: None,
            contributors: Vec::new(),
            collisions: Vec::new(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
