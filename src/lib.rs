//! Signature harvest pipeline.
//!
//! Resolves the top packages from the registry, cross-compiles each one as
//! a static library per target triple, runs the FLAIR pattern tools over
//! the artifacts, and merges the patterns into one signature bundle per
//! triple for use in a disassembler.

pub mod build;
pub mod config;
pub mod fetch;
pub mod flair;
pub mod model;
pub mod pipeline;
pub mod registry;
pub mod report;
pub mod retry;
pub mod traits;

// Re-export common types for convenience
pub use build::CargoCrossBuilder;
pub use config::HarvestConfig;
pub use fetch::CratesIoFetcher;
pub use flair::{FlairPatternTool, SigmakeMergeTool};
pub use model::{
    BuildTask, CollisionRecord, FailStage, Package, PatternRecord, SignatureBundle, TargetTriple,
    TaskState,
};
pub use pipeline::{Coordinator, PipelineError};
pub use registry::CratesIoRegistry;
pub use report::RunReport;
pub use retry::RetryPolicy;
pub use traits::{
    BuildError, CrossBuilder, ExtractError, FetchError, MergeError, PackageRegistry, PatternTool,
    RegistryError, SignatureTool, SourceFetcher, TaskError,
};
