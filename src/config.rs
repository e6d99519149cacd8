//! Pipeline configuration.

use crate::model::TargetTriple;
use crate::retry::RetryPolicy;
use std::path::PathBuf;
use std::time::Duration;

/// Everything a pipeline run needs to know up front.
///
/// Defaults mirror the classic layout: top 100 packages, both triples,
/// FLAIR tools in `flair/`, sources staged under `crates/`, outputs in
/// `output/`.
#[derive(Debug, Clone)]
pub struct HarvestConfig {
    /// How many top-ranked packages to process
    pub package_count: usize,

    /// Package names to skip during resolution
    pub exclude: Vec<String>,

    /// Target triples to cross-compile for
    pub triples: Vec<TargetTriple>,

    /// Staging area for downloaded and unpacked sources, partitioned per
    /// package+triple underneath
    pub staging_dir: PathBuf,

    /// Where merged signature bundles and the run report land
    pub output_dir: PathBuf,

    /// Directory containing the FLAIR binaries (pelf, pcf, sigmake)
    pub flair_dir: PathBuf,

    /// Worker-pool size bounding concurrent package units
    pub workers: usize,

    /// Deadline per compiler invocation
    pub build_timeout: Duration,

    /// Deadline per FLAIR tool invocation
    pub tool_timeout: Duration,

    /// Retry schedule for registry queries and source downloads
    pub retry: RetryPolicy,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            package_count: 100,
            exclude: Vec::new(),
            triples: TargetTriple::ALL.to_vec(),
            staging_dir: PathBuf::from("crates"),
            output_dir: PathBuf::from("output"),
            flair_dir: PathBuf::from("flair"),
            workers: 4,
            build_timeout: Duration::from_secs(600),
            tool_timeout: Duration::from_secs(120),
            retry: RetryPolicy::default(),
        }
    }
}

impl HarvestConfig {
    /// Sets the number of packages to resolve.
    pub fn with_package_count(mut self, count: usize) -> Self {
        self.package_count = count;
        self
    }

    /// Sets the target triples to build for.
    pub fn with_triples(mut self, triples: Vec<TargetTriple>) -> Self {
        self.triples = triples;
        self
    }

    /// Sets the worker-pool size.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Sets the per-build deadline.
    pub fn with_build_timeout(mut self, timeout: Duration) -> Self {
        self.build_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_classic_layout() {
        let config = HarvestConfig::default();
        assert_eq!(config.package_count, 100);
        assert_eq!(config.triples, TargetTriple::ALL.to_vec());
        assert_eq!(config.flair_dir, PathBuf::from("flair"));
        assert_eq!(config.staging_dir, PathBuf::from("crates"));
    }

    #[test]
    fn test_workers_floor_is_one() {
        let config = HarvestConfig::default().with_workers(0);
        assert_eq!(config.workers, 1);
    }
}
