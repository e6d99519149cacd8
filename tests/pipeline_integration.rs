//! End-to-end pipeline tests.
//!
//! The registry and fetcher are in-process fakes; the build, extraction,
//! and merge steps run the real process-backed components against
//! scripted stand-ins for cargo, pelf, and sigmake.

#![cfg(unix)]

use async_trait::async_trait;
use sig_harvester::{
    CargoCrossBuilder, Coordinator, FailStage, FetchError, FlairPatternTool, HarvestConfig,
    Package, PackageRegistry, RegistryError, SigmakeMergeTool, SourceFetcher, TargetTriple,
};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const LINUX: TargetTriple = TargetTriple::X86_64UnknownLinuxGnu;

fn pkg(name: &str, rank: usize) -> Package {
    Package {
        name: name.to_string(),
        version: "0.1.0".to_string(),
        rank,
    }
}

struct StaticRegistry {
    packages: Vec<Package>,
}

#[async_trait]
impl PackageRegistry for StaticRegistry {
    async fn top_packages(
        &self,
        count: usize,
        _exclude: &[String],
    ) -> Result<Vec<Package>, RegistryError> {
        Ok(self.packages.iter().take(count).cloned().collect())
    }
}

/// Serves pre-staged source directories, like a warm fetch cache.
struct StagedFetcher {
    staging: PathBuf,
}

#[async_trait]
impl SourceFetcher for StagedFetcher {
    async fn fetch(&self, package: &Package) -> Result<PathBuf, FetchError> {
        let dir = self.staging.join(package.slug());
        if dir.is_dir() {
            Ok(dir)
        } else {
            Err(FetchError::MissingVersion {
                name: package.name.clone(),
                version: package.version.clone(),
            })
        }
    }
}

fn write_script(path: &Path, body: &str) {
    std::fs::write(path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

/// Stages a package source with a minimal manifest.
fn stage_package(staging: &Path, name: &str) {
    let dir = staging.join(format!("{name}-0.1.0"));
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(
        dir.join("Cargo.toml"),
        format!("[package]\nname = \"{name}\"\nversion = \"0.1.0\"\n"),
    )
    .unwrap();
}

struct Harness {
    _root: tempfile::TempDir,
    staging: PathBuf,
    output: PathBuf,
    flair: PathBuf,
    cargo: PathBuf,
}

impl Harness {
    /// Lays out staging/flair/output directories and a default clean
    /// sigmake. Tests override individual tools afterwards.
    fn new(packages: &[&str]) -> Self {
        let root = tempfile::tempdir().unwrap();
        let staging = root.path().join("staging");
        let output = root.path().join("output");
        let flair = root.path().join("flair");
        std::fs::create_dir_all(&staging).unwrap();
        std::fs::create_dir_all(&flair).unwrap();
        for name in packages {
            stage_package(&staging, name);
        }

        // cargo stand-in: emit a static library named after the package
        let cargo = root.path().join("fake-cargo");
        write_script(
            &cargo,
            r#"name=$(basename "$PWD"); name="${name%-*}"
mkdir -p target/release
touch "target/release/lib${name}.a""#,
        );

        // pelf stand-in: one pattern line derived from the library name
        write_script(
            &flair.join("pelf"),
            r#"echo "AABB 00 fn_$(basename "$1" .a)" > "$2""#,
        );

        // sigmake stand-in: clean merge, last argument is the .sig path
        write_script(
            &flair.join("sigmake"),
            r#"for a; do last="$a"; done; touch "$last""#,
        );

        Self {
            _root: root,
            staging,
            output,
            flair,
            cargo,
        }
    }

    fn coordinator(&self, packages: Vec<Package>) -> Coordinator {
        let config = HarvestConfig::default()
            .with_package_count(packages.len())
            .with_triples(vec![LINUX])
            .with_workers(2)
            .with_build_timeout(Duration::from_secs(30));
        let config = HarvestConfig {
            staging_dir: self.staging.clone(),
            output_dir: self.output.clone(),
            flair_dir: self.flair.clone(),
            ..config
        };

        Coordinator::new(
            Arc::new(StaticRegistry { packages }),
            Arc::new(StagedFetcher {
                staging: self.staging.clone(),
            }),
            Arc::new(
                CargoCrossBuilder::new(Duration::from_secs(30))
                    .with_cargo_bin(self.cargo.clone()),
            ),
            Arc::new(FlairPatternTool::new(
                self.flair.clone(),
                self.staging.join("pats"),
                Duration::from_secs(10),
            )),
            Arc::new(SigmakeMergeTool::new(
                self.flair.clone(),
                Duration::from_secs(10),
            )),
            config,
        )
    }
}

#[tokio::test]
async fn clean_run_produces_bundle_and_exit_zero() {
    let harness = Harness::new(&["alpha", "bravo"]);
    let coordinator = harness.coordinator(vec![pkg("alpha", 1), pkg("bravo", 2)]);

    let report = coordinator.run().await.unwrap();

    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.triples[0].done, 2);
    assert_eq!(report.triples[0].failed, 0);
    assert_eq!(report.bundles.len(), 1);

    let bundle = &report.bundles[0];
    assert_eq!(bundle.triple, LINUX);
    assert_eq!(bundle.contributors.len(), 2);
    assert!(bundle.collisions.is_empty());
    let sig = bundle.sig_path.as_ref().unwrap();
    assert!(sig.is_file());
    assert!(sig.ends_with("signatures_linux.sig"));

    // Pattern files landed in the staging pat directory
    assert!(harness.staging.join("pats/alpha_linux.pat").is_file());
    assert!(harness.staging.join("pats/bravo_linux.pat").is_file());
}

#[tokio::test]
async fn failing_build_is_reported_and_excluded_from_bundle() {
    let harness = Harness::new(&["alpha", "broken", "gamma"]);
    // Override cargo: the "broken" package fails to compile
    write_script(
        &harness.cargo,
        r#"name=$(basename "$PWD"); name="${name%-*}"
if [ "$name" = "broken" ]; then
    echo "error[E0599]: no method named compile" >&2
    exit 101
fi
mkdir -p target/release
touch "target/release/lib${name}.a""#,
    );

    let coordinator =
        harness.coordinator(vec![pkg("alpha", 1), pkg("broken", 2), pkg("gamma", 3)]);
    let report = coordinator.run().await.unwrap();

    assert_eq!(report.exit_code(), 1);
    assert_eq!(report.triples[0].done, 2);
    assert_eq!(report.triples[0].failed, 1);

    assert_eq!(report.failures.len(), 1);
    let failure = &report.failures[0];
    assert_eq!(failure.package.name, "broken");
    assert!(failure.reason.contains("E0599"));

    let mut contributors: Vec<&str> = report.bundles[0]
        .contributors
        .iter()
        .map(|p| p.name.as_str())
        .collect();
    contributors.sort();
    assert_eq!(contributors, vec!["alpha", "gamma"]);
}

#[tokio::test]
async fn failing_extraction_is_isolated_to_its_package() {
    let harness = Harness::new(&["alpha", "noisy"]);
    // Override pelf: the "noisy" package's archive is rejected
    write_script(
        &harness.flair.join("pelf"),
        r#"case "$1" in
*libnoisy*) echo "unsupported object format" >&2; exit 2 ;;
esac
echo "AABB 00 fn_$(basename "$1" .a)" > "$2""#,
    );

    let coordinator = harness.coordinator(vec![pkg("alpha", 1), pkg("noisy", 2)]);
    let report = coordinator.run().await.unwrap();

    assert_eq!(report.exit_code(), 1);
    assert_eq!(report.triples[0].done, 1);
    assert_eq!(report.triples[0].failed, 1);

    let failure = &report.failures[0];
    assert_eq!(failure.package.name, "noisy");
    assert_eq!(failure.stage, FailStage::Extract);
    assert!(failure.reason.contains("unsupported object format"));

    let contributors: Vec<&str> = report.bundles[0]
        .contributors
        .iter()
        .map(|p| p.name.as_str())
        .collect();
    assert_eq!(contributors, vec!["alpha"]);
}

#[tokio::test]
async fn identical_patterns_yield_one_collision_entry() {
    let harness = Harness::new(&["alpha", "bravo"]);
    // Both packages emit the same pattern line
    write_script(&harness.flair.join("pelf"), r#"echo "AABB 00 dup_func" > "$2""#);
    // sigmake: collide once, then accept the stripped exclusion file
    write_script(
        &harness.flair.join("sigmake"),
        r#"for a; do last="$a"; done
exc="${last%.sig}.exc"
if [ -f "$exc" ]; then
    touch "$last"
    exit 0
fi
printf ';--------- conflicting:\ndup_func AABB 0000\ndup_func AABB 0000\n' > "$exc"
exit 1"#,
    );

    let coordinator = harness.coordinator(vec![pkg("alpha", 1), pkg("bravo", 2)]);
    let report = coordinator.run().await.unwrap();

    assert_eq!(report.exit_code(), 0);
    let bundle = &report.bundles[0];
    assert_eq!(bundle.collisions.len(), 1);
    assert_eq!(bundle.collisions[0].identifier, "dup_func");
    let mut names = bundle.collisions[0].packages.clone();
    names.sort();
    assert_eq!(names, vec!["alpha", "bravo"]);
}

#[tokio::test]
async fn missing_source_fails_fetch_stage_only() {
    let harness = Harness::new(&["alpha"]); // "ghost" is never staged
    let coordinator = harness.coordinator(vec![pkg("alpha", 1), pkg("ghost", 2)]);

    let report = coordinator.run().await.unwrap();

    assert_eq!(report.exit_code(), 1);
    assert_eq!(report.triples[0].done, 1);
    assert_eq!(report.triples[0].failed, 1);
    assert_eq!(report.failures[0].package.name, "ghost");
    assert_eq!(report.bundles[0].contributors.len(), 1);
}
