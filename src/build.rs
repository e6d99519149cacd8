//! Cross-build runner: one cargo invocation per (package, triple).
//!
//! Before building, the fetched manifest is rewritten to force a
//! `staticlib` crate type and `panic = "abort"` in the release profile, so
//! every package yields a FLAIR-consumable archive regardless of how it
//! ships. The compiler runs under a deadline with `kill_on_drop`, so a
//! cancelled or timed-out build reaps its child instead of abandoning it.

use crate::model::TargetTriple;
use crate::traits::{BuildError, CrossBuilder};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

/// How many trailing stderr lines survive into error reports.
const STDERR_TAIL_LINES: usize = 20;

/// Last `n` lines of `text`, for compact diagnostics.
pub(crate) fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

/// Rewrites a package manifest so the build emits a static library:
/// `[lib] crate-type = ["staticlib"]` unconditionally, and
/// `profile.release.panic = "abort"` unless the package already sets one.
fn force_staticlib(manifest: &str) -> Result<String, String> {
    let mut doc: toml::Value = toml::from_str(manifest).map_err(|e| e.to_string())?;
    let root = doc
        .as_table_mut()
        .ok_or_else(|| "manifest root is not a table".to_string())?;

    let lib = root
        .entry("lib")
        .or_insert_with(|| toml::Value::Table(toml::map::Map::new()));
    let lib = lib
        .as_table_mut()
        .ok_or_else(|| "[lib] is not a table".to_string())?;
    lib.insert(
        "crate-type".to_string(),
        toml::Value::Array(vec![toml::Value::String("staticlib".to_string())]),
    );

    let profile = root
        .entry("profile")
        .or_insert_with(|| toml::Value::Table(toml::map::Map::new()));
    let profile = profile
        .as_table_mut()
        .ok_or_else(|| "[profile] is not a table".to_string())?;
    let release = profile
        .entry("release")
        .or_insert_with(|| toml::Value::Table(toml::map::Map::new()));
    let release = release
        .as_table_mut()
        .ok_or_else(|| "[profile.release] is not a table".to_string())?;
    release
        .entry("panic")
        .or_insert(toml::Value::String("abort".to_string()));

    toml::to_string(&doc).map_err(|e| e.to_string())
}

/// Release output directory for a triple. The host-default build lands in
/// plain `target/release`; explicit `--target` builds get a subdirectory.
fn release_dir(source_dir: &Path, triple: TargetTriple) -> PathBuf {
    match triple.cargo_target() {
        Some(t) => source_dir.join("target").join(t).join("release"),
        None => source_dir.join("target").join("release"),
    }
}

/// Scans a release directory for static libraries of the triple's format.
fn find_artifacts(dir: &Path, triple: TargetTriple) -> std::io::Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    if !dir.is_dir() {
        return Ok(out);
    }
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let matches = path
            .extension()
            .map(|ext| ext == triple.artifact_ext())
            .unwrap_or(false);
        if matches && path.is_file() {
            out.push(path);
        }
    }
    out.sort();
    Ok(out)
}

/// [`CrossBuilder`] that shells out to cargo.
pub struct CargoCrossBuilder {
    cargo_bin: PathBuf,
    timeout: Duration,
}

impl CargoCrossBuilder {
    pub fn new(timeout: Duration) -> Self {
        Self {
            cargo_bin: PathBuf::from("cargo"),
            timeout,
        }
    }

    /// Overrides the cargo executable (tests substitute a script here).
    pub fn with_cargo_bin(mut self, bin: PathBuf) -> Self {
        self.cargo_bin = bin;
        self
    }
}

#[async_trait]
impl CrossBuilder for CargoCrossBuilder {
    async fn build(
        &self,
        source_dir: &Path,
        triple: TargetTriple,
    ) -> Result<Vec<PathBuf>, BuildError> {
        let manifest_path = source_dir.join("Cargo.toml");
        let manifest = tokio::fs::read_to_string(&manifest_path).await?;
        let rewritten = force_staticlib(&manifest).map_err(BuildError::ManifestRewrite)?;
        // Rewrite is idempotent, so building a second triple from the same
        // checkout is safe.
        if rewritten != manifest {
            tokio::fs::write(&manifest_path, &rewritten).await?;
        }

        let mut cmd = Command::new(&self.cargo_bin);
        cmd.arg("build")
            .arg("--release")
            .current_dir(source_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(target) = triple.cargo_target() {
            cmd.arg("--target").arg(target);
        }

        debug!(triple = %triple, dir = %source_dir.display(), "starting cargo build");
        let child = cmd.spawn()?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| BuildError::Timeout {
                triple,
                limit_secs: self.timeout.as_secs(),
            })??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BuildError::Failed {
                triple,
                stderr_excerpt: tail_lines(&stderr, STDERR_TAIL_LINES),
            });
        }

        let artifacts = find_artifacts(&release_dir(source_dir, triple), triple)?;
        if artifacts.is_empty() {
            return Err(BuildError::NoArtifact { triple });
        }

        info!(
            triple = %triple,
            count = artifacts.len(),
            "build produced static libraries"
        );
        Ok(artifacts)
    }
}

// ============================================================================
// Tests
// ============================================================================
