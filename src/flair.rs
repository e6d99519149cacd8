//! FLAIR toolchain boundary: pattern extraction and signature merge.
//!
//! Two collaborators live here:
//! - [`FlairPatternTool`] runs `pelf`/`pcf` (chosen per triple) over each
//!   static library, producing one `.pat` file per artifact.
//! - [`SigmakeMergeTool`] fans a triple's `.pat` files into `sigmake`,
//!   translating the tool's exclusion-file output into
//!   [`CollisionRecord`]s and retrying once after stripping the comment
//!   lines sigmake leaves in the `.exc` (the tool's documented way of
//!   accepting its own default resolution).
//!
//! The exclusion-file format is treated as a contract at this boundary;
//! nothing outside this module reads sigmake output directly.

use crate::build::tail_lines;
use crate::model::{CollisionRecord, Package, PatternRecord, SignatureBundle, TargetTriple};
use crate::traits::{ExtractError, MergeError, PatternTool, SignatureTool};
use async_trait::async_trait;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

const STDERR_TAIL_LINES: usize = 10;

// ============================================================================
// Shared process plumbing
// ============================================================================

enum ToolRunError {
    Timeout(u64),
    Io(std::io::Error),
}

/// Runs an external tool under a deadline with `kill_on_drop`.
async fn run_tool<I, S>(
    tool: &Path,
    args: I,
    timeout: Duration,
) -> Result<std::process::Output, ToolRunError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let child = Command::new(tool)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(ToolRunError::Io)?;

    tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| ToolRunError::Timeout(timeout.as_secs()))?
        .map_err(ToolRunError::Io)
}

// ============================================================================
// Pattern extraction
// ============================================================================

/// [`PatternTool`] shelling out to the FLAIR pattern generators.
pub struct FlairPatternTool {
    flair_dir: PathBuf,
    pat_dir: PathBuf,
    timeout: Duration,
}

impl FlairPatternTool {
    pub fn new(flair_dir: PathBuf, pat_dir: PathBuf, timeout: Duration) -> Self {
        Self {
            flair_dir,
            pat_dir,
            timeout,
        }
    }

    fn pat_path(&self, package: &Package, triple: TargetTriple, index: usize) -> PathBuf {
        let name = if index == 0 {
            format!("{}_{}.pat", package.name, triple.suffix())
        } else {
            format!("{}_{}_{}.pat", package.name, triple.suffix(), index)
        };
        self.pat_dir.join(name)
    }
}

#[async_trait]
impl PatternTool for FlairPatternTool {
    async fn extract(
        &self,
        package: &Package,
        triple: TargetTriple,
        artifacts: &[PathBuf],
    ) -> Result<Vec<PatternRecord>, ExtractError> {
        let tool = self.flair_dir.join(triple.pattern_tool());
        if !tool.is_file() {
            return Err(ExtractError::ToolMissing(tool));
        }
        tokio::fs::create_dir_all(&self.pat_dir).await?;

        let mut records = Vec::with_capacity(artifacts.len());
        for (index, artifact) in artifacts.iter().enumerate() {
            let pat_path = self.pat_path(package, triple, index);
            debug!(
                tool = triple.pattern_tool(),
                artifact = %artifact.display(),
                pat = %pat_path.display(),
                "generating pattern file"
            );

            let output = run_tool(&tool, [artifact.as_path(), pat_path.as_path()], self.timeout)
                .await
                .map_err(|e| match e {
                    ToolRunError::Timeout(limit_secs) => ExtractError::Timeout { limit_secs },
                    ToolRunError::Io(e) => ExtractError::Io(e),
                })?;

            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(ExtractError::ToolFailed {
                    tool: triple.pattern_tool().to_string(),
                    stderr_excerpt: tail_lines(&stderr, STDERR_TAIL_LINES),
                });
            }
            if !pat_path.is_file() {
                return Err(ExtractError::NoOutput {
                    tool: triple.pattern_tool().to_string(),
                    path: pat_path,
                });
            }

            records.push(PatternRecord {
                package: package.clone(),
                triple,
                pat_path,
            });
        }

        info!(package = %package, triple = %triple, count = records.len(), "patterns extracted");
        Ok(records)
    }
}

// ============================================================================
// Exclusion-file translation
// ============================================================================

/// Identifiers named in a sigmake exclusion file, in first-seen order.
/// Lines starting with `;` are sigmake's remarks, not collision entries.
fn parse_exc_identifiers(exc: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for line in exc.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with(';') {
            continue;
        }
        if let Some(identifier) = line.split_whitespace().next() {
            let identifier = identifier.trim_start_matches(['+', '-']);
            if !identifier.is_empty() && !out.iter().any(|i| i == identifier) {
                out.push(identifier.to_string());
            }
        }
    }
    out
}

/// Drops comment and blank lines, which is how sigmake is told to apply
/// its default resolution on the rerun.
fn strip_exc_comments(exc: &str) -> String {
    let mut out = String::new();
    for line in exc.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with(';') {
            continue;
        }
        out.push_str(line);
        out.push('\n');
    }
    out
}

/// Attributes each colliding identifier to the packages whose pattern
/// files mention it.
fn attribute_collisions(
    identifiers: &[String],
    pats: &[(String, String)],
) -> Vec<CollisionRecord> {
    identifiers
        .iter()
        .map(|identifier| {
            let mut packages: Vec<String> = Vec::new();
            for (package, content) in pats {
                let mentioned = content
                    .lines()
                    .any(|line| line.split_whitespace().any(|tok| tok == identifier));
                if mentioned && !packages.contains(package) {
                    packages.push(package.clone());
                }
            }
            CollisionRecord {
                identifier: identifier.clone(),
                packages,
            }
        })
        .collect()
}

// ============================================================================
// Signature merge
// ============================================================================

/// [`SignatureTool`] shelling out to sigmake once per triple.
pub struct SigmakeMergeTool {
    flair_dir: PathBuf,
    timeout: Duration,
}

impl SigmakeMergeTool {
    pub fn new(flair_dir: PathBuf, timeout: Duration) -> Self {
        Self { flair_dir, timeout }
    }

    async fn run_sigmake(
        &self,
        tool: &Path,
        pats: &[&Path],
        sig_path: &Path,
    ) -> Result<std::process::Output, MergeError> {
        let mut args: Vec<&Path> = pats.to_vec();
        args.push(sig_path);
        run_tool(tool, args, self.timeout).await.map_err(|e| match e {
            ToolRunError::Timeout(limit_secs) => MergeError::Timeout { limit_secs },
            ToolRunError::Io(e) => MergeError::Io(e),
        })
    }
}

#[async_trait]
impl SignatureTool for SigmakeMergeTool {
    async fn merge(
        &self,
        triple: TargetTriple,
        records: &[PatternRecord],
        output_dir: &Path,
    ) -> Result<SignatureBundle, MergeError> {
        let records: Vec<&PatternRecord> =
            records.iter().filter(|r| r.triple == triple).collect();
        if records.is_empty() {
            warn!(triple = %triple, "no surviving patterns, emitting empty bundle");
            return Ok(SignatureBundle::empty(triple));
        }

        let tool = self.flair_dir.join("sigmake");
        if !tool.is_file() {
            return Err(MergeError::ToolMissing(tool));
        }
        tokio::fs::create_dir_all(output_dir).await?;

        let base = format!("signatures_{}", triple.suffix());
        let sig_path = output_dir.join(format!("{base}.sig"));
        let exc_path = output_dir.join(format!("{base}.exc"));
        // A stale exclusion file from an earlier run would skew the rerun.
        if exc_path.exists() {
            tokio::fs::remove_file(&exc_path).await?;
        }

        let pats: Vec<&Path> = records.iter().map(|r| r.pat_path.as_path()).collect();
        let first = self.run_sigmake(&tool, &pats, &sig_path).await?;

        let mut collisions = Vec::new();
        if !first.status.success() {
            if !exc_path.is_file() {
                let stderr = String::from_utf8_lossy(&first.stderr);
                return Err(MergeError::ToolFailed {
                    stderr_excerpt: tail_lines(&stderr, STDERR_TAIL_LINES),
                });
            }

            let exc = tokio::fs::read_to_string(&exc_path).await?;
            let identifiers = parse_exc_identifiers(&exc);
            let mut pat_contents = Vec::with_capacity(records.len());
            for record in &records {
                let content = tokio::fs::read_to_string(&record.pat_path).await?;
                pat_contents.push((record.package.name.clone(), content));
            }
            collisions = attribute_collisions(&identifiers, &pat_contents);
            info!(
                triple = %triple,
                collisions = collisions.len(),
                "sigmake reported collisions, applying default resolution"
            );

            tokio::fs::write(&exc_path, strip_exc_comments(&exc)).await?;
            let second = self.run_sigmake(&tool, &pats, &sig_path).await?;
            if !second.status.success() {
                let stderr = String::from_utf8_lossy(&second.stderr);
                return Err(MergeError::ToolFailed {
                    stderr_excerpt: tail_lines(&stderr, STDERR_TAIL_LINES),
                });
            }
        }

        let contributors: Vec<Package> =
            records.iter().map(|r| r.package.clone()).collect();
        info!(
            triple = %triple,
            sig = %sig_path.display(),
            contributors = contributors.len(),
            "signature bundle written"
        );
        Ok(SignatureBundle {
            triple,
            sig_path: Some(sig_path),
            contributors,
            collisions,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
