//! Source materialization for resolved packages.
//!
//! Downloads the `.crate` tarball for a (name, version) pair, verifies the
//! registry-published sha256, and unpacks it under the staging directory.
//! The on-disk layout per package is deterministic:
//!
//! ```text
//! <staging>/<name>-<version>.crate    downloaded tarball
//! <staging>/<name>-<version>.sha256   verified digest sidecar
//! <staging>/<name>-<version>/         unpacked source tree
//! ```
//!
//! A package whose tarball, sidecar, and source tree are all present with a
//! matching digest is served from cache without touching the network.

use crate::model::Package;
use crate::retry::RetryPolicy;
use crate::traits::{FetchError, SourceFetcher};
use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

const DEFAULT_API_URL: &str = "https://crates.io/api/v1";
const DEFAULT_DL_URL: &str = "https://static.crates.io/crates";

/// Per-request deadline. A stalled download must surface as a transient
/// error for the retry policy instead of hanging the worker.
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Version metadata schema
// ============================================================================

#[derive(Debug, Deserialize)]
struct VersionDetail {
    version: VersionInfo,
}

#[derive(Debug, Deserialize)]
struct VersionInfo {
    checksum: String,
}

// ============================================================================
// Helpers
// ============================================================================

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Unpacks a gzipped tarball into `dest`. The tar crate already refuses
/// entries that would escape the destination.
fn unpack_tarball(tar_path: &Path, dest: &Path) -> std::io::Result<()> {
    let file = std::fs::File::open(tar_path)?;
    let decoder = flate2::read::GzDecoder::new(file);
    let mut archive = tar::Archive::new(decoder);
    archive.unpack(dest)
}

enum DownloadFailure {
    NotFound,
    Transient(String),
}

// ============================================================================
// Fetcher
// ============================================================================

/// [`SourceFetcher`] backed by the crates.io download CDN.
pub struct CratesIoFetcher {
    api_url: String,
    dl_url: String,
    client: reqwest::Client,
    staging_dir: PathBuf,
    retry: RetryPolicy,
}

impl CratesIoFetcher {
    /// Creates a fetcher staging sources under `staging_dir`.
    ///
    /// # Errors
    ///
    /// Returns the underlying error if the HTTP client cannot be built.
    pub fn new(staging_dir: PathBuf, retry: RetryPolicy) -> Result<Self, reqwest::Error> {
        Self::with_base_urls(DEFAULT_API_URL, DEFAULT_DL_URL, staging_dir, retry, HTTP_TIMEOUT)
    }

    /// Creates a fetcher against alternate endpoints (tests, mirrors).
    pub fn with_base_urls(
        api_url: &str,
        dl_url: &str,
        staging_dir: PathBuf,
        retry: RetryPolicy,
        http_timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("sig-harvester/", env!("CARGO_PKG_VERSION")))
            .timeout(http_timeout)
            .connect_timeout(http_timeout)
            .build()?;
        Ok(Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            dl_url: dl_url.trim_end_matches('/').to_string(),
            client,
            staging_dir,
            retry,
        })
    }

    fn tarball_path(&self, package: &Package) -> PathBuf {
        self.staging_dir.join(format!("{}.crate", package.slug()))
    }

    fn sidecar_path(&self, package: &Package) -> PathBuf {
        self.staging_dir.join(format!("{}.sha256", package.slug()))
    }

    fn source_dir(&self, package: &Package) -> PathBuf {
        self.staging_dir.join(package.slug())
    }

    /// Checks whether the package is already staged with a verified digest.
    async fn cache_hit(&self, package: &Package) -> bool {
        let tarball = self.tarball_path(package);
        let sidecar = self.sidecar_path(package);
        let source = self.source_dir(package);
        if !source.is_dir() {
            return false;
        }
        let (Ok(bytes), Ok(expected)) = (
            tokio::fs::read(&tarball).await,
            tokio::fs::read_to_string(&sidecar).await,
        ) else {
            return false;
        };
        let actual = tokio::task::spawn_blocking(move || sha256_hex(&bytes)).await;
        matches!(actual, Ok(digest) if digest == expected.trim())
    }

    async fn get_bytes(&self, url: &str) -> Result<Vec<u8>, DownloadFailure> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| DownloadFailure::Transient(e.to_string()))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(DownloadFailure::NotFound);
        }
        let resp = resp
            .error_for_status()
            .map_err(|e| DownloadFailure::Transient(e.to_string()))?;
        resp.bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| DownloadFailure::Transient(e.to_string()))
    }

    /// GET with the retry policy; 404 is terminal, everything else backs
    /// off until the attempt budget runs out.
    async fn get_with_retry(&self, url: &str, package: &Package) -> Result<Vec<u8>, FetchError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.get_bytes(url).await {
                Ok(bytes) => return Ok(bytes),
                Err(DownloadFailure::NotFound) => {
                    return Err(FetchError::MissingVersion {
                        name: package.name.clone(),
                        version: package.version.clone(),
                    })
                }
                Err(DownloadFailure::Transient(last_error)) => {
                    match self.retry.delay_after(attempt) {
                        Some(delay) => {
                            warn!(
                                package = %package,
                                attempt,
                                delay_ms = delay.as_millis() as u64,
                                error = %last_error,
                                "download failed, backing off"
                            );
                            tokio::time::sleep(delay).await;
                        }
                        None => {
                            return Err(FetchError::Network {
                                attempts: attempt,
                                last_error,
                            })
                        }
                    }
                }
            }
        }
    }

    async fn published_checksum(&self, package: &Package) -> Result<String, FetchError> {
        let url = format!("{}/crates/{}/{}", self.api_url, package.name, package.version);
        let body = self.get_with_retry(&url, package).await?;
        let detail: VersionDetail = serde_json::from_slice(&body)
            .map_err(|e| FetchError::Metadata(e.to_string()))?;
        Ok(detail.version.checksum)
    }
}

#[async_trait]
impl SourceFetcher for CratesIoFetcher {
    async fn fetch(&self, package: &Package) -> Result<PathBuf, FetchError> {
        let source_dir = self.source_dir(package);

        if self.cache_hit(package).await {
            debug!(package = %package, "source already staged, skipping download");
            return Ok(source_dir);
        }

        tokio::fs::create_dir_all(&self.staging_dir).await?;

        let expected = self.published_checksum(package).await?;
        let url = format!(
            "{}/{}/{}.crate",
            self.dl_url,
            package.name,
            package.slug()
        );
        let bytes = self.get_with_retry(&url, package).await?;

        let actual = {
            let bytes = bytes.clone();
            tokio::task::spawn_blocking(move || sha256_hex(&bytes))
                .await
                .map_err(|e| FetchError::Unpack(format!("hash task failed: {e}")))?
        };
        if actual != expected {
            return Err(FetchError::ChecksumMismatch { expected, actual });
        }

        let tarball = self.tarball_path(package);
        tokio::fs::write(&tarball, &bytes).await?;
        tokio::fs::write(self.sidecar_path(package), &actual).await?;

        // Stale partial unpacks from an interrupted run are discarded.
        if source_dir.exists() {
            tokio::fs::remove_dir_all(&source_dir).await?;
        }

        let staging = self.staging_dir.clone();
        let tarball_for_unpack = tarball.clone();
        tokio::task::spawn_blocking(move || unpack_tarball(&tarball_for_unpack, &staging))
            .await
            .map_err(|e| FetchError::Unpack(format!("unpack task failed: {e}")))?
            .map_err(|e| FetchError::Unpack(e.to_string()))?;

        if !source_dir.is_dir() {
            return Err(FetchError::Unpack(format!(
                "archive did not contain expected directory {}",
                package.slug()
            )));
        }

        info!(package = %package, path = %source_dir.display(), "source staged");
        Ok(source_dir)
    }
}

// ============================================================================
// Tests
// ============================================================================
