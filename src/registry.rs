//! crates.io package resolver.
//!
//! Pages through the registry's ranked listing (`sort=downloads`) until it
//! has the requested number of eligible packages. Responses are parsed
//! against a strict schema; anything malformed is a typed error, never
//! silently partial data.

use crate::model::Package;
use crate::retry::RetryPolicy;
use crate::traits::{PackageRegistry, RegistryError};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

const DEFAULT_BASE_URL: &str = "https://crates.io/api/v1";

/// Per-request deadline. A stalled connection must surface as a transient
/// error for the retry policy instead of hanging resolution.
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum the registry allows per page.
const PER_PAGE: usize = 100;

// ============================================================================
// Response schema
// ============================================================================

#[derive(Debug, Deserialize)]
struct RegistryPage {
    crates: Vec<RegistryEntry>,
}

#[derive(Debug, Deserialize)]
struct RegistryEntry {
    id: String,
    max_stable_version: Option<String>,
    max_version: Option<String>,
}

impl RegistryEntry {
    /// Stable version preferred; pre-release-only packages fall back to
    /// their latest version, like the registry's own download links do.
    fn version(&self) -> Option<&str> {
        self.max_stable_version
            .as_deref()
            .or(self.max_version.as_deref())
    }
}

fn parse_page(body: &str) -> Result<RegistryPage, RegistryError> {
    serde_json::from_str(body).map_err(|e| RegistryError::Schema(e.to_string()))
}

/// Folds one page of entries into `out`, preserving rank order and
/// honoring the exclusion list. Returns how many entries the page held.
fn absorb_page(
    out: &mut Vec<Package>,
    page: RegistryPage,
    count: usize,
    exclude: &[String],
    next_rank: &mut usize,
) -> usize {
    let seen = page.crates.len();
    for entry in page.crates {
        if out.len() >= count {
            break;
        }
        let rank = *next_rank;
        *next_rank += 1;

        if exclude.iter().any(|name| *name == entry.id) {
            debug!(package = %entry.id, "excluded by configuration");
            continue;
        }
        let Some(version) = entry.version().map(str::to_string) else {
            debug!(package = %entry.id, "no usable version, skipping");
            continue;
        };
        out.push(Package {
            name: entry.id,
            version,
            rank,
        });
    }
    seen
}

// ============================================================================
// Client
// ============================================================================

/// [`PackageRegistry`] backed by the crates.io HTTP API.
pub struct CratesIoRegistry {
    base_url: String,
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl CratesIoRegistry {
    /// Creates a client against the public crates.io API.
    ///
    /// # Errors
    ///
    /// Returns the underlying error if the HTTP client cannot be built.
    pub fn new(retry: RetryPolicy) -> Result<Self, reqwest::Error> {
        Self::with_base_url(DEFAULT_BASE_URL, retry, HTTP_TIMEOUT)
    }

    /// Creates a client against an alternate base URL (used by tests and
    /// registry mirrors).
    pub fn with_base_url(
        base_url: &str,
        retry: RetryPolicy,
        http_timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("sig-harvester/", env!("CARGO_PKG_VERSION")))
            .timeout(http_timeout)
            .connect_timeout(http_timeout)
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            retry,
        })
    }

    async fn get_text(&self, url: &str) -> Result<String, String> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| e.to_string())?
            .error_for_status()
            .map_err(|e| e.to_string())?;
        resp.text().await.map_err(|e| e.to_string())
    }

    /// One page fetch under the retry policy. Schema errors are not
    /// retried; re-requesting the same malformed document cannot help.
    async fn fetch_page(&self, page_no: usize) -> Result<RegistryPage, RegistryError> {
        let url = format!(
            "{}/crates?page={}&per_page={}&sort=downloads",
            self.base_url, page_no, PER_PAGE
        );
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.get_text(&url).await {
                Ok(body) => return parse_page(&body),
                Err(last_error) => match self.retry.delay_after(attempt) {
                    Some(delay) => {
                        warn!(
                            page = page_no,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %last_error,
                            "registry query failed, backing off"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        return Err(RegistryError::Unavailable {
                            attempts: attempt,
                            last_error,
                        })
                    }
                },
            }
        }
    }
}

#[async_trait]
impl PackageRegistry for CratesIoRegistry {
    async fn top_packages(
        &self,
        count: usize,
        exclude: &[String],
    ) -> Result<Vec<Package>, RegistryError> {
        let mut out = Vec::with_capacity(count);
        let mut next_rank = 1usize;
        let mut page_no = 1usize;

        while out.len() < count {
            let page = self.fetch_page(page_no).await?;
            let seen = absorb_page(&mut out, page, count, exclude, &mut next_rank);
            // A short page means the listing is exhausted; fewer than
            // `count` results is a valid outcome.
            if seen < PER_PAGE {
                break;
            }
            page_no += 1;
        }

        debug!(resolved = out.len(), requested = count, "registry resolution complete");
        Ok(out)
    }
}

// ============================================================================
// Tests
// ============================================================================
