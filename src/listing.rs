//! Remote directory listings.
//!
//! A directory is addressed by its repository browser URL
//! (`https://github.com/{owner}/{repo}/tree/{branch}/{path}`). The listing is
//! read from the repository contents API and every first-level file is fetched
//! from the raw content host. Subdirectories are not descended into.

use crate::download::Fetcher;
use crate::error::FetchError;
use serde::Deserialize;
use std::path::{Component, Path};
use tracing::{debug, error, info};

/// A directory inside a hosted repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryLocator {
    pub owner: String,
    pub repo: String,
    pub branch: String,
    pub path: String,
}

impl DirectoryLocator {
    /// Parses a `https://github.com/{owner}/{repo}/tree/{branch}/{path}` URL.
    pub fn parse(locator: &str) -> Result<Self, FetchError> {
        let invalid = || FetchError::InvalidLocator(locator.to_string());

        let rest = locator
            .strip_prefix("https://github.com/")
            .or_else(|| locator.strip_prefix("http://github.com/"))
            .ok_or_else(invalid)?;

        let mut parts = rest.splitn(5, '/');
        let owner = parts.next().filter(|s| !s.is_empty()).ok_or_else(invalid)?;
        let repo = parts.next().filter(|s| !s.is_empty()).ok_or_else(invalid)?;
        if parts.next() != Some("tree") {
            return Err(invalid());
        }
        let branch = parts.next().filter(|s| !s.is_empty()).ok_or_else(invalid)?;
        let path = parts
            .next()
            .map(|p| p.trim_end_matches('/'))
            .filter(|p| !p.is_empty())
            .ok_or_else(invalid)?;

        Ok(Self {
            owner: owner.to_string(),
            repo: repo.to_string(),
            branch: branch.to_string(),
            path: path.to_string(),
        })
    }

    /// URL of the machine-readable listing for this directory.
    pub fn api_url(&self, api_base: &str) -> String {
        format!(
            "{}/repos/{}/{}/contents/{}?ref={}",
            api_base.trim_end_matches('/'),
            self.owner,
            self.repo,
            self.path,
            self.branch
        )
    }

    /// Base URL the raw bytes of the directory's files are served under.
    pub fn raw_base_url(&self, raw_base: &str) -> String {
        format!(
            "{}/{}/{}/{}/{}",
            raw_base.trim_end_matches('/'),
            self.owner,
            self.repo,
            self.branch,
            self.path
        )
    }
}

/// One member of a directory listing.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ListingEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl ListingEntry {
    pub fn is_file(&self) -> bool {
        self.kind == "file"
    }

    /// Member names must be a single plain path segment.
    fn has_plain_name(&self) -> bool {
        let mut components = Path::new(&self.name).components();
        matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        )
    }
}

/// URL of the member `name` under `raw_base`, with `name` percent-encoded as
/// a single path segment.
fn member_url(raw_base: &str, name: &str) -> Result<String, FetchError> {
    let invalid = || FetchError::InvalidLocator(raw_base.to_string());
    let mut url = reqwest::Url::parse(raw_base).map_err(|_| invalid())?;
    url.path_segments_mut()
        .map_err(|_| invalid())?
        .pop_if_empty()
        .push(name);
    Ok(url.into())
}

impl Fetcher {
    /// Fetches and decodes the listing at `api_url`.
    pub(crate) async fn fetch_listing_entries(
        &self,
        api_url: &str,
    ) -> Result<Vec<ListingEntry>, FetchError> {
        info!("Fetching directory listing from {}", api_url);

        let response = self
            .client
            .get(api_url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|source| FetchError::Transport {
                url: api_url.to_string(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: api_url.to_string(),
                status,
            });
        }

        let malformed = |detail: String| FetchError::MalformedListing {
            url: api_url.to_string(),
            detail,
        };

        let body = response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| malformed(format!("invalid JSON: {}", e)))?;

        let serde_json::Value::Array(items) = body else {
            return Err(malformed("expected a JSON array of entries".to_string()));
        };

        items
            .into_iter()
            .map(|item| {
                serde_json::from_value::<ListingEntry>(item)
                    .map_err(|e| malformed(format!("invalid entry: {}", e)))
            })
            .collect()
    }

    /// Fetches every first-level file of the directory at `locator` into
    /// `staging_dir`, returning the total number of bytes written.
    ///
    /// A failing member does not stop the others; the call still fails with
    /// [`FetchError::PartialListing`] naming every member that was not fetched.
    pub async fn fetch_listing(
        &self,
        locator: &str,
        staging_dir: &Path,
    ) -> Result<u64, FetchError> {
        let locator = DirectoryLocator::parse(locator)?;
        let api_url = locator.api_url(&self.config.listing_api_base);
        let raw_base = locator.raw_base_url(&self.config.raw_content_base);

        let entries = self.fetch_listing_entries(&api_url).await?;
        let files: Vec<&ListingEntry> = entries.iter().filter(|e| e.is_file()).collect();
        debug!(
            "Listing has {} entries, {} files",
            entries.len(),
            files.len()
        );

        let mut total_bytes = 0u64;
        let mut failed = Vec::new();

        for entry in files {
            if !entry.has_plain_name() {
                error!("Refusing listing member with unsafe name: {}", entry.name);
                failed.push(entry.name.clone());
                continue;
            }

            let url = member_url(&raw_base, &entry.name)?;
            match self.fetch_file(&url, &staging_dir.join(&entry.name)).await {
                Ok(bytes) => total_bytes += bytes,
                Err(e) => {
                    error!("Failed to download {}: {}", entry.name, e);
                    failed.push(entry.name.clone());
                }
            }
        }

        if !failed.is_empty() {
            return Err(FetchError::PartialListing {
                url: api_url,
                failed,
            });
        }
        Ok(total_bytes)
    }
}
