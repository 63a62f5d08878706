// src/firmware/registry.rs - Paginated HTTP release registry client
use super::{CatalogError, FirmwareRelease, FirmwareSource, ReleaseFetcher};
use crate::config::CatalogConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct RegistryRelease {
    tag_name: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    draft: bool,
    #[serde(default)]
    assets: Vec<RegistryAsset>,
}

#[derive(Debug, Deserialize)]
struct RegistryAsset {
    name: String,
    browser_download_url: String,
    size: u64,
}

/// Map one page of registry JSON to releases carrying a matching asset.
pub fn parse_releases(json: &str, asset_pattern: &Regex) -> Result<Vec<FirmwareRelease>, CatalogError> {
    let page: Vec<RegistryRelease> = serde_json::from_str(json)?;
    Ok(page.into_iter().filter_map(|r| to_release(r, asset_pattern)).collect())
}

fn to_release(release: RegistryRelease, asset_pattern: &Regex) -> Option<FirmwareRelease> {
    if release.draft {
        return None;
    }
    let asset = release.assets.into_iter().find(|a| asset_pattern.is_match(&a.name))?;
    let version = release.tag_name.trim_start_matches('v').to_string();
    Some(FirmwareRelease {
        title: release.name.filter(|n| !n.trim().is_empty()).unwrap_or_else(|| release.tag_name.clone()),
        version,
        notes: release.body.unwrap_or_default(),
        published_at: release.published_at,
        source: FirmwareSource::Remote { url: asset.browser_download_url },
        size: asset.size,
        is_recommended: false,
        is_bundled: false,
    })
}

/// Fetches releases from a GitHub-style `/repos/{owner}/{repo}/releases` endpoint.
pub struct HttpReleaseFetcher {
    http: Client,
    api_base: String,
    repository: String,
    asset_pattern: Regex,
    per_page: u32,
    max_pages: u32,
}

impl HttpReleaseFetcher {
    pub fn from_config(config: &CatalogConfig) -> Result<Self, CatalogError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .user_agent(concat!("blocklink/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            repository: config.repository.clone(),
            asset_pattern: Regex::new(&config.asset_pattern)?,
            per_page: config.per_page,
            max_pages: config.max_pages,
        })
    }

    fn page_url(&self, page: u32) -> String {
        format!(
            "{}/repos/{}/releases?per_page={}&page={}",
            self.api_base, self.repository, self.per_page, page
        )
    }
}

#[async_trait]
impl ReleaseFetcher for HttpReleaseFetcher {
    async fn fetch_releases(&self) -> Result<Vec<FirmwareRelease>, CatalogError> {
        let mut releases = Vec::new();
        for page in 1..=self.max_pages {
            let url = self.page_url(page);
            tracing::debug!("GET {}", url);
            let resp = self
                .http
                .get(&url)
                .header(reqwest::header::ACCEPT, "application/vnd.github+json")
                .send()
                .await?;

            let status = resp.status();
            let text = resp.text().await?;
            if !status.is_success() {
                return Err(CatalogError::Status {
                    status: status.as_u16(),
                    body: text.chars().take(200).collect(),
                });
            }

            let page: Vec<RegistryRelease> = serde_json::from_str(&text)?;
            if page.is_empty() {
                break;
            }
            let count = page.len();
            releases.extend(page.into_iter().filter_map(|r| to_release(r, &self.asset_pattern)));
            if count < self.per_page as usize {
                break;
            }
        }
        Ok(releases)
    }
}
