// src/firmware/mod.rs - Firmware release catalog with TTL cache and bundled fallback
pub mod registry;
pub mod transfer;

use crate::config::{BundledFirmware, CatalogConfig};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;

pub use registry::HttpReleaseFetcher;
pub use transfer::{verify_transfer_size, TransferError};

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("registry request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("registry returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("registry response is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid asset pattern: {0}")]
    Pattern(#[from] regex::Error),
}

/// Where a release's binary comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FirmwareSource {
    Remote { url: String },
    Bundled { path: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareRelease {
    pub version: String,
    pub title: String,
    pub notes: String,
    pub published_at: Option<DateTime<Utc>>,
    pub source: FirmwareSource,
    /// Declared image size in bytes.
    pub size: u64,
    pub is_recommended: bool,
    pub is_bundled: bool,
}

impl FirmwareRelease {
    /// The release shipped with the application.
    pub fn bundled(bundled: &BundledFirmware) -> Self {
        Self {
            version: bundled.version.clone(),
            title: bundled.title.clone(),
            notes: String::new(),
            published_at: Some(bundled.published_at),
            source: FirmwareSource::Bundled { path: bundled.path.clone() },
            size: bundled.size,
            is_recommended: true,
            is_bundled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FirmwareCatalog {
    pub releases: Vec<FirmwareRelease>,
    pub fetched_at: DateTime<Utc>,
    /// True when the registry could not be reached and only the bundled release is listed.
    pub offline: bool,
}

impl FirmwareCatalog {
    /// Catalog from registry releases, with exactly one bundled, recommended entry.
    ///
    /// A registry release matching the bundled version is re-targeted at the
    /// local asset; otherwise the bundled release is listed first.
    pub fn from_releases(
        mut releases: Vec<FirmwareRelease>,
        bundled: &BundledFirmware,
        fetched_at: DateTime<Utc>,
    ) -> Self {
        for release in &mut releases {
            release.is_bundled = false;
            release.is_recommended = false;
        }
        match releases.iter_mut().find(|r| r.version == bundled.version) {
            Some(release) => {
                release.source = FirmwareSource::Bundled { path: bundled.path.clone() };
                release.size = bundled.size;
                release.is_bundled = true;
                release.is_recommended = true;
            }
            None => releases.insert(0, FirmwareRelease::bundled(bundled)),
        }
        Self { releases, fetched_at, offline: false }
    }

    pub fn fallback(bundled: &BundledFirmware, fetched_at: DateTime<Utc>) -> Self {
        Self {
            releases: vec![FirmwareRelease::bundled(bundled)],
            fetched_at,
            offline: true,
        }
    }

    pub fn recommended(&self) -> Option<&FirmwareRelease> {
        self.releases.iter().find(|r| r.is_recommended)
    }

    pub fn find(&self, version: &str) -> Option<&FirmwareRelease> {
        let version = version.trim_start_matches('v');
        self.releases.iter().find(|r| r.version == version)
    }
}

/// Source of registry releases.
#[async_trait]
pub trait ReleaseFetcher: Send + Sync {
    async fn fetch_releases(&self) -> Result<Vec<FirmwareRelease>, CatalogError>;
}

pub trait Clock: Send + Sync {
    fn now_monotonic(&self) -> Instant;
    fn now_wallclock(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_monotonic(&self) -> Instant {
        Instant::now()
    }

    fn now_wallclock(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    start: Instant,
    start_wall: DateTime<Utc>,
    elapsed: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self { start: Instant::now(), start_wall: Utc::now(), elapsed: Mutex::new(Duration::ZERO) }
    }

    pub fn advance(&self, by: Duration) {
        let mut elapsed = self.elapsed.lock().unwrap_or_else(|e| e.into_inner());
        *elapsed += by;
    }

    fn elapsed(&self) -> Duration {
        *self.elapsed.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now_monotonic(&self) -> Instant {
        self.start + self.elapsed()
    }

    fn now_wallclock(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.elapsed()).unwrap_or(chrono::Duration::zero());
        self.start_wall + elapsed
    }
}

#[derive(Debug)]
struct CachedCatalog {
    catalog: FirmwareCatalog,
    expires_at: Instant,
}

/// TTL cache in front of a [`ReleaseFetcher`].
///
/// The entry lock is held across a refresh, so callers arriving during a
/// miss wait for and share the single in-flight fetch.
pub struct CatalogCache {
    fetcher: Arc<dyn ReleaseFetcher>,
    clock: Arc<dyn Clock>,
    bundled: BundledFirmware,
    ttl: Duration,
    fallback_ttl: Duration,
    entry: tokio::sync::Mutex<Option<CachedCatalog>>,
}

impl CatalogCache {
    pub fn new(
        fetcher: Arc<dyn ReleaseFetcher>,
        clock: Arc<dyn Clock>,
        bundled: BundledFirmware,
        ttl: Duration,
        fallback_ttl: Duration,
    ) -> Self {
        Self { fetcher, clock, bundled, ttl, fallback_ttl, entry: tokio::sync::Mutex::new(None) }
    }

    /// Cache backed by the HTTP registry described in `config`.
    pub fn from_config(config: &CatalogConfig) -> Result<Self, CatalogError> {
        let fetcher = HttpReleaseFetcher::from_config(config)?;
        Ok(Self::new(
            Arc::new(fetcher),
            Arc::new(SystemClock),
            config.bundled.clone(),
            Duration::from_secs(config.ttl_secs),
            Duration::from_secs(config.fallback_ttl_secs),
        ))
    }

    /// Current catalog. Never fails: registry errors yield the bundled fallback.
    pub async fn fetch_catalog(&self) -> FirmwareCatalog {
        let mut entry = self.entry.lock().await;
        let now = self.clock.now_monotonic();
        if let Some(cached) = entry.as_ref() {
            if now < cached.expires_at {
                return cached.catalog.clone();
            }
        }

        let fetched_at = self.clock.now_wallclock();
        let (catalog, ttl) = match self.fetcher.fetch_releases().await {
            Ok(releases) => {
                tracing::info!("Fetched {} firmware releases from registry", releases.len());
                (FirmwareCatalog::from_releases(releases, &self.bundled, fetched_at), self.ttl)
            }
            Err(e) => {
                tracing::warn!(
                    "Firmware registry unavailable ({}); offering bundled {} only",
                    e,
                    self.bundled.version
                );
                (FirmwareCatalog::fallback(&self.bundled, fetched_at), self.fallback_ttl)
            }
        };
        *entry = Some(CachedCatalog { catalog: catalog.clone(), expires_at: now + ttl });
        catalog
    }

    pub async fn find_release(&self, version: &str) -> Option<FirmwareRelease> {
        self.fetch_catalog().await.find(version).cloned()
    }

    pub async fn invalidate(&self) {
        *self.entry.lock().await = None;
    }
}
