use async_trait::async_trait;
use axum::extract::{Path, Query};
use axum::routing::get;
use axum::{Json, Router};
use blocklink::config::{BundledFirmware, CatalogConfig};
use blocklink::firmware::{
    CatalogCache, CatalogError, Clock, FirmwareRelease, FirmwareSource, HttpReleaseFetcher, ManualClock,
    ReleaseFetcher,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const HOUR: Duration = Duration::from_secs(3600);
const MINUTE: Duration = Duration::from_secs(60);

struct StubFetcher {
    calls: AtomicUsize,
    delay: Duration,
    releases: Option<Vec<FirmwareRelease>>,
}

impl StubFetcher {
    fn ok(releases: Vec<FirmwareRelease>) -> Arc<Self> {
        Arc::new(Self { calls: AtomicUsize::new(0), delay: Duration::ZERO, releases: Some(releases) })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self { calls: AtomicUsize::new(0), delay: Duration::ZERO, releases: None })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReleaseFetcher for StubFetcher {
    async fn fetch_releases(&self) -> Result<Vec<FirmwareRelease>, CatalogError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match &self.releases {
            Some(releases) => Ok(releases.clone()),
            None => Err(CatalogError::Status { status: 503, body: "down".to_string() }),
        }
    }
}

fn remote(version: &str) -> FirmwareRelease {
    FirmwareRelease {
        version: version.to_string(),
        title: format!("MicroPython {}", version),
        notes: String::new(),
        published_at: None,
        source: FirmwareSource::Remote { url: format!("https://downloads.example/{}.bin", version) },
        size: 1_000_000,
        is_recommended: false,
        is_bundled: false,
    }
}

fn cache(fetcher: Arc<StubFetcher>, clock: Arc<ManualClock>) -> CatalogCache {
    CatalogCache::new(fetcher, clock, BundledFirmware::default(), HOUR, MINUTE)
}

fn assert_single_bundled(releases: &[FirmwareRelease]) {
    let bundled: Vec<_> = releases.iter().filter(|r| r.is_bundled).collect();
    assert_eq!(bundled.len(), 1);
    assert!(bundled[0].is_recommended);
    assert!(matches!(bundled[0].source, FirmwareSource::Bundled { .. }));
    assert_eq!(releases.iter().filter(|r| r.is_recommended).count(), 1);
}

#[tokio::test]
async fn test_scenario_d_unreachable_registry_yields_bundled_only() {
    let config = CatalogConfig {
        api_base: "http://127.0.0.1:1".to_string(),
        request_timeout_secs: 2,
        ..CatalogConfig::default()
    };
    let cache = CatalogCache::from_config(&config).unwrap();
    let catalog = cache.fetch_catalog().await;

    assert!(catalog.offline);
    assert_eq!(catalog.releases.len(), 1);
    let release = &catalog.releases[0];
    assert_eq!(
        release.source,
        FirmwareSource::Bundled { path: config.bundled.path.clone() }
    );
    assert_single_bundled(&catalog.releases);
}

#[tokio::test]
async fn test_fetch_failure_is_cached_briefly() {
    let fetcher = StubFetcher::failing();
    let clock = Arc::new(ManualClock::new());
    let cache = cache(fetcher.clone(), clock.clone());

    assert!(cache.fetch_catalog().await.offline);
    assert!(cache.fetch_catalog().await.offline);
    assert_eq!(fetcher.calls(), 1);

    clock.advance(MINUTE + Duration::from_secs(1));
    cache.fetch_catalog().await;
    assert_eq!(fetcher.calls(), 2);
}

#[tokio::test]
async fn test_ttl_expiry_refetches() {
    let fetcher = StubFetcher::ok(vec![remote("1.25.0"), remote("1.24.1")]);
    let clock = Arc::new(ManualClock::new());
    let cache = cache(fetcher.clone(), clock.clone());

    let first = cache.fetch_catalog().await;
    assert!(!first.offline);
    assert_eq!(first.releases.len(), 2);
    assert_single_bundled(&first.releases);
    // 1.24.1 is the bundled version: re-targeted locally, not duplicated.
    let bundled = first.find("v1.24.1").unwrap();
    assert!(bundled.is_bundled);

    clock.advance(HOUR - Duration::from_secs(1));
    assert_eq!(cache.fetch_catalog().await, first);
    assert_eq!(fetcher.calls(), 1);

    clock.advance(Duration::from_secs(2));
    let refreshed = cache.fetch_catalog().await;
    assert_eq!(fetcher.calls(), 2);
    assert_eq!(refreshed.fetched_at, clock.now_wallclock());
}

#[tokio::test]
async fn test_invalidate_forces_refetch() {
    let fetcher = StubFetcher::ok(vec![remote("1.25.0")]);
    let cache = cache(fetcher.clone(), Arc::new(ManualClock::new()));
    cache.fetch_catalog().await;
    cache.invalidate().await;
    let catalog = cache.fetch_catalog().await;
    assert_eq!(fetcher.calls(), 2);
    assert_eq!(catalog.releases.len(), 2);
    assert_eq!(catalog.recommended().unwrap().version, BundledFirmware::default().version);
}

#[tokio::test]
async fn test_concurrent_misses_share_one_fetch() {
    let fetcher = Arc::new(StubFetcher {
        calls: AtomicUsize::new(0),
        delay: Duration::from_millis(50),
        releases: Some(vec![remote("1.25.0")]),
    });
    let cache = Arc::new(cache(fetcher.clone(), Arc::new(ManualClock::new())));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let cache = cache.clone();
        handles.push(tokio::spawn(async move { cache.fetch_catalog().await }));
    }
    let mut catalogs = Vec::new();
    for handle in handles {
        catalogs.push(handle.await.unwrap());
    }
    assert_eq!(fetcher.calls(), 1);
    assert!(catalogs.windows(2).all(|w| w[0] == w[1]));
}

fn release_json(tag: &str, asset: &str) -> Value {
    json!({
        "tag_name": tag,
        "name": format!("Release {}", tag),
        "body": "notes",
        "published_at": "2025-01-10T12:00:00Z",
        "draft": false,
        "assets": [
            {"name": "checksums.txt", "browser_download_url": "https://downloads.example/sums", "size": 10},
            {"name": asset, "browser_download_url": format!("https://downloads.example/{}", asset), "size": 2048}
        ]
    })
}

async fn releases_page(
    Path((_owner, _repo)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Value> {
    let page = params.get("page").and_then(|p| p.parse::<u32>().ok()).unwrap_or(1);
    let body = match page {
        1 => json!([
            release_json("v1.26.0", "board-micropython-1.26.0.bin"),
            release_json("v1.25.0", "board-micropython-1.25.0.bin")
        ]),
        2 => json!([release_json("v1.24.0", "other-board-1.24.0.bin")]),
        _ => json!([]),
    };
    Json(body)
}

#[tokio::test]
async fn test_http_fetcher_pages_and_filters_assets() {
    let app = Router::new().route("/repos/{owner}/{repo}/releases", get(releases_page));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let config = CatalogConfig {
        api_base: format!("http://{}", addr),
        per_page: 2,
        max_pages: 5,
        ..CatalogConfig::default()
    };
    let fetcher = HttpReleaseFetcher::from_config(&config).unwrap();
    let releases = fetcher.fetch_releases().await.unwrap();

    let versions: Vec<_> = releases.iter().map(|r| r.version.as_str()).collect();
    assert_eq!(versions, vec!["1.26.0", "1.25.0"]);
    assert_eq!(releases[0].size, 2048);
    assert_eq!(
        releases[0].source,
        FirmwareSource::Remote { url: "https://downloads.example/board-micropython-1.26.0.bin".to_string() }
    );
    assert!(releases[0].published_at.is_some());
}
