//! Integration tests for the HTTP API

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use blocklink::bridge::BridgeHandle;
use blocklink::config::{BundledFirmware, Config};
use blocklink::firmware::{CatalogCache, CatalogError, FirmwareRelease, FirmwareSource, ReleaseFetcher, SystemClock};
use blocklink::hardware::SimulatedDevice;
use blocklink::web::{create_router, AppState};
use http_body_util::BodyExt; // for .collect().await
use serde_json::{json, Value};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tower::util::ServiceExt; // for `oneshot`

struct FixedFetcher(Option<Vec<FirmwareRelease>>);

#[async_trait]
impl ReleaseFetcher for FixedFetcher {
    async fn fetch_releases(&self) -> Result<Vec<FirmwareRelease>, CatalogError> {
        self.0.clone().ok_or(CatalogError::Status { status: 500, body: String::new() })
    }
}

struct TestApp {
    app: Router,
    device: SimulatedDevice,
    _image: tempfile::NamedTempFile,
}

fn image_file(len: usize) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    let mut image = vec![0x5Au8; len];
    image[0] = 0xE9;
    file.write_all(&image).unwrap();
    file.flush().unwrap();
    file
}

fn test_app(releases: Option<Vec<FirmwareRelease>>, image_len: usize, declared_size: u64) -> TestApp {
    let image = image_file(image_len);
    let bundled = BundledFirmware {
        path: image.path().to_path_buf(),
        size: declared_size,
        ..BundledFirmware::default()
    };
    let catalog = CatalogCache::new(
        Arc::new(FixedFetcher(releases)),
        Arc::new(SystemClock),
        bundled,
        Duration::from_secs(3600),
        Duration::from_secs(60),
    );
    let config = Config::default();
    let device = SimulatedDevice::default();
    let state = AppState {
        catalog: Arc::new(catalog),
        http: reqwest::Client::new(),
        min_transfer_ratio: config.flash.min_transfer_ratio,
        bridge: BridgeHandle::spawn(Arc::new(device.connector()), &config),
    };
    TestApp { app: create_router(state), device, _image: image }
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post(uri: &str, body: impl Into<Body>) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(body.into())
        .unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, body.to_vec())
}

async fn send_json(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let (status, body) = send(app, request).await;
    let json = if body.is_empty() { Value::Null } else { serde_json::from_slice(&body).unwrap() };
    (status, json)
}

const HELLO: &str = r#"{"blocks": [{"kind": "print_line", "inputs": {"VALUE": {"literal": "hello"}}}]}"#;

#[tokio::test]
async fn test_blocks_registry() {
    let t = test_app(None, 64, 64);
    let (status, json) = send_json(&t.app, get("/api/v1/blocks")).await;
    assert_eq!(status, StatusCode::OK);
    let kinds: Vec<&str> = json.as_array().unwrap().iter().filter_map(|b| b["kind"].as_str()).collect();
    assert!(kinds.contains(&"display_text"));
    assert!(kinds.contains(&"shake_detected"));
}

#[tokio::test]
async fn test_compile_returns_linked_program() {
    let t = test_app(None, 64, 64);
    let body = json!({"blocks": [{"kind": "display_text",
        "inputs": {"TEXT": {"literal": "Hi"}, "X": {"literal": 10}, "Y": {"literal": 20}}}]});
    let (status, json) = send_json(&t.app, post("/api/v1/compile", body.to_string())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["user_code"], "board.display.text(\"Hi\", 10, 20)");
    let source = json["source"].as_str().unwrap();
    assert!(source.starts_with("import board\n"));
    assert_eq!(json["bytes"].as_u64(), Some(source.len() as u64));
    assert_eq!(json["digest"].as_str().unwrap().len(), 64);
}

#[tokio::test]
async fn test_compile_rejects_malformed_graph() {
    let t = test_app(None, 64, 64);
    let (status, json) = send_json(&t.app, post("/api/v1/compile", r#"{"blocks": [{"kind": "teleport"}]}"#)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].as_str().is_some());

    let (status, _) = send_json(&t.app, post("/api/v1/compile", "not json")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_catalog_marks_bundled_release() {
    let remote = FirmwareRelease {
        version: "1.25.0".to_string(),
        title: "MicroPython 1.25.0".to_string(),
        notes: String::new(),
        published_at: None,
        source: FirmwareSource::Remote { url: "https://downloads.example/1.25.0.bin".to_string() },
        size: 1_000,
        is_recommended: false,
        is_bundled: false,
    };
    let t = test_app(Some(vec![remote]), 64, 64);
    let (status, json) = send_json(&t.app, get("/api/v1/firmware")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["offline"], false);
    let releases = json["releases"].as_array().unwrap();
    assert_eq!(releases.len(), 2);
    let recommended: Vec<&Value> = releases.iter().filter(|r| r["is_recommended"] == true).collect();
    assert_eq!(recommended.len(), 1);
    assert_eq!(recommended[0]["is_bundled"], true);
    assert_eq!(recommended[0]["source"]["type"], "bundled");
}

#[tokio::test]
async fn test_offline_catalog_lists_bundled_only() {
    let t = test_app(None, 64, 64);
    let (status, json) = send_json(&t.app, get("/api/v1/firmware")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["offline"], true);
    assert_eq!(json["releases"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_download_bundled_firmware() {
    let t = test_app(None, 4096, 4096);
    let version = BundledFirmware::default().version;
    let response = t
        .app
        .clone()
        .oneshot(get(&format!("/api/v1/firmware/{}/binary", version)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "application/octet-stream");
    let disposition = response.headers()["content-disposition"].to_str().unwrap().to_string();
    assert!(disposition.contains(&format!("firmware-{}.bin", version)));
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(body.len(), 4096);
}

#[tokio::test]
async fn test_download_reports_short_image() {
    let t = test_app(None, 4096, 8192);
    let version = BundledFirmware::default().version;
    let (status, json) = send_json(&t.app, get(&format!("/api/v1/firmware/{}/binary", version))).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(json["actual"], 4096);
    assert_eq!(json["expected"], 8192);
}

#[tokio::test]
async fn test_unknown_firmware_version() {
    let t = test_app(None, 64, 64);
    let (status, _) = send_json(&t.app, get("/api/v1/firmware/9.9.9/binary")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_device_requires_connection() {
    let t = test_app(None, 64, 64);
    let (status, json) = send_json(&t.app, get("/api/v1/device")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["state"], "disconnected");

    let (status, json) = send_json(&t.app, post("/api/v1/device/run", HELLO)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(json["error"].as_str().unwrap().contains("disconnected"));
}

#[tokio::test]
async fn test_device_run_input_and_stop() {
    let t = test_app(None, 64, 64);
    let (status, _) = send(&t.app, post("/api/v1/device/connect", Body::empty())).await;
    assert_eq!(status, StatusCode::OK);

    let (status, json) = send_json(&t.app, post("/api/v1/device/run", HELLO)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["user_code"], "print(\"hello\")");
    assert!(t.device.is_running());

    let (status, json) = send_json(&t.app, get("/api/v1/device")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["state"], "running");
    assert_eq!(json["terminal"]["lines"][0], "hello");

    let (status, _) = send(&t.app, post("/api/v1/device/input", json!({"data": "go"}).to_string())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(t.device.host_input(), b"go".to_vec());

    let (status, _) = send(&t.app, post("/api/v1/device/clear", Body::empty())).await;
    assert_eq!(status, StatusCode::OK);
    let (_, json) = send_json(&t.app, get("/api/v1/device")).await;
    assert_eq!(json["terminal"]["lines"].as_array().unwrap().len(), 0);

    let (status, _) = send(&t.app, post("/api/v1/device/stop", Body::empty())).await;
    assert_eq!(status, StatusCode::OK);
    assert!(!t.device.is_running());

    let (status, _) = send(&t.app, post("/api/v1/device/disconnect", Body::empty())).await;
    assert_eq!(status, StatusCode::OK);
    let (_, json) = send_json(&t.app, get("/api/v1/device")).await;
    assert_eq!(json["state"], "disconnected");
}

#[tokio::test]
async fn test_device_save_is_skipped_when_unchanged() {
    let t = test_app(None, 64, 64);
    send(&t.app, post("/api/v1/device/connect", Body::empty())).await;

    let (status, json) = send_json(&t.app, post("/api/v1/device/save", HELLO)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["outcome"], "written");
    assert!(t.device.file("main.py").is_some());

    let (status, json) = send_json(&t.app, post("/api/v1/device/save", HELLO)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["outcome"], "unchanged");
}

#[tokio::test]
async fn test_device_flash_bundled_release() {
    let t = test_app(None, 20_000, 20_000);
    send(&t.app, post("/api/v1/device/connect", Body::empty())).await;

    let version = BundledFirmware::default().version;
    let (status, json) = send_json(&t.app, post(&format!("/api/v1/device/flash/{}", version), Body::empty())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["written"], 20_000);
    assert_eq!(json["blocks"], 2);
    assert!(t.device.flash_finished());

    let (_, json) = send_json(&t.app, get("/api/v1/device")).await;
    assert_eq!(json["state"], "connected");
}
