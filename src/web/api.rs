//! Defines the Axum API routes and handlers.

use crate::blocks::{self, BlockDefinition, GraphError};
use crate::bridge::{BridgeError, BridgeHandle, FlashReport, SaveOutcome};
use crate::firmware::transfer::fetch_image;
use crate::firmware::{CatalogCache, FirmwareCatalog, TransferError};
use crate::linker::{self, CompiledProgram};
use crate::web::models::{CompileResponse, DeviceStatusResponse, ErrorResponse, TerminalInputRequest};
use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub catalog: Arc<CatalogCache>,
    pub http: reqwest::Client,
    pub min_transfer_ratio: f64,
    pub bridge: BridgeHandle,
}

/// A failed request, rendered as an [`ErrorResponse`].
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorResponse,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self { status, body: ErrorResponse { error: message.into(), actual: None, expected: None } }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<GraphError> for ApiError {
    fn from(e: GraphError) -> Self {
        ApiError::new(StatusCode::BAD_REQUEST, e.to_string())
    }
}

impl From<TransferError> for ApiError {
    fn from(e: TransferError) -> Self {
        let status = match e {
            TransferError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_GATEWAY,
        };
        let mut error = ApiError::new(status, e.to_string());
        if let Some((actual, expected)) = e.sizes() {
            error.body.actual = Some(actual);
            error.body.expected = Some(expected);
        }
        error
    }
}

impl From<BridgeError> for ApiError {
    fn from(e: BridgeError) -> Self {
        let status = match &e {
            BridgeError::InvalidTransition { .. } | BridgeError::NotConnected => StatusCode::CONFLICT,
            BridgeError::ActorGone => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_GATEWAY,
        };
        let sizes = match &e {
            BridgeError::Transfer(transfer) => transfer.sizes(),
            _ => None,
        };
        let mut error = ApiError::new(status, e.to_string());
        if let Some((actual, expected)) = sizes {
            error.body.actual = Some(actual);
            error.body.expected = Some(expected);
        }
        error
    }
}

/// Creates the Axum router with all the API endpoints.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/blocks", get(list_blocks))
        .route("/api/v1/compile", post(compile))
        .route("/api/v1/firmware", get(get_catalog))
        .route("/api/v1/firmware/{version}/binary", get(download_firmware))
        .route("/api/v1/device", get(device_status))
        .route("/api/v1/device/connect", post(connect))
        .route("/api/v1/device/disconnect", post(disconnect))
        .route("/api/v1/device/flash/{version}", post(flash_firmware))
        .route("/api/v1/device/run", post(run_program))
        .route("/api/v1/device/save", post(save_program))
        .route("/api/v1/device/stop", post(stop_program))
        .route("/api/v1/device/input", post(send_input))
        .route("/api/v1/device/clear", post(clear_terminal))
        .with_state(state)
}

/// Handler listing every block kind the editor may place.
async fn list_blocks() -> Json<Vec<&'static BlockDefinition>> {
    Json(blocks::registry())
}

/// The body is parsed by hand so the document depth check runs before serde.
fn compile_body(body: &str) -> Result<CompiledProgram, ApiError> {
    Ok(linker::compile_json(body)?)
}

async fn compile(body: String) -> Result<Json<CompileResponse>, ApiError> {
    let program = compile_body(&body)?;
    Ok(Json(CompileResponse::from(&program)))
}

async fn get_catalog(State(state): State<AppState>) -> Json<FirmwareCatalog> {
    Json(state.catalog.fetch_catalog().await)
}

/// Serve a release's image once its size checks out.
async fn download_firmware(
    State(state): State<AppState>,
    Path(version): Path<String>,
) -> Result<Response, ApiError> {
    let release = state
        .catalog
        .find_release(&version)
        .await
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, format!("no firmware release {}", version)))?;
    let image = fetch_image(&state.http, &release, state.min_transfer_ratio).await?;
    let disposition = format!("attachment; filename=\"firmware-{}.bin\"", release.version);
    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        image,
    )
        .into_response())
}

async fn device_status(State(state): State<AppState>) -> Result<Json<DeviceStatusResponse>, ApiError> {
    let terminal = state.bridge.snapshot().await?;
    Ok(Json(DeviceStatusResponse { state: state.bridge.status(), terminal }))
}

async fn connect(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    state.bridge.connect().await?;
    Ok(StatusCode::OK)
}

async fn disconnect(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    state.bridge.disconnect().await?;
    Ok(StatusCode::OK)
}

async fn flash_firmware(
    State(state): State<AppState>,
    Path(version): Path<String>,
) -> Result<Json<FlashReport>, ApiError> {
    let release = state
        .catalog
        .find_release(&version)
        .await
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, format!("no firmware release {}", version)))?;
    let image = fetch_image(&state.http, &release, state.min_transfer_ratio).await?;
    let task = state.bridge.flash(image, release.size).await?;
    Ok(Json(task.wait().await?))
}

async fn run_program(State(state): State<AppState>, body: String) -> Result<Json<CompileResponse>, ApiError> {
    let program = compile_body(&body)?;
    let response = CompileResponse::from(&program);
    state.bridge.run(program).await?;
    Ok(Json(response))
}

async fn save_program(State(state): State<AppState>, body: String) -> Result<Json<SaveOutcome>, ApiError> {
    let program = compile_body(&body)?;
    Ok(Json(state.bridge.save(program).await?))
}

async fn stop_program(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    state.bridge.stop().await?;
    Ok(StatusCode::OK)
}

async fn send_input(
    State(state): State<AppState>,
    Json(payload): Json<TerminalInputRequest>,
) -> Result<StatusCode, ApiError> {
    state.bridge.send_input(payload.data.into_bytes()).await?;
    Ok(StatusCode::OK)
}

async fn clear_terminal(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    state.bridge.clear().await?;
    Ok(StatusCode::OK)
}
