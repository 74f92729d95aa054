// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! HTTP API for uploads, analysis jobs, and detections

use axum::{
    extract::{
        multipart::{MultipartError, MultipartRejection},
        rejection::{JsonRejection, PathRejection, QueryRejection},
        DefaultBodyLimit, Multipart, Path, Query, State,
    },
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::fmt::Display;
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::analysis::{FileAnalyzer, TargetRecognizer};
use crate::config::AppConfig;
use crate::db::{new_id, now, AnalysisJob, Database, Detection, FileRecord};
use crate::jobs::{job_queue, wait_for_shutdown, JobOrchestrator, JobWorkerPool, ResultAggregator};
use crate::storage::BlobStore;
use crate::{DeepTrackError, Result};

const SERVICE_NAME: &str = "Multispectral Target Recognition & Tracking API";

/// Shared application state
pub struct AppState {
    pub db: Database,
    pub blobs: BlobStore,
    pub orchestrator: JobOrchestrator,
    pub config: AppConfig,
}

/// Wire up the store, blob directory, analyzer, and job queue.
///
/// The returned pool must be driven with [`JobWorkerPool::run`] for jobs to execute.
pub fn assemble(
    config: AppConfig,
    db: Database,
    recognizer: Arc<dyn TargetRecognizer>,
    shutdown: watch::Receiver<bool>,
) -> Result<(Arc<AppState>, JobWorkerPool)> {
    let blobs = BlobStore::open(&config.storage.upload_dir)?;
    let analyzer = FileAnalyzer::new(
        recognizer,
        config.prompts.detection.clone(),
        config.ai_engine.max_image_dimension,
    );
    let aggregator = Arc::new(ResultAggregator::new(db.clone(), analyzer));
    let (queue, pool) = job_queue(
        config.jobs.queue_capacity,
        config.jobs.workers,
        aggregator,
        db.clone(),
        shutdown,
    );

    let state = Arc::new(AppState {
        orchestrator: JobOrchestrator::new(db.clone(), queue),
        db,
        blobs,
        config,
    });
    Ok((state, pool))
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    let web = &state.config.web;
    let body_limit = DefaultBodyLimit::max(web.max_upload_bytes);
    let cors = cors_layer(&web.cors_origins);

    Router::new()
        .route("/api", get(api_root))
        .route("/api/", get(api_root))
        .route("/api/upload", post(upload_file))
        .route("/api/files", get(list_files))
        .route("/api/files/:id", delete(delete_file))
        .route("/api/analyze", post(analyze_files))
        .route("/api/jobs", get(list_jobs))
        .route("/api/jobs/:id", get(get_job))
        .route("/api/detections", get(list_detections))
        .fallback(unknown_route)
        .layer(body_limit)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.iter().any(|o| o == "*") {
        return CorsLayer::permissive();
    }

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin: {}", origin);
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(allowed)
        .allow_methods(Any)
        .allow_headers(Any)
}

// === Errors ===

/// Error response rendered as `{"detail": "..."}`
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self { status, detail: detail.into() }
    }

    fn not_found(detail: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, detail)
    }

    fn unprocessable(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, detail)
    }

    /// 500 with the operation name in front of the cause
    fn failed(operation: &str, cause: impl Display) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, format!("{} failed: {}", operation, cause))
    }

    /// A malformed or oversized multipart body keeps its own status (400, 413)
    fn upload_rejected(err: MultipartError) -> Self {
        Self::new(err.status(), format!("Upload failed: {}", err.body_text()))
    }
}

// Extractor rejections keep their status but use the JSON error body
macro_rules! impl_from_rejection {
    ($($rejection:ty),+ $(,)?) => {
        $(
            impl From<$rejection> for ApiError {
                fn from(rejection: $rejection) -> Self {
                    Self::new(rejection.status(), rejection.body_text())
                }
            }
        )+
    };
}

impl_from_rejection!(JsonRejection, MultipartRejection, PathRejection, QueryRejection);

impl From<DeepTrackError> for ApiError {
    fn from(err: DeepTrackError) -> Self {
        let status = match err {
            DeepTrackError::NotFound(_) => StatusCode::NOT_FOUND,
            DeepTrackError::InvalidInput(_) => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!("{}", self.detail);
        }
        (self.status, Json(json!({ "detail": self.detail }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

/// An extractor whose rejection is turned into an [`ApiError`] by the handler
type Extracted<T, R> = std::result::Result<T, R>;

// === Handlers ===

async fn api_root(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "message": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "queue": state.orchestrator.queue().snapshot(),
    }))
}

async fn unknown_route() -> ApiError {
    ApiError::not_found("Not Found")
}

async fn upload_file(
    State(state): State<Arc<AppState>>,
    multipart: Extracted<Multipart, MultipartRejection>,
) -> ApiResult<FileRecord> {
    let mut multipart = multipart?;
    let mut upload = None;
    let mut file_type = None;
    let mut metadata = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(ApiError::upload_rejected)?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                let filename = field.file_name().unwrap_or("upload").to_string();
                let bytes = field.bytes().await.map_err(ApiError::upload_rejected)?;
                upload = Some((filename, bytes));
            }
            "file_type" => {
                file_type = Some(field.text().await.map_err(ApiError::upload_rejected)?);
            }
            "metadata" => {
                metadata = Some(field.text().await.map_err(ApiError::upload_rejected)?);
            }
            other => debug!("Ignoring multipart field '{}'", other),
        }
    }

    let (filename, bytes) = upload.ok_or_else(|| ApiError::unprocessable("Missing multipart field 'file'"))?;
    let file_type = file_type.ok_or_else(|| ApiError::unprocessable("Missing multipart field 'file_type'"))?;
    let metadata = parse_metadata(metadata.as_deref()).map_err(|e| ApiError::failed("Upload", e))?;

    let id = new_id();
    let path = state
        .blobs
        .save(&id, &filename, &bytes)
        .await
        .map_err(|e| ApiError::failed("Upload", e))?;

    let record = FileRecord {
        id,
        filename,
        file_type,
        file_path: path.to_string_lossy().into_owned(),
        uploaded_at: now(),
        metadata,
    };

    if let Err(e) = state.db.insert_file(&record) {
        if let Err(cleanup) = state.blobs.remove(&path).await {
            warn!("Could not remove orphaned blob {:?}: {}", path, cleanup);
        }
        return Err(ApiError::failed("Upload", e));
    }

    info!("Stored upload {} ({}, {} bytes)", record.id, record.file_type, bytes.len());
    Ok(Json(record))
}

/// Metadata arrives as a JSON string; blank means none
fn parse_metadata(raw: Option<&str>) -> Result<Option<Map<String, Value>>> {
    let Some(text) = raw.map(str::trim).filter(|t| !t.is_empty()) else {
        return Ok(None);
    };
    match serde_json::from_str::<Value>(text)? {
        Value::Object(map) => Ok(Some(map)),
        _ => Err(DeepTrackError::InvalidInput("metadata must be a JSON object".to_string())),
    }
}

async fn list_files(State(state): State<Arc<AppState>>) -> ApiResult<Vec<FileRecord>> {
    Ok(Json(state.db.list_files()?))
}

#[derive(Debug, Deserialize)]
struct AnalyzeRequest {
    file_ids: Vec<String>,
    #[serde(default)]
    analysis_type: Option<String>,
}

async fn analyze_files(
    State(state): State<Arc<AppState>>,
    request: Extracted<Json<AnalyzeRequest>, JsonRejection>,
) -> ApiResult<AnalysisJob> {
    let Json(request) = request?;
    let job = state
        .orchestrator
        .create_job(request.file_ids, request.analysis_type)
        .await
        .map_err(|e| ApiError::failed("Analysis", e))?;
    Ok(Json(job))
}

async fn list_jobs(State(state): State<Arc<AppState>>) -> ApiResult<Vec<AnalysisJob>> {
    Ok(Json(state.db.list_jobs()?))
}

async fn get_job(
    State(state): State<Arc<AppState>>,
    id: Extracted<Path<String>, PathRejection>,
) -> ApiResult<AnalysisJob> {
    let Path(id) = id?;
    state
        .db
        .get_job(&id)?
        .map(Json)
        .ok_or_else(|| ApiError::not_found("Job not found"))
}

#[derive(Debug, Deserialize)]
struct DetectionsQuery {
    file_id: Option<String>,
}

async fn list_detections(
    State(state): State<Arc<AppState>>,
    query: Extracted<Query<DetectionsQuery>, QueryRejection>,
) -> ApiResult<Vec<Detection>> {
    let Query(query) = query?;
    // `?file_id=` with no value means no filter
    let file_id = query.file_id.as_deref().filter(|id| !id.is_empty());
    Ok(Json(state.db.list_detections(file_id)?))
}

async fn delete_file(
    State(state): State<Arc<AppState>>,
    id: Extracted<Path<String>, PathRejection>,
) -> ApiResult<Value> {
    let Path(id) = id?;
    let record = state
        .db
        .get_file(&id)
        .map_err(|e| ApiError::failed("Delete", e))?
        .ok_or_else(|| ApiError::not_found("File not found"))?;

    state
        .blobs
        .remove(std::path::Path::new(&record.file_path))
        .await
        .map_err(|e| ApiError::failed("Delete", e))?;
    state.db.delete_file(&id).map_err(|e| ApiError::failed("Delete", e))?;

    info!("Deleted file {} and its detections", id);
    Ok(Json(json!({ "message": "File deleted successfully" })))
}

/// Serve the API until shutdown is signalled
pub async fn start_server(state: Arc<AppState>, shutdown: watch::Receiver<bool>) -> Result<()> {
    let addr = format!("{}:{}", state.config.web.host, state.config.web.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!("API available at http://{}/api/", addr);

    let router = create_router(state);
    let mut shutdown = shutdown;
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { wait_for_shutdown(&mut shutdown).await })
        .await
        .map_err(|e| DeepTrackError::Config(format!("Server error: {}", e)))?;

    Ok(())
}
