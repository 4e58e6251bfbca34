use crate::command_publisher::{CommandError, CommandPublisher};
use crate::config::ApiConfig;
use crate::content_records::{ContentRecords, RecordNotFound};
use crate::mqtt_connection::MqttError;
use crate::object_key::{
    article_cover_folder, ebook_folder, ebook_thumbnail_folder, harvest_proof_folder,
    user_profile_folder,
};
use crate::storage_gateway::{PresignedUrl, UploadError, UploadResult};
use crate::upload_coordinator::{CoordinatorError, IncomingFile, UploadCoordinator};
use crate::upload_validator::ValidationError;
use anyhow::{Context, Result};
use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument};

/// Longest TTL S3 accepts for a presigned URL
const MAX_PRESIGN_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Multipart framing on top of the largest accepted file
const MULTIPART_OVERHEAD_BYTES: usize = 1024 * 1024;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<UploadCoordinator>,
    pub records: Arc<dyn ContentRecords>,
    /// `None` when telemetry is disabled
    pub commands: Option<Arc<CommandPublisher>>,
    pub presigned_url_expiry: Duration,
    pub max_upload_bytes: u64,
}

/// Upload response
#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub url: String,
    pub key: String,
    pub size: u64,
    pub mime_type: String,
}

impl From<UploadResult> for UploadResponse {
    fn from(r: UploadResult) -> Self {
        Self {
            url: r.url,
            key: r.key,
            size: r.size,
            mime_type: r.mime_type,
        }
    }
}

/// Query parameters for presigning
#[derive(Debug, Deserialize)]
pub struct PresignQuery {
    pub key: String,
    /// Defaults to the configured expiry
    pub ttl_secs: Option<u64>,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Errors returned by the HTTP handlers
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Unavailable(String),

    #[error(transparent)]
    Upload(#[from] UploadError),

    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("{0:#}")]
    Internal(anyhow::Error),
}

impl ApiError {
    pub fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ApiError::Unavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "SERVICE_UNAVAILABLE"),
            ApiError::Upload(e) | ApiError::Coordinator(CoordinatorError::Upload(e)) => {
                upload_status(e)
            }
            ApiError::Coordinator(CoordinatorError::Record(e)) => {
                if e.downcast_ref::<RecordNotFound>().is_some() {
                    (StatusCode::NOT_FOUND, "NOT_FOUND")
                } else {
                    (StatusCode::INTERNAL_SERVER_ERROR, "RECORD_ERROR")
                }
            }
            ApiError::Command(CommandError::InvalidInstallCode(_))
            | ApiError::Command(CommandError::Serialization(_)) => {
                (StatusCode::BAD_REQUEST, "INVALID_COMMAND")
            }
            ApiError::Command(CommandError::Publish(MqttError::NotConnected)) => {
                (StatusCode::SERVICE_UNAVAILABLE, "BROKER_UNAVAILABLE")
            }
            ApiError::Command(CommandError::Publish(_)) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "PUBLISH_ERROR")
            }
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }
}

fn upload_status(error: &UploadError) -> (StatusCode, &'static str) {
    match error {
        UploadError::Validation(ValidationError::UnsupportedFileType { .. }) => {
            (StatusCode::BAD_REQUEST, "UNSUPPORTED_FILE_TYPE")
        }
        UploadError::Validation(ValidationError::FileTooLarge { .. }) => {
            (StatusCode::BAD_REQUEST, "FILE_TOO_LARGE")
        }
        UploadError::Transport(_) | UploadError::Delete { .. } => {
            (StatusCode::INTERNAL_SERVER_ERROR, "UPLOAD_ERROR")
        }
        UploadError::Presign(_) => (StatusCode::INTERNAL_SERVER_ERROR, "PRESIGN_ERROR"),
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();

        if status.is_server_error() {
            error!(error = %self, code, "Request failed");
        }

        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
                code: code.to_string(),
            }),
        )
            .into_response()
    }
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    let body_limit = usize::try_from(state.max_upload_bytes)
        .unwrap_or(usize::MAX)
        .saturating_add(MULTIPART_OVERHEAD_BYTES);

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/api/v1/users/:user_id/profile-image", post(upload_profile_image))
        .route("/api/v1/articles/:article_id/cover", post(upload_article_cover))
        .route("/api/v1/ebooks", post(upload_ebook))
        .route("/api/v1/ebooks/:ebook_id/thumbnail", post(upload_ebook_thumbnail))
        .route("/api/v1/harvests/:user_id/proof", post(upload_harvest_proof))
        .route("/api/v1/objects/presign", get(presign_object))
        .route("/api/v1/devices/:install_code/commands", post(send_command))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "swiflet-bridge"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let mqtt = match state.commands {
        None => "disabled",
        Some(ref commands) if commands.is_available() => "connected",
        Some(_) => "reconnecting",
    };

    match state.records.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "database": "connected",
                "mqtt": mqtt
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "database": "disconnected",
                "mqtt": mqtt,
                "error": format!("{e:#}")
            })),
        ),
    }
}

/// Read the file carried in form field `field_name`
async fn read_file(mut multipart: Multipart, field_name: &str) -> Result<IncomingFile, ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("invalid multipart body: {e}")))?
    {
        if field.name() != Some(field_name) {
            continue;
        }

        let filename = field
            .file_name()
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .ok_or_else(|| ApiError::BadRequest(format!("field {field_name:?} has no filename")))?;

        let body = field
            .bytes()
            .await
            .map_err(|e| ApiError::BadRequest(format!("failed to read {field_name:?}: {e}")))?;

        return Ok(IncomingFile::new(filename, body));
    }

    Err(ApiError::BadRequest(format!(
        "missing form field {field_name:?}"
    )))
}

/// Upload through the coordinator and record the URL with `record`
async fn upload_and_record<F, Fut>(
    state: &AppState,
    file: IncomingFile,
    folder: &str,
    record: F,
) -> Result<Json<UploadResponse>, ApiError>
where
    F: FnOnce(UploadResult) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let (uploaded, ()) = state
        .coordinator
        .upload_then_record(file, folder, record)
        .await?;

    Ok(Json(uploaded.into()))
}

/// Upload without a backing record
async fn upload_only(
    state: &AppState,
    file: IncomingFile,
    folder: &str,
) -> Result<Json<UploadResponse>, ApiError> {
    let size = file.size();
    let uploaded = state
        .coordinator
        .gateway()
        .upload(file.body, &file.filename, size, folder)
        .await?;

    Ok(Json(uploaded.into()))
}

#[instrument(skip(state, multipart))]
async fn upload_profile_image(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
    multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    let file = read_file(multipart, "image").await?;
    let records = state.records.clone();

    upload_and_record(&state, file, &user_profile_folder(user_id), |uploaded| async move {
        records.set_user_profile_image(user_id, &uploaded.url).await
    })
    .await
}

#[instrument(skip(state, multipart))]
async fn upload_article_cover(
    State(state): State<AppState>,
    Path(article_id): Path<i64>,
    multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    let exists = state
        .records
        .article_exists(article_id)
        .await
        .map_err(ApiError::Internal)?;
    if !exists {
        return Err(ApiError::NotFound(format!("article {article_id} not found")));
    }

    let file = read_file(multipart, "cover").await?;
    let records = state.records.clone();

    upload_and_record(&state, file, &article_cover_folder(article_id), |uploaded| async move {
        records.set_article_cover(article_id, &uploaded.url).await
    })
    .await
}

#[instrument(skip(state, multipart))]
async fn upload_ebook(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    let file = read_file(multipart, "ebook").await?;
    upload_only(&state, file, &ebook_folder()).await
}

#[instrument(skip(state, multipart))]
async fn upload_ebook_thumbnail(
    State(state): State<AppState>,
    Path(ebook_id): Path<i64>,
    multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    let file = read_file(multipart, "thumbnail").await?;
    upload_only(&state, file, &ebook_thumbnail_folder(ebook_id)).await
}

#[instrument(skip(state, multipart))]
async fn upload_harvest_proof(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
    multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    let file = read_file(multipart, "proof").await?;
    upload_only(&state, file, &harvest_proof_folder(user_id)).await
}

/// Presigned GET URL for an object key
#[instrument(skip(state))]
async fn presign_object(
    State(state): State<AppState>,
    Query(params): Query<PresignQuery>,
) -> Result<Json<PresignedUrl>, ApiError> {
    if params.key.trim().is_empty() {
        return Err(ApiError::BadRequest("key must not be empty".to_string()));
    }

    let ttl = params
        .ttl_secs
        .map(Duration::from_secs)
        .unwrap_or(state.presigned_url_expiry);
    if ttl.is_zero() || ttl > MAX_PRESIGN_TTL {
        return Err(ApiError::BadRequest(format!(
            "ttl_secs must be between 1 and {}",
            MAX_PRESIGN_TTL.as_secs()
        )));
    }

    let presigned = state.coordinator.gateway().presign(&params.key, ttl).await?;
    Ok(Json(presigned))
}

/// Publish a JSON command to one device
#[instrument(skip(state, command))]
async fn send_command(
    State(state): State<AppState>,
    Path(install_code): Path<String>,
    Json(command): Json<serde_json::Value>,
) -> Result<impl IntoResponse, ApiError> {
    let commands = state
        .commands
        .as_ref()
        .ok_or_else(|| ApiError::Unavailable("telemetry is disabled".to_string()))?;

    commands.publish(&install_code, &command).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "status": "published",
            "topic": commands.command_topic(&install_code)?
        })),
    ))
}

/// Start the HTTP server; returns once `shutdown` resolves and in-flight requests finish
pub async fn start_api_server<S>(state: AppState, config: &ApiConfig, shutdown: S) -> Result<()>
where
    S: Future<Output = ()> + Send + 'static,
{
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting upload API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("API server error")?;

    Ok(())
}
