use std::{env, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use utoipa::{IntoParams, OpenApi, ToSchema};
use uuid::Uuid;

use stash_core::{FileError, FileService, FileUpload, RegistryError, StorageService};
use stash_db::{Database, FileRecord, StorageRecord};
use stash_store::{ConnectorFactory, ParamsCipher, StoreError};

/// Hard cap on a single multipart request body.
const MAX_UPLOAD_BYTES: usize = 256 * 1024 * 1024;

pub async fn run() -> Result<()> {
    let config = AppConfig::from_env()?;

    let db = Database::connect(&config.db_url)
        .await
        .context("failed to open database")?;

    let cipher = Arc::new(ParamsCipher::from_secret(&config.params_secret));
    let state = Arc::new(AppState {
        registry: StorageService::new(db.clone(), Arc::clone(&cipher)),
        factory: ConnectorFactory::new(db.clone(), cipher, config.backend_timeout),
        db,
    });

    let app = build_router(state).layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listen socket")?;

    info!(addr = %config.listen_addr, "stash-daemon listening");
    axum::serve(listener, app)
        .await
        .context("HTTP server exited")?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/docs.json", get(openapi))
        .route("/storage", post(add_storage).get(list_storages))
        .route(
            "/storage/:storage_id/files",
            post(upload_files).delete(delete_files),
        )
        .route("/storage/:storage_id/files/:file_id", get(get_file_info))
        .route(
            "/storage/:storage_id/files/:file_id/download",
            get(download_file),
        )
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(state)
}

struct AppState {
    db: Database,
    registry: StorageService,
    factory: ConnectorFactory,
}

#[derive(Debug, Clone)]
struct AppConfig {
    listen_addr: SocketAddr,
    db_url: String,
    params_secret: String,
    backend_timeout: Duration,
}

impl AppConfig {
    fn from_env() -> Result<Self> {
        let listen_addr = env::var("STASH_API_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:8080".to_string())
            .parse()
            .context("invalid STASH_API_ADDR")?;

        let db_url = env::var("STASH_DB_DSN")
            .or_else(|_| env::var("DATABASE_URL"))
            .context("STASH_DB_DSN or DATABASE_URL must be configured")?;

        let params_secret = env::var("STASH_PARAMS_SECRET")
            .context("STASH_PARAMS_SECRET must be configured to seal connection parameters")?;

        let backend_timeout = env::var("STASH_BACKEND_TIMEOUT_SECS")
            .ok()
            .and_then(|value| value.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(30));

        Ok(Self {
            listen_addr,
            db_url,
            params_secret,
            backend_timeout,
        })
    }
}

#[utoipa::path(
    get,
    path = "/healthz",
    responses((status = 200, description = "Service is healthy"))
)]
async fn healthz() -> StatusCode {
    StatusCode::OK
}

#[utoipa::path(
    get,
    path = "/metrics",
    responses((status = 200, description = "Prometheus metrics", content_type = "text/plain"))
)]
async fn metrics() -> impl IntoResponse {
    (StatusCode::OK, "# metrics placeholder\nstash_daemon_up 1\n")
}

async fn openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(docs::ApiDoc::openapi())
}

#[utoipa::path(
    post,
    path = "/storage",
    request_body = AddStorageBody,
    responses(
        (status = 201, description = "Storage registered", body = StorageCreatedResponse),
        (status = 400, description = "Invalid connection parameters", body = [ErrorBody]),
        (status = 404, description = "Unsupported storage kind", body = [ErrorBody])
    )
)]
async fn add_storage(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<AddStorageBody>,
) -> Result<(StatusCode, Json<StorageCreatedResponse>), ApiError> {
    let record = state
        .registry
        .add_storage(&payload.kind, payload.params)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(StorageCreatedResponse { id: record.id }),
    ))
}

#[utoipa::path(
    get,
    path = "/storage",
    params(StorageListQuery),
    responses((status = 200, description = "Registered storages", body = [StorageResponse]))
)]
async fn list_storages(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StorageListQuery>,
) -> Result<Json<Vec<StorageResponse>>, ApiError> {
    let records = state.registry.list(query.active).await?;
    Ok(Json(records.into_iter().map(StorageResponse::from).collect()))
}

#[utoipa::path(
    post,
    path = "/storage/{storage_id}/files",
    params(("storage_id" = Uuid, Path, description = "Storage registration identifier")),
    request_body(content = String, content_type = "multipart/form-data", description = "One part per file"),
    responses(
        (status = 201, description = "Files uploaded", body = [FileResponse]),
        (status = 400, description = "Malformed upload", body = [ErrorBody]),
        (status = 404, description = "Unknown storage", body = [ErrorBody])
    )
)]
async fn upload_files(
    State(state): State<Arc<AppState>>,
    Path(storage_id): Path<Uuid>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<Vec<FileResponse>>), ApiError> {
    let backend = state.factory.resolve(storage_id).await?;

    // Multipart fields arrive sequentially, so each body is buffered before
    // the bounded-concurrency fan-out takes over.
    let mut uploads = Vec::new();
    while let Some(field) = multipart.next_field().await.map_err(|err| {
        ApiError::bad_request(format!("malformed multipart payload: {err}"))
    })? {
        let Some(name) = field.file_name().map(str::to_owned) else {
            continue;
        };
        let content_type = field.content_type().map(str::to_owned);
        let body = field.bytes().await.map_err(|err| {
            ApiError::bad_request(format!("failed to read multipart field: {err}"))
        })?;
        uploads.push(FileUpload::from_bytes(name, content_type, body));
    }

    let service = FileService::new(state.db.clone(), backend);
    let records = service.upload_many(storage_id, uploads).await?;
    Ok((
        StatusCode::CREATED,
        Json(records.into_iter().map(FileResponse::from).collect()),
    ))
}

#[utoipa::path(
    get,
    path = "/storage/{storage_id}/files/{file_id}",
    params(
        ("storage_id" = Uuid, Path, description = "Storage registration identifier"),
        ("file_id" = Uuid, Path, description = "File identifier")
    ),
    responses(
        (status = 200, description = "File metadata", body = FileResponse),
        (status = 404, description = "Unknown storage or file", body = [ErrorBody])
    )
)]
async fn get_file_info(
    State(state): State<Arc<AppState>>,
    Path((storage_id, file_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<FileResponse>, ApiError> {
    let backend = state.factory.resolve(storage_id).await?;
    let service = FileService::new(state.db.clone(), backend);
    let record = service.get(file_id).await?;
    Ok(Json(FileResponse::from(record)))
}

#[utoipa::path(
    get,
    path = "/storage/{storage_id}/files/{file_id}/download",
    params(
        ("storage_id" = Uuid, Path, description = "Storage registration identifier"),
        ("file_id" = Uuid, Path, description = "File identifier")
    ),
    responses(
        (status = 200, description = "File bytes", content_type = "application/octet-stream"),
        (status = 404, description = "Unknown storage or file", body = [ErrorBody])
    )
)]
async fn download_file(
    State(state): State<Arc<AppState>>,
    Path((storage_id, file_id)): Path<(Uuid, Uuid)>,
) -> Result<Response, ApiError> {
    let backend = state.factory.resolve(storage_id).await?;
    let service = FileService::new(state.db.clone(), backend);
    let (record, chunks) = service.read_stream(file_id).await?;

    let mut builder = Response::builder().status(StatusCode::OK);
    if let Some(content_type) = record.content_type.as_deref() {
        builder = builder.header(header::CONTENT_TYPE, content_type);
    }
    builder
        .body(Body::from_stream(chunks))
        .map_err(ApiError::internal)
}

#[utoipa::path(
    delete,
    path = "/storage/{storage_id}/files",
    params(
        ("storage_id" = Uuid, Path, description = "Storage registration identifier"),
        DeleteFilesQuery
    ),
    responses(
        (status = 204, description = "Files deleted; unknown ids are ignored"),
        (status = 400, description = "Malformed file id list", body = [ErrorBody]),
        (status = 404, description = "Unknown storage", body = [ErrorBody])
    )
)]
async fn delete_files(
    State(state): State<Arc<AppState>>,
    Path(storage_id): Path<Uuid>,
    Query(query): Query<DeleteFilesQuery>,
) -> Result<StatusCode, ApiError> {
    let file_ids = parse_file_ids(&query.file_ids)?;
    if file_ids.is_empty() {
        return Err(ApiError::bad_request("fileIds query parameter is required"));
    }

    let backend = state.factory.resolve(storage_id).await?;
    let service = FileService::new(state.db.clone(), backend);
    service.delete_many(&file_ids).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn parse_file_ids(raw: &str) -> Result<Vec<Uuid>, ApiError> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            Uuid::parse_str(part)
                .map_err(|_| ApiError::bad_request(format!("'{part}' is not a valid file id")))
        })
        .collect()
}

#[derive(Debug, Deserialize, ToSchema)]
struct AddStorageBody {
    #[serde(rename = "type")]
    kind: String,
    params: serde_json::Value,
}

#[derive(Debug, Serialize, ToSchema)]
struct StorageCreatedResponse {
    id: Uuid,
}

#[derive(Debug, Deserialize, IntoParams)]
struct StorageListQuery {
    active: Option<bool>,
}

#[derive(Debug, Deserialize, IntoParams)]
struct DeleteFilesQuery {
    /// Comma-separated list of file identifiers.
    #[serde(rename = "fileIds", default)]
    file_ids: String,
}

/// Registration summary. The sealed parameter blob is deliberately absent.
#[derive(Debug, Serialize, ToSchema)]
struct StorageResponse {
    id: Uuid,
    kind: String,
    is_active: bool,
    created_at: String,
    updated_at: String,
}

impl From<StorageRecord> for StorageResponse {
    fn from(record: StorageRecord) -> Self {
        Self {
            id: record.id,
            kind: record.kind.as_str().to_string(),
            is_active: record.is_active,
            created_at: record.created_at.to_rfc3339(),
            updated_at: record.updated_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
struct FileResponse {
    id: Uuid,
    name: String,
    size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    content_type: Option<String>,
    storage_id: Uuid,
    created_at: String,
    updated_at: String,
}

impl From<FileRecord> for FileResponse {
    fn from(record: FileRecord) -> Self {
        Self {
            id: record.id,
            name: record.name,
            size: record.size,
            content_type: record.content_type,
            storage_id: record.storage_id,
            created_at: record.created_at.to_rfc3339(),
            updated_at: record.updated_at.to_rfc3339(),
        }
    }
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    fn internal<E: std::fmt::Display>(err: E) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::UnsupportedKind(_) => ApiError::not_found(err.to_string()),
            RegistryError::InvalidParams(_) => ApiError::bad_request(err.to_string()),
            RegistryError::Cipher(_) | RegistryError::Metadata(_) => ApiError::internal(err),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::UnknownStorage(_) | StoreError::ObjectMissing(_) => {
                ApiError::not_found(err.to_string())
            }
            StoreError::Decrypt(_)
            | StoreError::InvalidParams(_)
            | StoreError::Timeout(_)
            | StoreError::Backend(_)
            | StoreError::Metadata(_) => ApiError::internal(err),
        }
    }
}

impl From<FileError> for ApiError {
    fn from(err: FileError) -> Self {
        match err {
            FileError::InvalidUpload => ApiError::bad_request(err.to_string()),
            FileError::NotFound(_) => ApiError::not_found(err.to_string()),
            FileError::ReadFailed(_, StoreError::ObjectMissing(_)) => {
                ApiError::not_found(err.to_string())
            }
            FileError::UploadFailed { .. }
            | FileError::BatchUploadFailed { .. }
            | FileError::DeleteFailed { .. }
            | FileError::ReadFailed(..)
            | FileError::Metadata(_) => ApiError::internal(err),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        error!(status = %self.status, message = %self.message, "api error");
        let body = Json(vec![ErrorBody {
            message: self.message,
        }]);
        (self.status, body).into_response()
    }
}

#[derive(Debug, Serialize, ToSchema)]
struct ErrorBody {
    message: String,
}

pub mod docs {
    use super::*;

    #[derive(OpenApi)]
    #[openapi(
        info(title = "Stash API", version = "0.1.0"),
        paths(
            healthz,
            metrics,
            add_storage,
            list_storages,
            upload_files,
            get_file_info,
            download_file,
            delete_files
        ),
        components(schemas(
            AddStorageBody,
            StorageCreatedResponse,
            StorageResponse,
            FileResponse,
            ErrorBody
        ))
    )]
    pub struct ApiDoc;
}
