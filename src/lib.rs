pub mod api;
pub mod config;
pub mod entities;
pub mod infrastructure;
pub mod models;
pub mod services;
pub mod utils;

use crate::config::IngestConfig;
use crate::services::access::AccessControl;
use crate::services::audit::AuditService;
use crate::services::chunk_assembly::{ChunkAssemblyManager, ChunkLimits};
use crate::services::file_manager::FileManager;
use crate::services::ingest::IngestService;
use crate::services::job_queue::{JobQueue, JobQueueConfig};
use crate::services::key_management::KeyProvider;
use crate::services::kv_store::{KeyValueStore, MemoryKvStore};
use crate::services::metadata_store::{MetadataStore, SeaOrmMetadataStore};
use crate::services::parse_job::ParseJobHandler;
use crate::services::retrieval::DataService;
use crate::services::scanner::VirusScanner;
use crate::services::storage::StorageService;
use crate::services::validation::{ValidationPipeline, ValidationSettings};
use crate::services::workbook_cache::WorkbookCache;
use crate::services::workbook_parser::{ParseOptions, WorkbookParser};
use crate::services::worker::BackgroundWorker;
use axum::{
    Router,
    middleware::{from_fn, from_fn_with_state},
    routing::{delete, get, post},
};
use sea_orm::DatabaseConnection;
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(
        api::handlers::upload::upload_handler,
        api::handlers::upload::upload_chunk_handler,
        api::handlers::jobs::get_job,
        api::handlers::jobs::cancel_job,
        api::handlers::data::get_file_data,
        api::handlers::files::delete_file,
        api::handlers::files::grant_permission,
        api::handlers::health::health_check,
    ),
    components(
        schemas(
            api::handlers::upload::UploadResponse,
            api::handlers::upload::ChunkProgressResponse,
            api::handlers::upload::QuarantineResponse,
            api::handlers::files::GrantPermissionRequest,
            api::handlers::health::HealthResponse,
            models::ProcessingJob,
            models::JobState,
            models::JobSummary,
            models::FilePermission,
            models::ValidationIssue,
            models::CheckName,
            models::Severity,
        )
    ),
    tags(
        (name = "upload", description = "Spreadsheet upload endpoints"),
        (name = "jobs", description = "Parse job status and cancellation"),
        (name = "data", description = "Parsed workbook retrieval and export"),
        (name = "files", description = "File management endpoints"),
        (name = "system", description = "Service health")
    )
)]
pub struct ApiDoc;

#[derive(Clone)]
pub struct AppState {
    pub db: DatabaseConnection,
    pub scanner: Arc<dyn VirusScanner>,
    pub ingest: Arc<IngestService>,
    pub queue: JobQueue,
    pub data: Arc<DataService>,
    pub files: Arc<FileManager>,
    pub config: IngestConfig,
    pub jwt_secret: Arc<str>,
}

/// Everything `main` needs after wiring: the HTTP state and the maintenance
/// worker, which the caller decides whether to spawn.
pub struct Components {
    pub state: AppState,
    pub worker: BackgroundWorker,
}

/// Wires the services on top of the given infrastructure and starts the job
/// queue. Must run inside a tokio runtime.
pub fn assemble(
    db: DatabaseConnection,
    storage: Arc<dyn StorageService>,
    scanner: Arc<dyn VirusScanner>,
    keys: Arc<dyn KeyProvider>,
    config: IngestConfig,
    jwt_secret: &str,
    shutdown: watch::Receiver<bool>,
) -> Components {
    let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryKvStore::new());
    let metadata: Arc<dyn MetadataStore> = Arc::new(SeaOrmMetadataStore::new(db.clone()));
    let audit = AuditService::new();

    let chunks = Arc::new(ChunkAssemblyManager::new(
        kv.clone(),
        ChunkLimits {
            max_file_size: config.max_file_size as u64,
            max_chunk_size: config.max_chunk_size as u64,
            session_ttl: config.chunk_session_ttl(),
        },
    ));
    let cache = Arc::new(WorkbookCache::from_config(kv.clone(), &config));
    let parser = Arc::new(WorkbookParser::new(ParseOptions::from(&config)));

    let handler = Arc::new(ParseJobHandler::new(
        metadata.clone(),
        storage.clone(),
        keys.clone(),
        parser,
        cache.clone(),
        config.encryption_timeout(),
    ));
    let queue = JobQueue::start(
        metadata.clone(),
        handler,
        JobQueueConfig::from(&config),
        shutdown.clone(),
    );

    let pipeline = Arc::new(ValidationPipeline::new(
        ValidationSettings::from(&config),
        scanner.clone(),
    ));
    let ingest = Arc::new(IngestService::new(
        pipeline,
        chunks.clone(),
        keys,
        storage.clone(),
        metadata.clone(),
        queue.clone(),
        config.max_file_size as u64,
        config.encryption_timeout(),
    ));

    let access = Arc::new(AccessControl::new(metadata.clone(), audit));
    let data = Arc::new(DataService::new(access.clone(), metadata.clone(), cache.clone()));
    let files = Arc::new(FileManager::new(metadata.clone(), access, cache));

    let worker = BackgroundWorker::new(
        kv,
        chunks,
        queue.clone(),
        metadata,
        storage,
        config.maintenance_interval(),
        config.deleted_file_retention(),
        shutdown,
    );

    Components {
        state: AppState {
            db,
            scanner,
            ingest,
            queue,
            data,
            files,
            config,
            jwt_secret: Arc::from(jwt_secret),
        },
        worker,
    }
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .route("/health", get(api::handlers::health::health_check))
        .route(
            "/upload",
            post(api::handlers::upload::upload_handler).layer(from_fn_with_state(
                state.clone(),
                api::middleware::auth::auth_middleware,
            )),
        )
        .route(
            "/upload/chunk",
            post(api::handlers::upload::upload_chunk_handler).layer(from_fn_with_state(
                state.clone(),
                api::middleware::auth::auth_middleware,
            )),
        )
        .route(
            "/jobs/:id",
            get(api::handlers::jobs::get_job)
                .delete(api::handlers::jobs::cancel_job)
                .layer(from_fn_with_state(
                    state.clone(),
                    api::middleware::auth::auth_middleware,
                )),
        )
        .route(
            "/files/:id",
            delete(api::handlers::files::delete_file).layer(from_fn_with_state(
                state.clone(),
                api::middleware::auth::auth_middleware,
            )),
        )
        .route(
            "/files/:id/data",
            get(api::handlers::data::get_file_data).layer(from_fn_with_state(
                state.clone(),
                api::middleware::auth::auth_middleware,
            )),
        )
        .route(
            "/files/:id/permissions",
            post(api::handlers::files::grant_permission).layer(from_fn_with_state(
                state.clone(),
                api::middleware::auth::auth_middleware,
            )),
        )
        .layer(from_fn(api::middleware::metrics::metrics_middleware))
        .layer(from_fn(api::middleware::request_id::request_id_middleware))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
                .expose_headers(Any),
        )
        .layer(axum::extract::DefaultBodyLimit::max(
            state.config.max_file_size + 10 * 1024 * 1024,
        ))
        .with_state(state)
}
