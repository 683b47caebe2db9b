// Catalog Resolution Engine - Web Server
// JSON API over the scan and merge calls

use anyhow::Context;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use catalog_resolution::{
    find_group, scan, CatalogRecord, CatalogStore, DuplicateGroup, EngineConfig, EngineError,
    ErrorKind, MergeExecutor, MergePreview, MergeRequest, MergeResult, ScanParams, SqliteStore,
    VERSION,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

/// Shared application state
#[derive(Clone)]
struct AppState {
    executor: MergeExecutor<SqliteStore>,
    config: Arc<EngineConfig>,
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

/// Engine error rendered as a JSON body with a matching status code
struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.kind() {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::Arithmetic => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::Storage => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            log::error!("request failed: {}", self.0);
        }

        let body = ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(self.0.to_string()),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

/// Run store and scan work off the async runtime
async fn blocking<T, F>(work: F) -> Result<T, ApiError>
where
    F: FnOnce() -> catalog_resolution::Result<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(work).await {
        Ok(result) => result.map_err(ApiError),
        Err(join_err) => Err(ApiError(EngineError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            join_err.to_string(),
        )))),
    }
}

/// Merge or preview body: the request plus the parameters of the scan
/// that showed the group
#[derive(Debug, Deserialize)]
struct MergeBody {
    #[serde(flatten)]
    request: MergeRequest,
    #[serde(default)]
    scan: ScanParams,
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    Json(ApiResponse::ok(format!("OK {VERSION}")))
}

/// GET /api/records - All catalog records
async fn get_records(State(state): State<AppState>) -> ApiResult<Vec<CatalogRecord>> {
    let store = Arc::clone(state.executor.store());
    let records = blocking(move || store.snapshot()).await?;
    Ok(Json(ApiResponse::ok(records)))
}

/// POST /api/scan - Duplicate groups for the current catalog
async fn post_scan(
    State(state): State<AppState>,
    Json(params): Json<ScanParams>,
) -> ApiResult<Vec<DuplicateGroup>> {
    let options = state.config.scan_options_with(&params)?;
    let store = Arc::clone(state.executor.store());
    let groups = blocking(move || scan(&store.snapshot()?, &options)).await?;
    Ok(Json(ApiResponse::ok(groups)))
}

/// Rebuild the group a request refers to from a fresh snapshot
fn current_group(state: &AppState, body: &MergeBody) -> catalog_resolution::Result<DuplicateGroup> {
    let options = state.config.scan_options_with(&body.scan)?;
    let records = state.executor.store().snapshot()?;
    find_group(
        &records,
        &options,
        &body.request.representative_id,
        &body.request.selected_ids,
    )
}

/// POST /api/merge/preview - Totals and field conflicts, nothing written
async fn post_preview(
    State(state): State<AppState>,
    Json(body): Json<MergeBody>,
) -> ApiResult<MergePreview> {
    let preview = blocking(move || {
        let group = current_group(&state, &body)?;
        state.executor.preview(&body.request, &group)
    })
    .await?;
    Ok(Json(ApiResponse::ok(preview)))
}

/// POST /api/merge - Apply a confirmed merge
async fn post_merge(
    State(state): State<AppState>,
    Json(body): Json<MergeBody>,
) -> ApiResult<MergeResult> {
    let result = blocking(move || {
        let group = current_group(&state, &body)?;
        state.executor.merge(&body.request, &group)
    })
    .await?;
    Ok(Json(ApiResponse::ok(result)))
}

fn router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/records", get(get_records))
        .route("/scan", post(post_scan))
        .route("/merge/preview", post(post_preview))
        .route("/merge", post(post_merge))
        .with_state(state);

    Router::new()
        .nest("/api", api_routes)
        .layer(CorsLayer::permissive())
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = EngineConfig::load().context("Failed to load config")?;
    let store = SqliteStore::open(&config.store.database_path).with_context(|| {
        format!("Failed to open database {}", config.store.database_path.display())
    })?;
    log::info!(
        "catalog database {} ({} records)",
        config.store.database_path.display(),
        store.count()?
    );

    let addr = config.server_addr();
    let state = AppState {
        executor: MergeExecutor::new(Arc::new(store)),
        config: Arc::new(config),
    };

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;

    log::info!("server running on http://{addr}/api");
    axum::serve(listener, router(state))
        .await
        .context("Server error")?;

    Ok(())
}
