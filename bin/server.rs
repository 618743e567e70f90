// Fiscal-Year Archive - Audit API
// Read-only REST view over the reconciliation trail, partitions, snapshots and holds

use anyhow::{Context, Result};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use fy_archive::{report, ArchiveConfig, AuditQuery, LocalObjectStore, SqliteWarehouse};

/// Shared application state
#[derive(Clone)]
struct AppState {
    config: Arc<ArchiveConfig>,
    warehouse: Arc<SqliteWarehouse>,
    objects: Arc<LocalObjectStore>,
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

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Response {
        (
            StatusCode::OK,
            Json(Self {
                success: true,
                data: Some(data),
                error: None,
            }),
        )
            .into_response()
    }

    fn fail(status: StatusCode, message: String) -> Response {
        (
            status,
            Json(Self {
                success: false,
                data: None,
                error: Some(message),
            }),
        )
            .into_response()
    }
}

/// Query string of /api/reconciliations
#[derive(Debug, Deserialize)]
struct AuditParams {
    module: Option<String>,
    fiscal_year: Option<i32>,
    since: Option<DateTime<Utc>>,
    limit: Option<usize>,
}

#[derive(Serialize)]
struct HoldResponse {
    module: String,
    fiscal_year: i32,
    source: &'static str,
    reason: Option<String>,
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    ApiResponse::ok("OK")
}

/// GET /api/reconciliations - Audit trail, newest first
async fn get_reconciliations(
    State(state): State<AppState>,
    Query(params): Query<AuditParams>,
) -> Response {
    let query = AuditQuery {
        module: params.module,
        fiscal_year: params.fiscal_year,
        since: params.since,
        limit: Some(params.limit.unwrap_or(500)),
    };
    match state.warehouse.reconciliations(&query) {
        Ok(records) => ApiResponse::ok(records),
        Err(e) => {
            error!(error = %e, "Error reading reconciliation audit");
            ApiResponse::<()>::fail(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

/// GET /api/partitions/:module - Archive layout of one module
async fn get_partitions(State(state): State<AppState>, Path(module): Path<String>) -> Response {
    // Decode URL-encoded module name
    let module = urlencoding::decode(&module)
        .map(|m| m.into_owned())
        .unwrap_or(module);

    if state.config.module(&module).is_none() {
        return ApiResponse::<()>::fail(StatusCode::NOT_FOUND, format!("Unknown module: {}", module));
    }

    match report::layout(&state.config, state.objects.as_ref(), state.warehouse.as_ref()) {
        Ok(rows) => {
            let rows: Vec<_> = rows.into_iter().filter(|r| r.module == module).collect();
            ApiResponse::ok(rows)
        }
        Err(e) => {
            error!(module = %module, error = %e, "Error building layout");
            ApiResponse::<()>::fail(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

/// GET /api/manifest/:module - Last write of every (table, partition)
async fn get_manifest(State(state): State<AppState>, Path(module): Path<String>) -> Response {
    match state.warehouse.manifest(&module) {
        Ok(entries) => ApiResponse::ok(entries),
        Err(e) => {
            error!(module = %module, error = %e, "Error reading manifest");
            ApiResponse::<()>::fail(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

/// GET /api/snapshots - Pre-deletion snapshots still on record
async fn get_snapshots(State(state): State<AppState>) -> Response {
    match state.warehouse.snapshots() {
        Ok(snapshots) => ApiResponse::ok(snapshots),
        Err(e) => {
            error!(error = %e, "Error reading snapshots");
            ApiResponse::<()>::fail(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

/// GET /api/holds - Configured and registry legal holds
async fn get_holds(State(state): State<AppState>) -> Response {
    let mut holds: Vec<HoldResponse> = state
        .config
        .holds
        .iter()
        .map(|h| HoldResponse {
            module: h.module.clone(),
            fiscal_year: h.fiscal_year,
            source: "configuration",
            reason: None,
        })
        .collect();

    match state.warehouse.list_holds() {
        Ok(registry) => {
            holds.extend(registry.into_iter().map(|h| HoldResponse {
                module: h.module,
                fiscal_year: h.fiscal_year,
                source: "registry",
                reason: Some(h.reason),
            }));
            ApiResponse::ok(holds)
        }
        Err(e) => {
            error!(error = %e, "Error reading legal holds");
            ApiResponse::<()>::fail(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env("FY_ARCHIVE_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,tower_http=debug")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("FY_ARCHIVE_CONFIG").ok())
        .context("usage: fy-audit-server <config> (or set FY_ARCHIVE_CONFIG)")?;
    let config = ArchiveConfig::load(std::path::Path::new(&config_path))?;

    let warehouse_path = config
        .paths
        .warehouse_db
        .clone()
        .context("paths.warehouse_db is not configured")?;
    let object_dir = config
        .paths
        .object_dir
        .clone()
        .context("paths.object_dir is not configured")?;

    let warehouse = SqliteWarehouse::open(&warehouse_path)
        .with_context(|| format!("Failed to open warehouse {}", warehouse_path.display()))?;
    info!(path = %warehouse_path.display(), "Warehouse opened");

    // Create shared state
    let state = AppState {
        config: Arc::new(config),
        warehouse: Arc::new(warehouse),
        objects: Arc::new(LocalObjectStore::new(object_dir)?),
    };

    // Build API routes
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/reconciliations", get(get_reconciliations))
        .route("/partitions/:module", get(get_partitions))
        .route("/manifest/:module", get(get_manifest))
        .route("/snapshots", get(get_snapshots))
        .route("/holds", get(get_holds))
        .with_state(state);

    let app = Router::new().nest("/api", api_routes).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive()),
    );

    let addr = std::env::var("FY_ARCHIVE_BIND").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!(%addr, "Audit API listening");
    axum::serve(listener, app).await.context("Server stopped")?;
    Ok(())
}
