// SCD Dimension - Read-only API server
// Serves the historized table and the current gate verdict over HTTP.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use scd_dimension::{db, EntityId, GateReport, PipelineConfig, QualityGate, VersionRecord};

/// Shared application state
#[derive(Clone)]
struct AppState {
    db: Arc<Mutex<Connection>>,
    gate: Arc<QualityGate>,
}

impl AppState {
    fn conn(&self) -> Result<MutexGuard<'_, Connection>, Response> {
        self.db
            .lock()
            .map_err(|_| failure(StatusCode::INTERNAL_SERVER_ERROR, "database lock poisoned"))
    }
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
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
}

fn failure(status: StatusCode, message: impl Into<String>) -> Response {
    let body = ApiResponse::<()> {
        success: false,
        data: None,
        error: Some(message.into()),
    };
    (status, Json(body)).into_response()
}

fn internal(context: &str, err: anyhow::Error) -> Response {
    error!("{}: {:#}", context, err);
    failure(StatusCode::INTERNAL_SERVER_ERROR, format!("{}: {}", context, err))
}

#[derive(Deserialize)]
struct AsOfQuery {
    at: String,
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    ApiResponse::ok("OK")
}

/// GET /api/dimension/current - Current version of every entity
async fn get_current(State(state): State<AppState>) -> Response {
    let conn = match state.conn() {
        Ok(conn) => conn,
        Err(resp) => return resp,
    };

    match db::load_current_versions(&conn) {
        Ok(versions) => ApiResponse::ok(versions),
        Err(e) => internal("load current versions", e),
    }
}

/// GET /api/dimension/:entity_id/history - Every version of one entity
async fn get_history(State(state): State<AppState>, Path(entity_id): Path<String>) -> Response {
    let conn = match state.conn() {
        Ok(conn) => conn,
        Err(resp) => return resp,
    };

    match db::load_entity_history(&conn, &EntityId::new(entity_id.clone())) {
        Ok(versions) if versions.is_empty() => failure(
            StatusCode::NOT_FOUND,
            format!("no versions for entity {}", entity_id),
        ),
        Ok(versions) => ApiResponse::ok(versions),
        Err(e) => internal("load entity history", e),
    }
}

/// GET /api/dimension/as-of?at=<rfc3339> - Point-in-time view
async fn get_as_of(State(state): State<AppState>, Query(query): Query<AsOfQuery>) -> Response {
    let at = match DateTime::parse_from_rfc3339(&query.at) {
        Ok(at) => at.with_timezone(&Utc),
        Err(e) => {
            return failure(
                StatusCode::BAD_REQUEST,
                format!("invalid 'at' timestamp '{}': {}", query.at, e),
            )
        }
    };

    let conn = match state.conn() {
        Ok(conn) => conn,
        Err(resp) => return resp,
    };

    match db::load_versions_as_of(&conn, at) {
        Ok(versions) => ApiResponse::<Vec<VersionRecord>>::ok(versions),
        Err(e) => internal("load versions as of", e),
    }
}

/// GET /api/quality - Gate verdict for the stored table, evaluated now
async fn get_quality(State(state): State<AppState>) -> Response {
    let conn = match state.conn() {
        Ok(conn) => conn,
        Err(resp) => return resp,
    };

    match db::load_all_versions(&conn) {
        Ok(records) => {
            let report: GateReport = state.gate.evaluate(&records, Utc::now());
            ApiResponse::ok(report)
        }
        Err(e) => internal("load dimension", e),
    }
}

fn router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/dimension/current", get(get_current))
        .route("/dimension/as-of", get(get_as_of))
        .route("/dimension/:entity_id/history", get(get_history))
        .route("/quality", get(get_quality))
        .with_state(state);

    Router::new()
        .nest("/api", api_routes)
        .layer(CorsLayer::permissive())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

fn bind_addr_from_env() -> Option<SocketAddr> {
    std::env::var("SCD_SERVER_ADDR").ok()?.parse().ok()
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = match std::env::var("SCD_CONFIG") {
        Ok(path) => PipelineConfig::load(&PathBuf::from(path))?,
        Err(_) => PipelineConfig::default(),
    };
    let db_path = std::env::var("SCD_DB_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| config.storage.db_path.clone());
    if !db_path.exists() {
        anyhow::bail!(
            "dimension store not found at {} (run `scd-dimension run --snapshot <csv>` first)",
            db_path.display()
        );
    }

    let conn = db::open_database(&db_path)?;
    info!(path = %db_path.display(), "dimension store opened");

    let state = AppState {
        db: Arc::new(Mutex::new(conn)),
        gate: Arc::new(QualityGate::new(config.attributes, config.gate)),
    };

    let addr = bind_addr_from_env().unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 3000)));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "server listening");

    axum::serve(listener, router(state)).await?;
    Ok(())
}
