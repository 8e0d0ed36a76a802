// Stock Sentinel - Web Server
// Read-only REST API over the security master, ledger and series store

use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use chrono::{NaiveDate, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use stock_sentinel::{
    open_database, AuditFinding, LedgerEntry, Ledger, Security, SecurityCode, SecurityRegistry, SentinelConfig,
    SentinelError, SeriesKind, SeriesRow, SeriesStore,
};
use tower_http::cors::CorsLayer;
use tracing::{error, info};

/// Shared application state
#[derive(Clone)]
struct AppState {
    db: Arc<Mutex<Connection>>,
    store: Arc<SeriesStore>,
    stale_after: chrono::Duration,
}

impl AppState {
    fn conn(&self) -> Result<MutexGuard<'_, Connection>, ApiError> {
        self.db
            .lock()
            .map_err(|_| ApiError::internal("database lock poisoned"))
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
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn internal(message: &str) -> Self {
        ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.to_string(),
        }
    }

    fn not_found(message: String) -> Self {
        ApiError {
            status: StatusCode::NOT_FOUND,
            message,
        }
    }
}

impl From<SentinelError> for ApiError {
    fn from(err: SentinelError) -> Self {
        if err.is_malformed() {
            return ApiError {
                status: StatusCode::BAD_REQUEST,
                message: err.to_string(),
            };
        }
        error!(error = %err, "request failed");
        ApiError::internal(&err.to_string())
    }
}

impl From<stock_sentinel::MalformedInput> for ApiError {
    fn from(err: stock_sentinel::MalformedInput) -> Self {
        SentinelError::from(err).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(self.message),
        };
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

#[derive(Deserialize)]
struct SecuritiesQuery {
    #[serde(default)]
    active: bool,
}

#[derive(Deserialize)]
struct AsOfQuery {
    as_of: Option<NaiveDate>,
}

#[derive(Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

#[derive(Serialize)]
struct MembersResponse {
    index: String,
    as_of: NaiveDate,
    members: Vec<SecurityCode>,
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    ApiResponse::ok("OK")
}

/// GET /api/securities?active=true
async fn list_securities(State(state): State<AppState>, Query(q): Query<SecuritiesQuery>) -> ApiResult<Vec<Security>> {
    let conn = state.conn()?;
    Ok(ApiResponse::ok(SecurityRegistry::new(&conn).all(q.active)?))
}

/// GET /api/securities/:code
async fn get_security(State(state): State<AppState>, Path(code): Path<String>) -> ApiResult<Security> {
    let code = SecurityCode::parse(&code)?;
    let conn = state.conn()?;
    SecurityRegistry::new(&conn)
        .get(&code)?
        .map(ApiResponse::ok)
        .ok_or_else(|| ApiError::not_found(format!("unknown security {code}")))
}

/// GET /api/securities/:code/prices
async fn get_prices(State(state): State<AppState>, Path(code): Path<String>) -> ApiResult<Vec<SeriesRow>> {
    let code = SecurityCode::parse(&code)?;
    Ok(ApiResponse::ok(state.store.load(&code, SeriesKind::Prices)?))
}

/// GET /api/indexes/:index/members?as_of=YYYY-MM-DD
async fn get_members(
    State(state): State<AppState>,
    Path(index): Path<String>,
    Query(q): Query<AsOfQuery>,
) -> ApiResult<MembersResponse> {
    let as_of = q.as_of.unwrap_or_else(|| Utc::now().date_naive());
    let conn = state.conn()?;
    let members = Ledger::new(&conn).resolve_membership(&index, as_of)?;

    Ok(ApiResponse::ok(MembersResponse {
        index,
        as_of,
        members: members.into_iter().collect(),
    }))
}

/// GET /api/indexes/:index/events
async fn get_index_events(State(state): State<AppState>, Path(index): Path<String>) -> ApiResult<Vec<LedgerEntry>> {
    let conn = state.conn()?;
    Ok(ApiResponse::ok(Ledger::new(&conn).events_for_index(&index)?))
}

/// GET /api/stale?limit=N
async fn get_stale(State(state): State<AppState>, Query(q): Query<LimitQuery>) -> ApiResult<Vec<SecurityCode>> {
    let conn = state.conn()?;
    let stale = SecurityRegistry::new(&conn).list_stale(state.stale_after, q.limit.unwrap_or(100))?;
    Ok(ApiResponse::ok(stale))
}

/// GET /api/audit
async fn get_audit(State(state): State<AppState>) -> ApiResult<Vec<AuditFinding>> {
    let conn = state.conn()?;
    let registry = SecurityRegistry::new(&conn);
    Ok(ApiResponse::ok(Ledger::new(&conn).audit(&registry)?))
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    println!("🌐 Stock Sentinel - Web Server");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let config = SentinelConfig::load(None).context("failed to load configuration")?;
    let db_path = config.database_path();

    if !db_path.exists() {
        eprintln!("❌ Database not found at {:?}", db_path);
        eprintln!("   Run: sentinel init");
        std::process::exit(1);
    }

    let conn = open_database(&db_path).context("failed to open database")?;
    info!(path = %db_path.display(), "database opened");

    let state = AppState {
        db: Arc::new(Mutex::new(conn)),
        store: Arc::new(SeriesStore::new(&config.data_dir)),
        stale_after: config.harvest_settings().stale_after,
    };

    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/securities", get(list_securities))
        .route("/securities/:code", get(get_security))
        .route("/securities/:code/prices", get(get_prices))
        .route("/indexes/:index/members", get(get_members))
        .route("/indexes/:index/events", get(get_index_events))
        .route("/stale", get(get_stale))
        .route("/audit", get(get_audit))
        .with_state(state);

    let app = Router::new()
        .nest("/api", api_routes)
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&config.server_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.server_addr))?;

    println!("\n🚀 Server running on http://{}", config.server_addr);
    println!("   API: http://{}/api/securities", config.server_addr);
    println!("\n   Press Ctrl+C to stop\n");

    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
