//! # Memory Server
//!
//! HTTP front of the networked tool memory, backed by [`RedbMemory`].
//! Clients mirror their local writes here and query it like the local store.
//!
//! ## Endpoints
//!
//! - `GET /health` - Health check
//! - `GET /records?q=&limit=` - Keyword search
//! - `GET /records/{prefix}` - One record by hash prefix
//! - `PUT /records/{hash}` - Store a replicated record
//! - `GET /records/{prefix}/related?depth=` - Relation graph neighbors
//! - `POST /edges` - Store a replicated relation
//! - `GET /notes?kind=&context=&q=&limit=` - List or rank notes
//! - `GET /notes/{prefix}` - One note by hash prefix
//! - `PUT /notes/{hash}` - Store a replicated note
//!
//! ## Security Configuration (Environment Variables)
//!
//! - `TOOLSMITH_CORS_ORIGINS`: Comma-separated list of allowed origins, or "*" for all (default: localhost only)
//! - `TOOLSMITH_API_KEY` / `TOOLSMITH_READ_KEY`: write and read-only bearer keys (see [`auth`])
//! - `TOOLSMITH_RATE_LIMIT` / `TOOLSMITH_WRITE_RATE_LIMIT`: per-scope requests per second

pub mod auth;
mod handlers;
mod middleware;
mod types;

pub use auth::{AccessKeys, Denial, Scope};
pub use handlers::MAX_SEARCH_LIMIT;
pub use middleware::RateLimits;
pub use types::{
    ApiError, HealthResponse, NoteResponse, NotesParams, NotesResponse, RelatedParams,
    RelatedResponse, SearchParams, SearchResponse, ShowResponse, WriteResponse, status_for,
};

use axum::{
    Router,
    http::{HeaderValue, Method, header},
    middleware as axum_middleware,
    routing::{get, post},
};
use std::path::Path;
use std::sync::Arc;
use toolsmith_core::{MemoryStore, RedbMemory, ToolsmithError};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Request bodies are single records, edges or notes.
const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

// =============================================================================
// SERVER STATE
// =============================================================================

/// Shared server state. The store synchronizes internally.
#[derive(Clone)]
pub struct AppState {
    pub memory: Arc<MemoryStore>,
}

impl AppState {
    #[must_use]
    pub fn new(memory: MemoryStore) -> Self {
        Self {
            memory: Arc::new(memory),
        }
    }

    /// State over a redb database at `path`, created if missing.
    pub fn open(path: &Path) -> Result<Self, ToolsmithError> {
        Ok(Self::new(MemoryStore::new(RedbMemory::open(path)?)))
    }
}

// =============================================================================
// CORS CONFIGURATION
// =============================================================================

/// Build CORS layer from `TOOLSMITH_CORS_ORIGINS`:
/// - "*": allows all origins
/// - not set: localhost only
/// - otherwise: comma-separated list of allowed origins
fn build_cors_layer() -> CorsLayer {
    let origins_env = std::env::var("TOOLSMITH_CORS_ORIGINS").ok();

    match origins_env.as_deref() {
        Some("*") => {
            tracing::warn!(
                "CORS: Allowing ALL origins (TOOLSMITH_CORS_ORIGINS=*). This is insecure for production!"
            );
            CorsLayer::permissive()
        }
        Some(origins) => {
            let allowed_origins: Vec<HeaderValue> = origins
                .split(',')
                .filter_map(|s| {
                    let trimmed = s.trim();
                    match trimmed.parse::<HeaderValue>() {
                        Ok(hv) => {
                            tracing::info!("CORS: Allowing origin: {}", trimmed);
                            Some(hv)
                        }
                        Err(e) => {
                            tracing::warn!("CORS: Invalid origin '{}': {}", trimmed, e);
                            None
                        }
                    }
                })
                .collect();

            if allowed_origins.is_empty() {
                tracing::warn!(
                    "CORS: No valid origins in TOOLSMITH_CORS_ORIGINS, defaulting to localhost only"
                );
                build_localhost_cors()
            } else {
                restricted_cors(allowed_origins)
            }
        }
        None => {
            tracing::info!("CORS: No TOOLSMITH_CORS_ORIGINS set, defaulting to localhost only");
            build_localhost_cors()
        }
    }
}

fn restricted_cors(origins: Vec<HeaderValue>) -> CorsLayer {
    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::PUT, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
}

fn build_localhost_cors() -> CorsLayer {
    let origins: Vec<HeaderValue> = [
        "http://localhost:3000",
        "http://localhost:7878",
        "http://127.0.0.1:3000",
        "http://127.0.0.1:7878",
    ]
    .into_iter()
    .filter_map(|o| o.parse::<HeaderValue>().ok())
    .collect();
    restricted_cors(origins)
}

// =============================================================================
// ROUTER CREATION
// =============================================================================

/// Create the router with keys and limits taken from the environment.
pub fn create_router(state: AppState) -> Router {
    create_router_with(state, AccessKeys::from_env(), RateLimits::from_env())
}

/// Create the axum router with all endpoints and middleware.
///
/// Middleware stack (outer to inner):
/// 1. Tracing - logs all requests
/// 2. CORS - handles preflight requests
/// 3. Body limit
/// 4. Rate limiting, per scope (unless both buckets are disabled)
/// 5. Access control, per scope (unless no key is configured)
pub fn create_router_with(state: AppState, keys: AccessKeys, limits: RateLimits) -> Router {
    let cors = build_cors_layer();

    if keys.is_open() {
        tracing::warn!(
            "API key authentication DISABLED - all endpoints are publicly accessible. \
             Set TOOLSMITH_API_KEY to enable authentication."
        );
    } else {
        tracing::info!(keys = keys.describe(), "API key authentication enabled");
    }
    tracing::info!(limits = ?limits, "rate limits configured");

    let mut router = Router::new()
        .route("/health", get(handlers::health_handler))
        .route("/records", get(handlers::search_handler))
        .route(
            "/records/{key}",
            get(handlers::show_handler).put(handlers::put_record_handler),
        )
        .route("/records/{key}/related", get(handlers::related_handler))
        .route("/edges", post(handlers::add_edge_handler))
        .route("/notes", get(handlers::notes_handler))
        .route(
            "/notes/{key}",
            get(handlers::show_note_handler).put(handlers::put_note_handler),
        );

    if !keys.is_open() {
        router = router.layer(axum_middleware::from_fn_with_state(
            Arc::new(keys),
            auth::require_scope,
        ));
    }

    if !limits.is_unlimited() {
        router = router.layer(axum_middleware::from_fn_with_state(
            Arc::new(limits),
            middleware::rate_limit_middleware,
        ));
    }

    router
        .layer(axum::extract::DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// =============================================================================
// SERVER STARTUP
// =============================================================================

/// Serve `state` on `addr` until the process is stopped.
pub async fn run_server(addr: &str, state: AppState) -> Result<(), ToolsmithError> {
    let router = create_router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ToolsmithError::Storage(format!("bind {addr} failed: {e}")))?;

    tracing::info!("toolsmith memory server listening on {}", addr);

    axum::serve(listener, router)
        .await
        .map_err(|e| ToolsmithError::Storage(format!("server error: {e}")))
}
