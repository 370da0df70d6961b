//! HTTP route definitions

use axum::{
    extract::{Path, State},
    http::{header, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use serde::Serialize;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::app::AppState;
use crate::game::MatchSnapshot;
use crate::tournament::BracketView;
use crate::util::time::uptime_secs;
use crate::ws;

/// Build the application router
pub fn build_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.client_origin);

    let public_routes = Router::new()
        .route("/health", get(health_handler))
        .route("/sessions/:session_id", get(session_handler))
        .route("/tournaments/:tournament_id", get(tournament_handler));

    Router::new()
        .merge(public_routes)
        .merge(ws::routes())
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// CORS configuration - `*` allows any origin, otherwise a comma-separated list
fn cors_layer(client_origin: &str) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]);

    if client_origin.trim() == "*" {
        return base.allow_origin(Any);
    }

    let allowed_origins: Vec<HeaderValue> = client_origin
        .split(',')
        .filter_map(|s| s.trim().parse::<HeaderValue>().ok())
        .collect();

    base.allow_origin(allowed_origins).allow_credentials(true)
}

// ============================================================================
// Health endpoint
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    active_sessions: usize,
    active_tournaments: usize,
    waiting_players: usize,
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: uptime_secs(),
        active_sessions: state.registry.active_sessions(),
        active_tournaments: state.orchestrator.active_tournaments(),
        waiting_players: state.lobby.waiting_count(),
    })
}

// ============================================================================
// Snapshot endpoints
// ============================================================================

async fn session_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<MatchSnapshot>, AppError> {
    state
        .registry
        .get(&session_id)
        .map(|live| Json(live.snapshot()))
        .ok_or_else(|| AppError::NotFound(format!("Session {session_id} not found")))
}

async fn tournament_handler(
    State(state): State<AppState>,
    Path(tournament_id): Path<u64>,
) -> Result<Json<BracketView>, AppError> {
    state
        .orchestrator
        .bracket(tournament_id)
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("Tournament {tournament_id} not found")))
}

// ============================================================================
// Error handling
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
        };

        let body = serde_json::json!({
            "error": message
        });

        (status, Json(body)).into_response()
    }
}
