//! WebSocket surface: wire protocol, connection loops and routes

pub mod handler;
pub mod protocol;
pub mod transport;

use axum::{routing::get, Router};

use crate::app::AppState;

/// WebSocket routes
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/ws/matchmaking", get(handler::matchmaking_ws))
        .route("/ws/game/:session_id/:username", get(handler::casual_game_ws))
        .route("/ws/tournament", get(handler::tournament_lobby_ws))
        .route(
            "/ws/tournament/game/:round_type/:tournament_id/:username",
            get(handler::tournament_game_ws),
        )
        .route(
            "/ws/tournament/waiting_final/:tournament_id/:username",
            get(handler::waiting_final_ws),
        )
}
