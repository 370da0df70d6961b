//! WebSocket upgrade handlers and per-connection loops

use std::fmt;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::app::AppState;
use crate::game::{MatchEvent, MatchOutcome, PlayerId, RoundType, ViewerGuard};
use crate::http::middleware::{authenticate, ensure_identity, AuthError, JwtClaims};
use crate::matchmaking::JoinOutcome;
use crate::tournament::{TournamentEvent, TournamentStatus};
use crate::util::rate_limit::PlayerRateLimiter;
use crate::ws::protocol::{ClientMsg, ProtocolError, ServerMsg};
use crate::ws::transport::{BindError, MatchTransport};

/// Queue depth between a connection's producers and its socket writer
const OUTBOUND_CAPACITY: usize = 128;

/// How long queued messages may take to flush once a connection closes
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

type WsSink = SplitSink<WebSocket, Message>;
type WsStream = SplitStream<WebSocket>;

/// Query parameters for WebSocket connection
#[derive(Debug, Default, Deserialize)]
pub struct WsQuery {
    /// Token of the web application, required when a secret is configured
    #[serde(default)]
    pub token: Option<String>,
}

/// Lifecycle of one socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Connecting,
    Bound,
    Active,
    Closed,
}

impl fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionPhase::Connecting => "connecting",
            ConnectionPhase::Bound => "bound",
            ConnectionPhase::Active => "active",
            ConnectionPhase::Closed => "closed",
        })
    }
}

// ============================================================================
// Upgrade handlers
// ============================================================================

/// `GET /ws/matchmaking`
pub async fn matchmaking_ws(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    match authorize(&state, &query, &headers, None) {
        Ok(claims) => ws.on_upgrade(move |socket| run_matchmaking(socket, state, claims)),
        Err(err) => reject(err),
    }
}

/// `GET /ws/game/:session_id/:username`
pub async fn casual_game_ws(
    ws: WebSocketUpgrade,
    Path((session_id, username)): Path<(String, PlayerId)>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    if let Err(err) = authorize(&state, &query, &headers, Some(&username)) {
        return reject(err);
    }
    ws.on_upgrade(move |socket| {
        run_game(socket, state, username, MatchTransport::Casual, Some(session_id))
    })
}

/// `GET /ws/tournament`
pub async fn tournament_lobby_ws(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    match authorize(&state, &query, &headers, None) {
        Ok(claims) => ws.on_upgrade(move |socket| run_tournament_lobby(socket, state, claims)),
        Err(err) => reject(err),
    }
}

/// `GET /ws/tournament/game/:round_type/:tournament_id/:username`
pub async fn tournament_game_ws(
    ws: WebSocketUpgrade,
    Path((round_type, tournament_id, username)): Path<(String, u64, PlayerId)>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    let Some(round) = RoundType::parse(&round_type) else {
        return (StatusCode::BAD_REQUEST, format!("Unknown round type: {round_type}"))
            .into_response();
    };
    if let Err(err) = authorize(&state, &query, &headers, Some(&username)) {
        return reject(err);
    }
    let transport = MatchTransport::Tournament {
        tournament_id,
        round,
    };
    ws.on_upgrade(move |socket| run_game(socket, state, username, transport, None))
}

/// `GET /ws/tournament/waiting_final/:tournament_id/:username`
pub async fn waiting_final_ws(
    ws: WebSocketUpgrade,
    Path((tournament_id, username)): Path<(u64, PlayerId)>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    if let Err(err) = authorize(&state, &query, &headers, Some(&username)) {
        return reject(err);
    }
    ws.on_upgrade(move |socket| run_waiting_final(socket, state, tournament_id, username))
}

fn authorize(
    state: &AppState,
    query: &WsQuery,
    headers: &HeaderMap,
    username: Option<&str>,
) -> Result<Option<JwtClaims>, AuthError> {
    let claims = authenticate(
        state.config.jwt_secret.as_deref(),
        query.token.as_deref(),
        headers,
    )?;
    if let Some(username) = username {
        ensure_identity(claims.as_ref(), username)?;
    }
    Ok(claims)
}

fn reject(err: AuthError) -> Response {
    warn!(error = %err, "WebSocket auth failed");
    err.into_response()
}

// ============================================================================
// Connection plumbing
// ============================================================================

/// Per-socket bookkeeping shared by every route
struct Connection {
    route: &'static str,
    player: Option<PlayerId>,
    phase: ConnectionPhase,
    outbound: mpsc::Sender<ServerMsg>,
    rate_limiter: PlayerRateLimiter,
}

impl Connection {
    fn new(route: &'static str, player: Option<PlayerId>, outbound: mpsc::Sender<ServerMsg>) -> Self {
        let conn = Self {
            route,
            player,
            phase: ConnectionPhase::Connecting,
            outbound,
            rate_limiter: PlayerRateLimiter::new(),
        };
        info!(route, player = conn.name(), phase = %conn.phase, "New WebSocket connection");
        conn
    }

    fn name(&self) -> &str {
        self.player.as_deref().unwrap_or("-")
    }

    fn enter(&mut self, phase: ConnectionPhase) {
        if self.phase == phase {
            return;
        }
        info!(
            route = self.route,
            player = self.name(),
            from = %self.phase,
            to = %phase,
            "Connection phase changed"
        );
        self.phase = phase;
    }

    async fn reply(&self, msg: ServerMsg) {
        if self.outbound.send(msg).await.is_err() {
            debug!(route = self.route, player = self.name(), "Outbound channel closed");
        }
    }

    async fn reply_error(&self, message: impl Into<String>) {
        self.reply(ServerMsg::error(message)).await;
    }

    /// Whether the player's account exists. A failing store lets them through.
    async fn known_user(&self, state: &AppState, username: &str) -> bool {
        match state.store.user_exists(username).await {
            Ok(exists) => exists,
            Err(err) => {
                warn!(player = %username, error = %err, "User lookup failed, allowing connection");
                true
            }
        }
    }

    /// Turn one inbound frame into something the route loop acts on
    fn classify(&self, frame: Option<Result<Message, axum::Error>>) -> Inbound {
        match frame {
            None => Inbound::Close,
            Some(Ok(Message::Text(text))) => {
                if !self.rate_limiter.check_input() {
                    warn!(route = self.route, player = self.name(), "Rate limited input message");
                    return Inbound::Ignore;
                }
                match ClientMsg::parse(&text) {
                    Ok(msg) => Inbound::Msg(msg),
                    Err(err) => {
                        debug!(player = self.name(), error = %err, "Failed to parse client message");
                        Inbound::Invalid(err)
                    }
                }
            }
            Some(Ok(Message::Binary(_))) => Inbound::Invalid(ProtocolError::Binary),
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => Inbound::Ignore,
            Some(Ok(Message::Close(_))) => {
                info!(route = self.route, player = self.name(), "Client initiated close");
                Inbound::Close
            }
            Some(Err(err)) => {
                debug!(route = self.route, player = self.name(), error = %err, "WebSocket error");
                Inbound::Close
            }
        }
    }

    /// Flush what is queued and close the socket
    async fn finish(mut self, mut writer: JoinHandle<()>) {
        self.enter(ConnectionPhase::Closed);
        let Connection { outbound, .. } = self;
        drop(outbound);
        if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer)
            .await
            .is_err()
        {
            writer.abort();
        }
    }
}

enum Inbound {
    Msg(ClientMsg),
    Invalid(ProtocolError),
    Ignore,
    Close,
}

/// Split the socket and spawn its writer
fn open(socket: WebSocket) -> (WsStream, mpsc::Sender<ServerMsg>, JoinHandle<()>) {
    let (ws_sink, ws_stream) = socket.split();
    let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
    (ws_stream, tx, tokio::spawn(write_loop(ws_sink, rx)))
}

/// Drain the outbound queue into the socket
async fn write_loop(mut ws_sink: WsSink, mut rx: mpsc::Receiver<ServerMsg>) {
    while let Some(msg) = rx.recv().await {
        if let Err(e) = send_msg(&mut ws_sink, &msg).await {
            debug!(error = %e, "WebSocket send failed");
            return;
        }
    }
    let _ = ws_sink.close().await;
}

/// Send a message over WebSocket
async fn send_msg(sink: &mut WsSink, msg: &ServerMsg) -> Result<(), String> {
    let json = serde_json::to_string(msg).map_err(|e| e.to_string())?;
    sink.send(Message::Text(json))
        .await
        .map_err(|e| e.to_string())
}

/// Resolves when the forwarder finished, never if there is none
async fn finished(forwarder: Option<&mut JoinHandle<()>>) {
    match forwarder {
        Some(handle) => {
            let _ = handle.await;
        }
        None => std::future::pending().await,
    }
}

// ============================================================================
// Game sockets
// ============================================================================

/// A game socket attached to its session
struct Binding {
    guard: ViewerGuard,
    forwarder: JoinHandle<()>,
}

async fn run_game(
    socket: WebSocket,
    state: AppState,
    player: PlayerId,
    transport: MatchTransport,
    url_session: Option<String>,
) {
    let (mut ws_stream, outbound, writer) = open(socket);
    let mut conn = Connection::new("game", Some(player.clone()), outbound);

    if !conn.known_user(&state, &player).await {
        conn.reply_error("User not found").await;
        conn.finish(writer).await;
        return;
    }

    let mut binding = None;
    if let Some(session_id) = url_session.filter(|_| transport.binds_on_connect()) {
        match bind(&mut conn, &state, transport, &session_id).await {
            Ok(bound) => binding = Some(bound),
            Err(err) => {
                warn!(session_id = %session_id, player = %player, error = %err, "Bind rejected");
                conn.reply_error(err.to_string()).await;
                conn.finish(writer).await;
                return;
            }
        }
    }

    loop {
        tokio::select! {
            frame = ws_stream.next() => {
                match conn.classify(frame) {
                    Inbound::Msg(msg) => {
                        if !handle_game_msg(&mut conn, &state, transport, &mut binding, msg).await {
                            break;
                        }
                    }
                    Inbound::Invalid(err) => conn.reply_error(err.to_string()).await,
                    Inbound::Ignore => {}
                    Inbound::Close => break,
                }
            }
            _ = finished(binding.as_mut().map(|b| &mut b.forwarder)) => {
                debug!(player = %player, "Match over, closing game socket");
                break;
            }
        }
    }

    if let Some(Binding { guard, forwarder }) = binding.take() {
        let live = guard.session();
        if live.is_active() {
            transport
                .forfeit(&state.registry, &state.orchestrator, live.key(), &player)
                .await;
        }
        forwarder.abort();
    }

    info!(player = %player, transport = %transport, "Game connection closed");
    conn.finish(writer).await;
}

/// Handle one message on a game socket. Returns false to close the socket.
async fn handle_game_msg(
    conn: &mut Connection,
    state: &AppState,
    transport: MatchTransport,
    binding: &mut Option<Binding>,
    msg: ClientMsg,
) -> bool {
    let player = conn.name().to_string();
    match msg {
        ClientMsg::Move { position } => match binding {
            Some(bound) => {
                if !bound.guard.session().move_player(&player, position) {
                    debug!(player = %player, "Move ignored");
                }
            }
            None => conn.reply_error("Session not initialized").await,
        },
        ClientMsg::SessionInit { session_id } => {
            if transport.binds_on_connect() || binding.is_some() {
                conn.reply_error("Session already initialized").await;
                return true;
            }
            match bind(conn, state, transport, &session_id).await {
                Ok(bound) => *binding = Some(bound),
                Err(err) => {
                    warn!(session_id = %session_id, player = %player, error = %err, "Bind rejected");
                    conn.reply_error(err.to_string()).await;
                    return false;
                }
            }
        }
        ClientMsg::MatchResult {
            match_id,
            winner,
            scores,
        } => {
            let MatchTransport::Tournament { tournament_id, .. } = transport else {
                conn.reply_error("Match results are only accepted for tournament matches")
                    .await;
                return true;
            };
            if let Err(err) = state.orchestrator.report_match_result(
                tournament_id,
                &player,
                &match_id,
                &winner,
                scores,
            ) {
                conn.reply_error(err.to_string()).await;
            }
        }
        ClientMsg::Ping { t } => conn.reply(ServerMsg::Pong { t }).await,
        other => {
            conn.reply_error(format!("Unsupported message type: {}", other.kind()))
                .await
        }
    }
    true
}

/// Attach the connection to its session: subscribe first, then register as
/// a viewer, which starts the match on the first bind
async fn bind(
    conn: &mut Connection,
    state: &AppState,
    transport: MatchTransport,
    session_id: &str,
) -> Result<Binding, BindError> {
    let player = conn.name().to_string();
    let live = transport.resolve(&state.registry, &state.orchestrator, session_id, &player)?;

    let events = live.subscribe();
    if !live.is_active() {
        return Err(BindError::Finished(session_id.to_string()));
    }

    conn.reply(ServerMsg::GameInitialized {
        session_id: live.key().to_string(),
    })
    .await;
    conn.reply(ServerMsg::StateUpdate {
        state: live.state_for(&player),
    })
    .await;

    let guard = live.bind(&player);
    conn.enter(ConnectionPhase::Bound);

    let forwarder = tokio::spawn(forward_match_events(
        events,
        conn.outbound.clone(),
        player,
        transport,
    ));
    conn.enter(ConnectionPhase::Active);

    Ok(Binding { guard, forwarder })
}

/// Relay session events to one viewer until the match is over
async fn forward_match_events(
    mut events: broadcast::Receiver<MatchEvent>,
    outbound: mpsc::Sender<ServerMsg>,
    player: PlayerId,
    transport: MatchTransport,
) {
    loop {
        let msg = match events.recv().await {
            Ok(MatchEvent::State(snapshot)) => ServerMsg::StateUpdate {
                state: snapshot.for_viewer(&player),
            },
            Ok(MatchEvent::PlayerDisconnected {
                player: gone,
                snapshot,
            }) => ServerMsg::PlayerDisconnected {
                disconnected_player: gone,
                state: snapshot.for_viewer(&player),
            },
            Ok(MatchEvent::Ended(outcome)) => {
                let _ = outbound.send(game_end(&outcome, &player, transport)).await;
                return;
            }
            Ok(MatchEvent::Aborted { reason }) => {
                let _ = outbound.send(ServerMsg::error(reason)).await;
                return;
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(player = %player, lagged_count = n, "Client lagged, skipping {} snapshots", n);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };

        if outbound.send(msg).await.is_err() {
            return;
        }
    }
}

fn game_end(outcome: &MatchOutcome, viewer: &str, transport: MatchTransport) -> ServerMsg {
    ServerMsg::GameEnd {
        session_id: outcome.result.session_id.key(),
        winner: outcome.result.winner.clone(),
        score: outcome.final_state.score.clone(),
        reason: outcome.result.reason,
        next_stage: transport.next_stage(outcome, viewer),
        bracket: outcome.bracket.clone(),
    }
}

// ============================================================================
// Casual lobby
// ============================================================================

async fn run_matchmaking(socket: WebSocket, state: AppState, claims: Option<JwtClaims>) {
    let (mut ws_stream, outbound, writer) = open(socket);
    let mut conn = Connection::new(
        "matchmaking",
        claims.as_ref().map(|c| c.username.clone()),
        outbound,
    );
    conn.enter(ConnectionPhase::Active);

    // Set while this socket has a player in the queue
    let mut queued: Option<PlayerId> = None;

    loop {
        let msg = match conn.classify(ws_stream.next().await) {
            Inbound::Msg(msg) => msg,
            Inbound::Invalid(err) => {
                conn.reply_error(err.to_string()).await;
                continue;
            }
            Inbound::Ignore => continue,
            Inbound::Close => break,
        };

        match msg {
            ClientMsg::JoinMatchmaking { username } => {
                if let Err(err) = ensure_identity(claims.as_ref(), &username) {
                    conn.reply_error(err.to_string()).await;
                    continue;
                }
                if !conn.known_user(&state, &username).await {
                    conn.reply_error("User not found").await;
                    continue;
                }
                if let Some(previous) = queued.take().filter(|p| *p != username) {
                    state.lobby.leave(&previous, &conn.outbound);
                }
                conn.player = Some(username.clone());

                match state.lobby.join(&username, conn.outbound.clone()) {
                    Ok(outcome) => {
                        if outcome == JoinOutcome::Waiting {
                            queued = Some(username);
                            conn.enter(ConnectionPhase::Bound);
                        }
                        conn.reply(outcome.into_message()).await;
                    }
                    Err(err) => {
                        warn!(player = %username, error = %err, "Matchmaking failed");
                        conn.reply_error(err.to_string()).await;
                    }
                }
            }
            ClientMsg::CancelMatching => {
                if let Some(player) = queued.take() {
                    state.lobby.leave(&player, &conn.outbound);
                }
            }
            ClientMsg::Ping { t } => conn.reply(ServerMsg::Pong { t }).await,
            other => {
                conn.reply_error(format!("Unsupported message type: {}", other.kind()))
                    .await
            }
        }
    }

    if let Some(player) = queued {
        state.lobby.leave(&player, &conn.outbound);
    }
    conn.finish(writer).await;
}

// ============================================================================
// Tournament lobby
// ============================================================================

struct LobbySeat {
    tournament_id: u64,
    player: PlayerId,
    forwarder: Option<JoinHandle<()>>,
}

async fn run_tournament_lobby(socket: WebSocket, state: AppState, claims: Option<JwtClaims>) {
    let (mut ws_stream, outbound, writer) = open(socket);
    let mut conn = Connection::new(
        "tournament",
        claims.as_ref().map(|c| c.username.clone()),
        outbound,
    );
    conn.enter(ConnectionPhase::Active);

    let mut seat: Option<LobbySeat> = None;

    loop {
        let frame = tokio::select! {
            frame = ws_stream.next() => frame,
            _ = finished(seat.as_mut().and_then(|s| s.forwarder.as_mut())) => {
                // Tournament is over and its channel closed
                if let Some(seat) = seat.as_mut() {
                    seat.forwarder = None;
                }
                continue;
            }
        };

        let msg = match conn.classify(frame) {
            Inbound::Msg(msg) => msg,
            Inbound::Invalid(err) => {
                conn.reply_error(err.to_string()).await;
                continue;
            }
            Inbound::Ignore => continue,
            Inbound::Close => break,
        };

        match msg {
            ClientMsg::JoinTournament { username } => {
                if let Err(err) = ensure_identity(claims.as_ref(), &username) {
                    conn.reply_error(err.to_string()).await;
                    continue;
                }
                if seat.is_some() {
                    conn.reply_error("Already joined tournament").await;
                    continue;
                }
                if !conn.known_user(&state, &username).await {
                    conn.reply_error("User not found").await;
                    continue;
                }
                conn.player = Some(username.clone());

                match state.orchestrator.join(&username) {
                    Ok(joined) => {
                        let forwarder = tokio::spawn(forward_tournament_events(
                            joined.events,
                            conn.outbound.clone(),
                            username.clone(),
                        ));
                        seat = Some(LobbySeat {
                            tournament_id: joined.tournament_id,
                            player: username,
                            forwarder: Some(forwarder),
                        });
                        conn.enter(ConnectionPhase::Bound);
                    }
                    Err(err) => conn.reply_error(err.to_string()).await,
                }
            }
            ClientMsg::LeaveTournament { username } => {
                let Some(current) = seat.as_ref().filter(|s| s.player == username) else {
                    conn.reply_error("Not in a tournament").await;
                    continue;
                };
                match state.orchestrator.leave(current.tournament_id, &username) {
                    Ok(_) => {
                        if let Some(LobbySeat {
                            forwarder: Some(forwarder),
                            ..
                        }) = seat.take()
                        {
                            forwarder.abort();
                        }
                        conn.enter(ConnectionPhase::Active);
                        conn.reply(ServerMsg::waiting("Left tournament")).await;
                    }
                    Err(err) => conn.reply_error(err.to_string()).await,
                }
            }
            ClientMsg::MatchResult {
                match_id,
                winner,
                scores,
            } => {
                let Some(current) = seat.as_ref() else {
                    conn.reply_error("Not in a tournament").await;
                    continue;
                };
                if let Err(err) = state.orchestrator.report_match_result(
                    current.tournament_id,
                    &current.player,
                    &match_id,
                    &winner,
                    scores,
                ) {
                    conn.reply_error(err.to_string()).await;
                }
            }
            ClientMsg::Ping { t } => conn.reply(ServerMsg::Pong { t }).await,
            other => {
                conn.reply_error(format!("Unsupported message type: {}", other.kind()))
                    .await
            }
        }
    }

    if let Some(seat) = seat {
        // Once the bracket is drawn the game sockets own the player's fate
        if state.orchestrator.status(seat.tournament_id) == Some(TournamentStatus::WaitingPlayers) {
            if let Err(err) = state.orchestrator.leave(seat.tournament_id, &seat.player) {
                debug!(player = %seat.player, error = %err, "Leave on disconnect skipped");
            }
        }
        if let Some(forwarder) = seat.forwarder {
            forwarder.abort();
        }
    }
    conn.finish(writer).await;
}

/// Relay the notifications meant for `player`
async fn forward_tournament_events(
    mut events: broadcast::Receiver<TournamentEvent>,
    outbound: mpsc::Sender<ServerMsg>,
    player: PlayerId,
) {
    loop {
        match events.recv().await {
            Ok(event) if event.is_for(&player) => {
                if outbound.send(event.msg).await.is_err() {
                    return;
                }
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(player = %player, lagged_count = n, "Tournament listener lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

// ============================================================================
// Finalist waiting room
// ============================================================================

async fn run_waiting_final(
    socket: WebSocket,
    state: AppState,
    tournament_id: u64,
    player: PlayerId,
) {
    let (mut ws_stream, outbound, writer) = open(socket);
    let mut conn = Connection::new("waiting_final", Some(player.clone()), outbound);

    if !conn.known_user(&state, &player).await {
        conn.reply_error("User not found").await;
        conn.finish(writer).await;
        return;
    }
    if !state.orchestrator.is_finalist(tournament_id, &player) {
        info!(tournament_id, player = %player, "Not a finalist, closing");
        conn.reply_error("You are not eligible for the final match.")
            .await;
        conn.finish(writer).await;
        return;
    }

    // Subscribe before the first status so `final_ready` cannot slip through
    let mut forwarder = state
        .orchestrator
        .subscribe(tournament_id)
        .map(|events| {
            tokio::spawn(forward_tournament_events(
                events,
                conn.outbound.clone(),
                player.clone(),
            ))
        });
    conn.enter(ConnectionPhase::Bound);
    send_final_status(&conn, &state, tournament_id).await;
    conn.enter(ConnectionPhase::Active);

    loop {
        let frame = tokio::select! {
            frame = ws_stream.next() => frame,
            _ = finished(forwarder.as_mut()) => {
                forwarder = None;
                continue;
            }
        };

        match conn.classify(frame) {
            Inbound::Msg(ClientMsg::RequestStatus) => {
                send_final_status(&conn, &state, tournament_id).await
            }
            Inbound::Msg(ClientMsg::Ping { t }) => conn.reply(ServerMsg::Pong { t }).await,
            Inbound::Msg(other) => {
                conn.reply_error(format!("Unsupported message type: {}", other.kind()))
                    .await
            }
            Inbound::Invalid(err) => conn.reply_error(err.to_string()).await,
            Inbound::Ignore => {}
            Inbound::Close => break,
        }
    }

    if let Some(forwarder) = forwarder {
        forwarder.abort();
    }
    conn.finish(writer).await;
}

async fn send_final_status(conn: &Connection, state: &AppState, tournament_id: u64) {
    match state.orchestrator.final_status(tournament_id) {
        Ok(status) => conn.reply(status).await,
        Err(err) => {
            conn.reply_error(err.to_string()).await;
            return;
        }
    }
    if let Some(ready) = state.orchestrator.final_ready_for(tournament_id, conn.name()) {
        conn.reply(ready).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, GameConfig};
    use crate::game::SessionId;
    use crate::http::build_router;
    use crate::store::MemoryStore;
    use serde_json::{json, Value};
    use std::net::SocketAddr;
    use std::sync::Arc;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    fn test_state(store: Arc<MemoryStore>) -> AppState {
        let config = Config {
            server_addr: "127.0.0.1:0".parse().unwrap(),
            log_level: "info".to_string(),
            client_origin: "*".to_string(),
            store_url: None,
            store_api_key: None,
            jwt_secret: None,
            game: GameConfig::default(),
        };
        AppState::with_store(config, store)
    }

    async fn serve(state: AppState) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, build_router(state)).await.unwrap();
        });
        addr
    }

    async fn connect(addr: SocketAddr, path: &str) -> Client {
        let (ws, _) = connect_async(format!("ws://{addr}{path}")).await.unwrap();
        ws
    }

    async fn send(ws: &mut Client, msg: Value) {
        ws.send(WsMessage::Text(msg.to_string())).await.unwrap();
    }

    /// Next JSON message, skipping control frames
    async fn recv(ws: &mut Client) -> Value {
        loop {
            let frame = timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("timed out waiting for a message");
            match frame {
                Some(Ok(WsMessage::Text(text))) => return serde_json::from_str(&text).unwrap(),
                Some(Ok(WsMessage::Close(_))) | None => panic!("socket closed"),
                Some(Ok(_)) => continue,
                Some(Err(err)) => panic!("socket error: {err}"),
            }
        }
    }

    /// Skip messages until one of type `kind` arrives
    async fn recv_type(ws: &mut Client, kind: &str) -> Value {
        loop {
            let msg = recv(ws).await;
            if msg["type"] == kind {
                return msg;
            }
        }
    }

    async fn closed_by_server(ws: &mut Client) -> bool {
        loop {
            match timeout(Duration::from_secs(5), ws.next()).await {
                Err(_) => return false,
                Ok(Some(Ok(WsMessage::Close(_)))) | Ok(None) | Ok(Some(Err(_))) => return true,
                Ok(Some(Ok(_))) => continue,
            }
        }
    }

    async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..300 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn malformed_frames_get_an_error_and_keep_the_socket() {
        let addr = serve(test_state(Arc::new(MemoryStore::new()))).await;
        let mut ws = connect(addr, "/ws/matchmaking").await;

        ws.send(WsMessage::Text("{not json".to_string())).await.unwrap();
        assert_eq!(recv(&mut ws).await["type"], "error");

        send(&mut ws, json!({ "type": "teleport" })).await;
        assert_eq!(recv(&mut ws).await["type"], "error");

        send(&mut ws, json!({ "type": "ping", "t": 5 })).await;
        assert_eq!(recv(&mut ws).await, json!({ "type": "pong", "t": 5 }));
    }

    #[tokio::test]
    async fn both_players_receive_the_same_match_found() {
        let state = test_state(Arc::new(MemoryStore::new()));
        let addr = serve(state.clone()).await;

        let mut alice = connect(addr, "/ws/matchmaking").await;
        send(&mut alice, json!({ "type": "join_matchmaking", "username": "alice" })).await;
        assert_eq!(recv(&mut alice).await["type"], "waiting");

        let mut bob = connect(addr, "/ws/matchmaking").await;
        send(&mut bob, json!({ "type": "join_matchmaking", "username": "bob" })).await;

        let to_bob = recv_type(&mut bob, "match_found").await;
        let to_alice = recv_type(&mut alice, "match_found").await;
        assert_eq!(to_alice, to_bob);
        assert_eq!(to_bob["player1"], "alice");
        assert_eq!(to_bob["player2"], "bob");

        let session_id = to_bob["session_id"].as_str().unwrap();
        assert!(state.registry.get(session_id).is_some());
        assert_eq!(state.lobby.waiting_count(), 0);
    }

    #[tokio::test]
    async fn closing_a_waiting_socket_leaves_the_queue() {
        let state = test_state(Arc::new(MemoryStore::new()));
        let addr = serve(state.clone()).await;

        let mut alice = connect(addr, "/ws/matchmaking").await;
        send(&mut alice, json!({ "type": "join_matchmaking", "username": "alice" })).await;
        assert_eq!(recv(&mut alice).await["type"], "waiting");
        assert!(state.lobby.is_waiting("alice"));

        alice.close(None).await.unwrap();
        assert!(eventually(|| !state.lobby.is_waiting("alice")).await);
    }

    #[tokio::test]
    async fn unknown_users_are_turned_away() {
        let state = test_state(Arc::new(MemoryStore::with_users(["alice", "bob"])));
        let live = state
            .registry
            .launch(SessionId::casual("alice", "bob"), None)
            .unwrap();
        let addr = serve(state.clone()).await;

        let mut ws = connect(addr, &format!("/ws/game/{}/mallory", live.key())).await;
        assert_eq!(recv(&mut ws).await["message"], "User not found");
        assert!(closed_by_server(&mut ws).await);
        assert!(!live.is_started());
    }

    #[tokio::test]
    async fn casual_disconnect_forfeits_and_releases_every_viewer() {
        let store = Arc::new(MemoryStore::new());
        let state = test_state(store.clone());
        let live = state
            .registry
            .launch(SessionId::casual("alice", "bob"), None)
            .unwrap();
        let key = live.key().to_string();
        let addr = serve(state.clone()).await;

        let mut alice = connect(addr, &format!("/ws/game/{key}/alice")).await;
        let init = recv(&mut alice).await;
        assert_eq!(init, json!({ "type": "game_initialized", "session_id": key }));
        assert_eq!(recv(&mut alice).await["type"], "state_update");

        let mut bob = connect(addr, &format!("/ws/game/{key}/bob")).await;
        recv_type(&mut bob, "game_initialized").await;
        assert!(eventually(|| live.viewer_count() == 2).await);
        assert!(live.is_started());

        send(&mut alice, json!({ "type": "move", "position": 120.0 })).await;
        alice.close(None).await.unwrap();

        let notice = recv_type(&mut bob, "player_disconnected").await;
        assert_eq!(notice["disconnected_player"], "alice");
        let end = recv_type(&mut bob, "game_end").await;
        assert_eq!(end["winner"], "bob");
        assert_eq!(end["reason"], "forfeit");
        assert_eq!(end["next_stage"], "lobby");
        assert_eq!(end["score"]["bob"], 15);
        assert_eq!(end["score"]["alice"], 0);

        // The server closes the surviving socket after game_end
        assert!(closed_by_server(&mut bob).await);
        assert!(eventually(|| live.viewer_count() == 0).await);
        assert!(state.registry.get(&key).is_none());
        assert_eq!(store.game(&key).unwrap().winner.as_deref(), Some("bob"));
    }

    #[tokio::test]
    async fn bracket_socket_binds_after_session_init() {
        let state = test_state(Arc::new(MemoryStore::new()));
        for player in ["p1", "p2", "p3", "p4"] {
            state.orchestrator.join(player).unwrap();
        }
        let bracket = state.orchestrator.bracket(1).unwrap();
        let semi1 = bracket.semifinals[0].clone();
        let outsider = bracket.semifinals[1].player1.clone();
        let live = state.registry.get(&semi1.session_id).unwrap();
        let addr = serve(state.clone()).await;

        let mut ws = connect(
            addr,
            &format!("/ws/tournament/game/semi1/1/{}", semi1.player1),
        )
        .await;

        send(&mut ws, json!({ "type": "move", "position": 10.0 })).await;
        assert_eq!(recv(&mut ws).await["message"], "Session not initialized");
        assert!(!live.is_started());

        send(&mut ws, json!({ "type": "session_init", "session_id": semi1.session_id })).await;
        let init = recv(&mut ws).await;
        assert_eq!(init["type"], "game_initialized");
        assert_eq!(init["session_id"], semi1.session_id.as_str());
        assert_eq!(recv(&mut ws).await["type"], "state_update");
        assert!(eventually(|| live.viewer_count() == 1).await);

        send(&mut ws, json!({ "type": "session_init", "session_id": semi1.session_id })).await;
        assert_eq!(recv_type(&mut ws, "error").await["message"], "Session already initialized");

        // A player from the other semifinal cannot attach to this one
        let mut intruder = connect(
            addr,
            &format!("/ws/tournament/game/semi1/1/{outsider}"),
        )
        .await;
        send(&mut intruder, json!({ "type": "session_init", "session_id": semi1.session_id })).await;
        assert_eq!(recv(&mut intruder).await["type"], "error");
        assert!(closed_by_server(&mut intruder).await);
        assert_eq!(live.viewer_count(), 1);
    }

    #[tokio::test]
    async fn unknown_round_is_rejected_before_upgrade() {
        let addr = serve(test_state(Arc::new(MemoryStore::new()))).await;
        let result = connect_async(format!("ws://{addr}/ws/tournament/game/quarter/1/p1")).await;
        assert!(result.is_err());
    }
}
