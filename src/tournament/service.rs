//! Tournament orchestration: joining, bracket progression, forfeits

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::game::{
    FinishedMatch, LiveSession, MatchRegistry, MatchResultSink, PlayerId, RoundType, SessionId,
};
use crate::store::{MatchStore, TournamentRecord};
use crate::ws::protocol::{FinalistView, ServerMsg};

use super::bracket::{
    BracketView, ResultEffect, ScorePair, TournamentState, TournamentStatus, FINALIST_POSITION,
    REQUIRED_PLAYERS,
};
use super::TournamentError;

/// Capacity of a tournament's event channel
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Notification for the lobby and waiting-room connections of a tournament
#[derive(Debug, Clone)]
pub struct TournamentEvent {
    /// `None` goes to every connection
    pub target: Option<PlayerId>,
    pub msg: ServerMsg,
}

impl TournamentEvent {
    pub fn is_for(&self, player: &str) -> bool {
        self.target.as_deref().map_or(true, |target| target == player)
    }
}

/// Returned by `join`: the tournament and a subscription taken before the
/// join was applied, so no notification about it can be missed
pub struct JoinedTournament {
    pub tournament_id: u64,
    pub participants: usize,
    pub events: broadcast::Receiver<TournamentEvent>,
}

struct TournamentEntry {
    state: Mutex<TournamentState>,
    events: broadcast::Sender<TournamentEvent>,
}

impl TournamentEntry {
    fn new(id: u64) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(TournamentState::new(id)),
            events,
        }
    }

    fn emit(&self, target: Option<&str>, msg: ServerMsg) {
        let _ = self.events.send(TournamentEvent {
            target: target.map(str::to_string),
            msg,
        });
    }
}

enum DisconnectAction {
    Nothing,
    Left(TournamentRecord),
    Forfeit {
        session_key: String,
        opponent: PlayerId,
        scores: ScorePair,
    },
}

/// Owns every live tournament and drives it from join to champion
pub struct TournamentOrchestrator {
    tournaments: DashMap<u64, Arc<TournamentEntry>>,
    history: DashMap<u64, TournamentState>,
    /// Tournament currently gathering players
    open: Mutex<Option<u64>>,
    next_id: AtomicU64,
    registry: Arc<MatchRegistry>,
    store: Arc<dyn MatchStore>,
    me: Weak<TournamentOrchestrator>,
}

impl TournamentOrchestrator {
    pub fn new(registry: Arc<MatchRegistry>, store: Arc<dyn MatchStore>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            tournaments: DashMap::new(),
            history: DashMap::new(),
            open: Mutex::new(None),
            next_id: AtomicU64::new(1),
            registry,
            store,
            me: me.clone(),
        })
    }

    /// Seed the tracking entry of a tournament (idempotent)
    pub fn initialize(&self, tournament_id: u64) -> Result<(), TournamentError> {
        if self.history.contains_key(&tournament_id) {
            return Err(TournamentError::AlreadyCompleted(tournament_id));
        }
        self.tournaments
            .entry(tournament_id)
            .or_insert_with(|| Arc::new(TournamentEntry::new(tournament_id)));
        self.next_id.fetch_max(tournament_id + 1, Ordering::SeqCst);
        Ok(())
    }

    /// Join the tournament that is gathering players, creating one if needed
    pub fn join(&self, player: &str) -> Result<JoinedTournament, TournamentError> {
        let mut open = self.open.lock();

        if let Some(existing) = self.live_tournament_of(player) {
            debug!(player = %player, tournament_id = existing, "Rejected duplicate join");
            return Err(TournamentError::AlreadyJoined(player.to_string()));
        }

        let tournament_id = match *open {
            Some(id) if self.status(id) == Some(TournamentStatus::WaitingPlayers) => id,
            _ => {
                let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                self.initialize(id)?;
                *open = Some(id);
                info!(tournament_id = id, "Tournament created");
                id
            }
        };

        let entry = self.entry(tournament_id)?;
        let events = entry.events.subscribe();
        let participants = self.add_participant(tournament_id, player)?;

        if participants >= REQUIRED_PLAYERS {
            *open = None;
        }

        Ok(JoinedTournament {
            tournament_id,
            participants,
            events,
        })
    }

    /// Add `player` to a tournament; the fourth player starts the bracket
    pub fn add_participant(&self, tournament_id: u64, player: &str) -> Result<usize, TournamentError> {
        if self.live_tournament_of(player).is_some() {
            return Err(TournamentError::AlreadyJoined(player.to_string()));
        }

        let entry = self.entry(tournament_id)?;
        let (count, record) = {
            let mut state = entry.state.lock();
            let count = state.add_participant(player)?;
            info!(tournament_id, player = %player, count, "Participant joined");
            entry.emit(None, waiting_status(&state));

            if count == REQUIRED_PLAYERS {
                self.start_bracket(&entry, &mut state)?;
            }
            (count, state.record())
        };

        self.persist(record);
        Ok(count)
    }

    fn start_bracket(
        &self,
        entry: &TournamentEntry,
        state: &mut TournamentState,
    ) -> Result<(), TournamentError> {
        let semifinals = state.seed_bracket(&mut rand::thread_rng())?;
        let tournament_id = state.id();

        for semifinal in &semifinals {
            self.launch(semifinal.clone())?;
        }

        info!(tournament_id, "Tournament started");
        entry.emit(
            None,
            ServerMsg::TournamentReady {
                tournament_id,
                bracket: state.view(),
            },
        );

        for (index, semifinal) in semifinals.iter().enumerate() {
            let players = [semifinal.player1(), semifinal.player2()];
            for (slot, player) in players.into_iter().enumerate() {
                entry.emit(
                    Some(player),
                    ServerMsg::TournamentMatch {
                        tournament_id,
                        match_type: "semifinal".to_string(),
                        match_number: index as u8 + 1,
                        session_id: semifinal.key(),
                        opponent: players[1 - slot].to_string(),
                        is_player1: slot == 0,
                        next_match: RoundType::Final.to_string(),
                        bracket_position: state.position(player).unwrap_or_default(),
                    },
                );
            }
        }
        Ok(())
    }

    fn launch(&self, session_id: SessionId) -> Result<Arc<LiveSession>, TournamentError> {
        let sink = self
            .me
            .upgrade()
            .map(|me| me as Arc<dyn MatchResultSink>);
        self.registry.launch(session_id, sink).map_err(|err| {
            error!(error = %err, "Failed to launch bracket match");
            TournamentError::from(err)
        })
    }

    /// Record the result of a bracket match and advance the tournament
    pub fn handle_match_result(
        &self,
        tournament_id: u64,
        session_key: &str,
        winner: &str,
        scores: ScorePair,
    ) -> Result<ResultEffect, TournamentError> {
        let Some(entry) = self.tournaments.get(&tournament_id).map(|e| Arc::clone(e.value())) else {
            return Err(self.missing_tournament_error(tournament_id, session_key));
        };

        let (effect, record, completed) = {
            let mut state = entry.state.lock();
            let effect = state.record_result(session_key, winner, scores)?;
            info!(
                tournament_id,
                session_id = %session_key,
                winner = %winner,
                "Bracket match resolved"
            );

            match &effect {
                ResultEffect::SemifinalDecided { .. } => {
                    entry.emit(None, final_status(&state));
                }
                ResultEffect::FinalReady { final_match, .. } => {
                    if let Err(err) = self.launch(final_match.clone()) {
                        warn!(tournament_id, error = %err, "Final could not be launched");
                    }
                    entry.emit(None, final_status(&state));
                    for player in [final_match.player1(), final_match.player2()] {
                        if let Some(msg) = final_ready(&state, player) {
                            entry.emit(Some(player), msg);
                        }
                    }
                    info!(tournament_id, "Final ready");
                }
                ResultEffect::Completed { champion } => {
                    entry.emit(
                        None,
                        ServerMsg::TournamentComplete {
                            tournament_id,
                            winner: champion.clone(),
                            bracket: state.view(),
                        },
                    );
                    info!(tournament_id, champion = %champion, "Tournament completed");
                }
            }

            let completed = (state.status() == TournamentStatus::Completed).then(|| state.clone());
            (effect, state.record(), completed)
        };

        if let Some(final_state) = completed {
            self.tournaments.remove(&tournament_id);
            self.history.insert(tournament_id, final_state);
        }

        self.persist(record);
        Ok(effect)
    }

    fn missing_tournament_error(&self, tournament_id: u64, session_key: &str) -> TournamentError {
        match self.history.get(&tournament_id) {
            Some(state) => match state.find_match(session_key) {
                Some(_) => TournamentError::AlreadyResolved(session_key.to_string()),
                None => TournamentError::MatchNotFound(session_key.to_string()),
            },
            None => TournamentError::NotFound(tournament_id),
        }
    }

    /// A participant's connection went away.
    ///
    /// Before the bracket is drawn the player simply leaves. Afterwards their
    /// open match is forfeited: through the live session when it is running,
    /// otherwise straight into the bracket with a 0 to N score.
    pub async fn handle_participant_disconnection(&self, tournament_id: u64, player: &str) {
        self.disconnect_participant(tournament_id, player, None).await;
    }

    /// A game socket bound to `session_key` closed. Only that match is
    /// forfeited; a later match of the same player is left alone.
    pub async fn handle_match_disconnection(
        &self,
        tournament_id: u64,
        session_key: &str,
        player: &str,
    ) {
        self.disconnect_participant(tournament_id, player, Some(session_key))
            .await;
    }

    async fn disconnect_participant(
        &self,
        tournament_id: u64,
        player: &str,
        only_match: Option<&str>,
    ) {
        let Some(entry) = self.tournaments.get(&tournament_id).map(|e| Arc::clone(e.value())) else {
            return;
        };

        let winning_score = self.registry.config().winning_score;
        let action = {
            let mut state = entry.state.lock();
            if state.status() == TournamentStatus::WaitingPlayers {
                if state.remove_participant(player) {
                    info!(tournament_id, player = %player, "Participant left before start");
                    entry.emit(None, waiting_status(&state));
                    DisconnectAction::Left(state.record())
                } else {
                    DisconnectAction::Nothing
                }
            } else {
                let open_match = state
                    .current_match_of(player)
                    .filter(|m| only_match.map_or(true, |key| m.key() == key));
                match open_match {
                    Some(open_match) => {
                        let is_player1 = open_match.player1() == player;
                        DisconnectAction::Forfeit {
                            session_key: open_match.key(),
                            opponent: open_match
                                .opponent_of(player)
                                .unwrap_or_default()
                                .to_string(),
                            scores: if is_player1 {
                                ScorePair {
                                    player1: 0,
                                    player2: winning_score,
                                }
                            } else {
                                ScorePair {
                                    player1: winning_score,
                                    player2: 0,
                                }
                            },
                        }
                    }
                    None => DisconnectAction::Nothing,
                }
            }
        };

        match action {
            DisconnectAction::Nothing => {}
            DisconnectAction::Left(record) => self.persist(record),
            DisconnectAction::Forfeit {
                session_key,
                opponent,
                scores,
            } => {
                if self.registry.get(&session_key).is_some() {
                    // The session reports its own result when it concludes
                    self.registry.disconnect(&session_key, player).await;
                    return;
                }

                info!(tournament_id, session_id = %session_key, player = %player, "Forfeiting match that is not running");
                if let Err(err) =
                    self.handle_match_result(tournament_id, &session_key, &opponent, scores)
                {
                    warn!(tournament_id, error = %err, "Forfeit was not applied");
                }
            }
        }
    }

    /// Lobby-socket leave; only possible before the bracket is drawn
    pub fn leave(&self, tournament_id: u64, player: &str) -> Result<bool, TournamentError> {
        let entry = self.entry(tournament_id)?;
        let (removed, record) = {
            let mut state = entry.state.lock();
            if state.status() != TournamentStatus::WaitingPlayers {
                return Err(TournamentError::NotAcceptingPlayers(tournament_id));
            }
            let removed = state.remove_participant(player);
            if removed {
                entry.emit(None, waiting_status(&state));
            }
            (removed, state.record())
        };
        if removed {
            info!(tournament_id, player = %player, "Participant left");
            self.persist(record);
        }
        Ok(removed)
    }

    /// Client-reported result. Only a player of the match may report it,
    /// and only once the server no longer runs that match.
    pub fn report_match_result(
        &self,
        tournament_id: u64,
        reporter: &str,
        session_key: &str,
        winner: &str,
        scores: ScorePair,
    ) -> Result<ResultEffect, TournamentError> {
        {
            let entry = self
                .tournaments
                .get(&tournament_id)
                .map(|e| Arc::clone(e.value()))
                .ok_or_else(|| self.missing_tournament_error(tournament_id, session_key))?;
            let state = entry.state.lock();
            let bracket_match = state
                .find_match(session_key)
                .ok_or_else(|| TournamentError::MatchNotFound(session_key.to_string()))?;
            if !bracket_match.involves(reporter) {
                return Err(TournamentError::NotInMatch {
                    player: reporter.to_string(),
                    session_id: session_key.to_string(),
                });
            }
        }

        if self.registry.get(session_key).is_some() {
            return Err(TournamentError::MatchStillLive(session_key.to_string()));
        }

        self.handle_match_result(tournament_id, session_key, winner, scores)
    }

    /// Check that `player` may bind to bracket match `session_key` of `round`
    pub fn validate_match(
        &self,
        tournament_id: u64,
        round: RoundType,
        session_key: &str,
        player: &str,
    ) -> Result<(), TournamentError> {
        let entry = self.entry(tournament_id)?;
        let state = entry.state.lock();
        let bracket_match = state
            .find_match(session_key)
            .filter(|m| m.round() == Some(round))
            .ok_or_else(|| TournamentError::MatchNotFound(session_key.to_string()))?;
        if !bracket_match.involves(player) {
            return Err(TournamentError::NotInMatch {
                player: player.to_string(),
                session_id: session_key.to_string(),
            });
        }
        if bracket_match.is_resolved() {
            return Err(TournamentError::AlreadyResolved(session_key.to_string()));
        }
        Ok(())
    }

    /// Subscribe to a live tournament's notifications
    pub fn subscribe(&self, tournament_id: u64) -> Option<broadcast::Receiver<TournamentEvent>> {
        self.tournaments
            .get(&tournament_id)
            .map(|entry| entry.events.subscribe())
    }

    /// `final_status` for the finalist waiting room
    pub fn final_status(&self, tournament_id: u64) -> Result<ServerMsg, TournamentError> {
        self.with_state(tournament_id, final_status)
    }

    /// `final_ready` for `player`, once the final exists and they play in it
    pub fn final_ready_for(&self, tournament_id: u64, player: &str) -> Option<ServerMsg> {
        self.with_state(tournament_id, |state| final_ready(state, player))
            .ok()
            .flatten()
    }

    /// Whether `player` won a semifinal of this tournament
    pub fn is_finalist(&self, tournament_id: u64, player: &str) -> bool {
        self.with_state(tournament_id, |state| {
            state.position(player).is_some_and(|p| p >= FINALIST_POSITION)
        })
        .unwrap_or(false)
    }

    pub fn is_participant(&self, tournament_id: u64, player: &str) -> bool {
        self.with_state(tournament_id, |state| state.is_participant(player))
            .unwrap_or(false)
    }

    pub fn status(&self, tournament_id: u64) -> Option<TournamentStatus> {
        self.with_state(tournament_id, TournamentState::status).ok()
    }

    /// Bracket of a live or completed tournament
    pub fn bracket(&self, tournament_id: u64) -> Option<BracketView> {
        self.with_state(tournament_id, TournamentState::view).ok()
    }

    pub fn active_tournaments(&self) -> usize {
        self.tournaments.len()
    }

    fn with_state<T>(
        &self,
        tournament_id: u64,
        f: impl FnOnce(&TournamentState) -> T,
    ) -> Result<T, TournamentError> {
        if let Some(entry) = self.tournaments.get(&tournament_id).map(|e| Arc::clone(e.value())) {
            let state = entry.state.lock();
            return Ok(f(&state));
        }
        self.history
            .get(&tournament_id)
            .map(|state| f(&state))
            .ok_or(TournamentError::NotFound(tournament_id))
    }

    fn entry(&self, tournament_id: u64) -> Result<Arc<TournamentEntry>, TournamentError> {
        self.tournaments
            .get(&tournament_id)
            .map(|e| Arc::clone(e.value()))
            .ok_or(TournamentError::NotFound(tournament_id))
    }

    /// Live (not completed) tournament `player` takes part in
    fn live_tournament_of(&self, player: &str) -> Option<u64> {
        let entries: Vec<(u64, Arc<TournamentEntry>)> = self
            .tournaments
            .iter()
            .map(|e| (*e.key(), Arc::clone(e.value())))
            .collect();
        entries.into_iter().find_map(|(id, entry)| {
            let state = entry.state.lock();
            (state.status() != TournamentStatus::Completed && state.is_participant(player))
                .then_some(id)
        })
    }

    fn persist(&self, record: TournamentRecord) {
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            if let Err(err) = store.save_tournament(&record).await {
                warn!(tournament_id = record.tournament_id, error = %err, "Failed to persist tournament");
            }
        });
    }
}

#[async_trait]
impl MatchResultSink for TournamentOrchestrator {
    async fn match_started(&self, session_id: &SessionId) {
        let Some((tournament_id, RoundType::Final)) = session_id.bracket() else {
            return;
        };
        if let Ok(entry) = self.entry(tournament_id) {
            entry.state.lock().mark_final_started();
            info!(tournament_id, "Final started");
        }
    }

    async fn match_finished(&self, result: &FinishedMatch) -> Option<BracketView> {
        let (tournament_id, _) = result.session_id.bracket()?;
        let scores = ScorePair {
            player1: result.score.0,
            player2: result.score.1,
        };

        match self.handle_match_result(tournament_id, &result.session_id.key(), &result.winner, scores) {
            Ok(_) | Err(TournamentError::AlreadyResolved(_)) => {}
            Err(err) => {
                warn!(tournament_id, error = %err, "Match result rejected by bracket");
            }
        }
        self.bracket(tournament_id)
    }
}

fn waiting_status(state: &TournamentState) -> ServerMsg {
    ServerMsg::WaitingStatus {
        tournament_id: state.id(),
        players: state.participants().to_vec(),
        total_players: state.participants().len(),
        required_players: REQUIRED_PLAYERS,
    }
}

fn final_status(state: &TournamentState) -> ServerMsg {
    let completed = state.completed_semifinals();
    ServerMsg::FinalStatus {
        tournament_id: state.id(),
        completed_semifinals: completed,
        all_semifinals_completed: completed == 2,
        finalists: state
            .finalists()
            .into_iter()
            .map(|(username, bracket_position)| FinalistView {
                username,
                bracket_position,
            })
            .collect(),
    }
}

fn final_ready(state: &TournamentState, player: &str) -> Option<ServerMsg> {
    let final_match = state.final_match()?;
    if !final_match.involves(player) {
        return None;
    }
    Some(ServerMsg::FinalReady {
        tournament_id: state.id(),
        session_id: final_match.key(),
        player1: final_match.player1().to_string(),
        player2: final_match.player2().to_string(),
        is_player1: final_match.player1() == player,
    })
}
