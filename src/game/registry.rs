//! Live sessions and the registry that owns them

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, watch, Notify};
use tracing::{info, warn};

use crate::config::GameConfig;
use crate::store::MatchStore;
use crate::tournament::BracketView;
use crate::util::time::TickClock;

use super::physics::PhysicsParams;
use super::runner::{self, FinishedMatch, MatchResultSink};
use super::session::{MatchSession, RecordHandle, SessionError};
use super::session_id::SessionId;
use super::snapshot::MatchSnapshot;
use super::PlayerId;

/// Capacity of a session's event channel
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// How a match came to be, which decides its clock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Casual,
    Tournament,
}

impl MatchKind {
    pub fn of(id: &SessionId) -> Self {
        match id.bracket() {
            Some(_) => MatchKind::Tournament,
            None => MatchKind::Casual,
        }
    }

    /// Casual matches step by the nominal tick, bracket matches by measured time
    pub fn tick_clock(self, config: &GameConfig) -> TickClock {
        match self {
            MatchKind::Casual => TickClock::fixed(config.tick_interval),
            MatchKind::Tournament => TickClock::measured(config.max_tick_delta),
        }
    }
}

/// Why a match ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Score,
    Forfeit,
}

/// Final outcome broadcast to every connection of a match
#[derive(Debug, Clone)]
pub struct MatchOutcome {
    pub result: FinishedMatch,
    pub final_state: MatchSnapshot,
    /// Bracket after this result, for tournament matches
    pub bracket: Option<BracketView>,
}

/// Events fanned out to the connections bound to a session
#[derive(Debug, Clone)]
pub enum MatchEvent {
    State(Arc<MatchSnapshot>),
    PlayerDisconnected {
        player: PlayerId,
        snapshot: Arc<MatchSnapshot>,
    },
    Ended(Arc<MatchOutcome>),
    Aborted {
        reason: String,
    },
}

/// Result of one tick, reported back to the runner
#[derive(Debug, Clone, Copy)]
pub(crate) struct TickReport {
    pub score: (u32, u32),
    pub active: bool,
}

/// Everything the conclusion needs, taken once under the session lock
pub(crate) struct FinalizationClaim {
    pub result: FinishedMatch,
    pub final_state: MatchSnapshot,
    pub record: Option<RecordHandle>,
}

struct SessionCell {
    session: MatchSession,
    finalized: bool,
    forfeited_by: Option<PlayerId>,
}

/// A match that is registered and driven by its own runner task
pub struct LiveSession {
    key: String,
    id: SessionId,
    cell: Mutex<SessionCell>,
    events: broadcast::Sender<MatchEvent>,
    start: Notify,
    started: AtomicBool,
    stop: watch::Sender<bool>,
    viewers: AtomicUsize,
    sink: Option<Arc<dyn MatchResultSink>>,
}

impl LiveSession {
    fn new(
        session: MatchSession,
        stop: watch::Sender<bool>,
        sink: Option<Arc<dyn MatchResultSink>>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let id = session.id().clone();
        Self {
            key: id.key(),
            id,
            cell: Mutex::new(SessionCell {
                session,
                finalized: false,
                forfeited_by: None,
            }),
            events,
            start: Notify::new(),
            started: AtomicBool::new(false),
            stop,
            viewers: AtomicUsize::new(0),
            sink,
        }
    }

    /// Registry key (the rendered session id)
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn is_participant(&self, player: &str) -> bool {
        self.id.player1() == player || self.id.player2() == player
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MatchEvent> {
        self.events.subscribe()
    }

    /// Register a connection. The first one starts the runner.
    pub fn bind(self: &Arc<Self>, player: &str) -> ViewerGuard {
        let viewers = self.viewers.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.started.swap(true, Ordering::SeqCst) {
            info!(session_id = %self.key, player = %player, "First viewer bound, starting match");
            self.start.notify_one();
        }
        info!(session_id = %self.key, player = %player, viewers, "Viewer bound");

        ViewerGuard {
            live: Arc::clone(self),
            player: player.to_string(),
        }
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn viewer_count(&self) -> usize {
        self.viewers.load(Ordering::SeqCst)
    }

    /// Move a paddle. Returns false for non-participants or finished matches.
    pub fn move_player(&self, player: &str, x: f32) -> bool {
        let mut cell = self.cell.lock();
        if cell.finalized {
            return false;
        }
        cell.session.move_player(player, x)
    }

    /// Canonical snapshot
    pub fn snapshot(&self) -> MatchSnapshot {
        self.cell.lock().session.snapshot()
    }

    pub fn state_for(&self, player: &str) -> MatchSnapshot {
        self.cell.lock().session.state_for(player)
    }

    pub fn is_active(&self) -> bool {
        let cell = self.cell.lock();
        !cell.finalized && cell.session.is_active()
    }

    /// Forfeit on behalf of `player` and tell the other connections.
    ///
    /// Returns false when the match already ended or `player` is not in it.
    pub(crate) fn forfeit(&self, player: &str) -> bool {
        let mut cell = self.cell.lock();
        if cell.finalized || !cell.session.handle_disconnection(player) {
            return false;
        }
        cell.forfeited_by = Some(player.to_string());

        let snapshot = Arc::new(cell.session.snapshot());
        let _ = self.events.send(MatchEvent::PlayerDisconnected {
            player: player.to_string(),
            snapshot,
        });
        info!(session_id = %self.key, player = %player, "Player forfeited");
        true
    }

    pub(crate) fn sink(&self) -> Option<&Arc<dyn MatchResultSink>> {
        self.sink.as_ref()
    }

    /// Take the start flag for a session nobody bound in time.
    ///
    /// Returns false when a viewer bound first, in which case the match runs.
    pub(crate) fn claim_unstarted(&self) -> bool {
        self.started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) async fn wait_started(&self, stop: &mut watch::Receiver<bool>) -> bool {
        if self.started.load(Ordering::SeqCst) {
            return true;
        }
        tokio::select! {
            _ = self.start.notified() => true,
            _ = stop.wait_for(|stopped| *stopped) => false,
        }
    }

    /// Advance one tick and broadcast the new state under the session lock
    pub(crate) fn tick(&self, dt: f32) -> Option<TickReport> {
        let mut cell = self.cell.lock();
        if cell.finalized || !cell.session.is_active() {
            return None;
        }

        let snapshot = cell.session.update(dt);
        let report = TickReport {
            score: cell.session.score(),
            active: snapshot.is_active,
        };
        let _ = self.events.send(MatchEvent::State(Arc::new(snapshot)));
        Some(report)
    }

    pub(crate) fn record(&self) -> Option<RecordHandle> {
        self.cell.lock().session.record()
    }

    pub(crate) fn set_record(&self, record: RecordHandle) {
        self.cell.lock().session.set_record(record);
    }

    /// Mark the session finalized if it ended and nobody claimed it yet
    pub(crate) fn claim_finalization(&self) -> Option<FinalizationClaim> {
        let mut cell = self.cell.lock();
        if cell.finalized || cell.session.is_active() {
            return None;
        }
        let winner = cell.session.winner()?.to_string();
        cell.finalized = true;

        let reason = if cell.forfeited_by.is_some() {
            EndReason::Forfeit
        } else {
            EndReason::Score
        };

        Some(FinalizationClaim {
            result: FinishedMatch {
                session_id: self.id.clone(),
                winner,
                score: cell.session.score(),
                reason,
                forfeited_by: cell.forfeited_by.clone(),
            },
            final_state: cell.session.snapshot(),
            record: cell.session.record(),
        })
    }

    pub(crate) fn publish(&self, event: MatchEvent) {
        let _ = self.events.send(event);
    }

    /// Finalize without a result after the runner failed
    pub(crate) fn abort(&self, reason: &str) {
        {
            let mut cell = self.cell.lock();
            if cell.finalized {
                return;
            }
            cell.finalized = true;
        }
        self.request_stop();
        let _ = self.events.send(MatchEvent::Aborted {
            reason: reason.to_string(),
        });
    }

    pub(crate) fn request_stop(&self) {
        let _ = self.stop.send(true);
    }
}

/// Keeps a connection registered as a viewer until dropped
pub struct ViewerGuard {
    live: Arc<LiveSession>,
    player: PlayerId,
}

impl ViewerGuard {
    pub fn session(&self) -> &Arc<LiveSession> {
        &self.live
    }
}

impl Drop for ViewerGuard {
    fn drop(&mut self) {
        let remaining = self.live.viewers.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        info!(
            session_id = %self.live.key,
            player = %self.player,
            remaining,
            "Viewer released"
        );
    }
}

/// Registry of all live sessions
pub struct MatchRegistry {
    sessions: DashMap<String, Arc<LiveSession>>,
    store: Arc<dyn MatchStore>,
    config: GameConfig,
    me: Weak<MatchRegistry>,
}

impl MatchRegistry {
    pub fn new(store: Arc<dyn MatchStore>, config: GameConfig) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            sessions: DashMap::new(),
            store,
            config,
            me: me.clone(),
        })
    }

    pub fn config(&self) -> &GameConfig {
        &self.config
    }

    /// Register a new session and spawn its runner, parked until the first viewer binds
    pub fn launch(
        &self,
        id: SessionId,
        sink: Option<Arc<dyn MatchResultSink>>,
    ) -> Result<Arc<LiveSession>, SessionError> {
        let params = PhysicsParams {
            ball_speed: self.config.ball_speed,
            winning_score: self.config.winning_score,
        };
        let kind = MatchKind::of(&id);
        let session = MatchSession::new(id, params, rand::random())?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let live = Arc::new(LiveSession::new(session, stop_tx, sink));

        match self.sessions.entry(live.key.clone()) {
            Entry::Occupied(_) => return Err(SessionError::Duplicate(live.key.clone())),
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&live));
            }
        }

        runner::spawn(
            self.me.clone(),
            Arc::clone(&live),
            Arc::clone(&self.store),
            kind.tick_clock(&self.config),
            self.config.tick_interval,
            self.config.persist_interval,
            self.config.start_timeout,
            stop_rx,
        );

        info!(session_id = %live.key, kind = ?kind, "Session launched");
        Ok(live)
    }

    pub fn get(&self, key: &str) -> Option<Arc<LiveSession>> {
        self.sessions.get(key).map(|s| Arc::clone(s.value()))
    }

    pub fn remove(&self, key: &str) -> Option<Arc<LiveSession>> {
        let removed = self.sessions.remove(key).map(|(_, s)| s);
        if let Some(live) = &removed {
            live.request_stop();
            info!(session_id = %key, "Session evicted");
        }
        removed
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Forfeit `player`'s match and conclude it.
    ///
    /// The conclusion runs in its own task so that a dropped caller cannot
    /// leave the final persist half done. Returns true if a forfeit happened.
    pub async fn disconnect(&self, key: &str, player: &str) -> bool {
        let Some(live) = self.get(key) else {
            return false;
        };
        if !live.forfeit(player) {
            return false;
        }

        let task = tokio::spawn(runner::conclude(
            self.me.clone(),
            live,
            Arc::clone(&self.store),
        ));
        if let Err(err) = task.await {
            warn!(session_id = %key, error = %err, "Conclusion task failed");
        }
        true
    }
}
