//! Authoritative tick loop of a live session

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::watch;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::store::MatchStore;
use crate::tournament::BracketView;
use crate::util::time::{Throttle, TickClock};

use super::registry::{EndReason, FinalizationClaim, LiveSession, MatchEvent, MatchOutcome, MatchRegistry};
use super::session::RecordHandle;
use super::session_id::SessionId;
use super::PlayerId;

/// Result of a match that ended with a winner
#[derive(Debug, Clone, PartialEq)]
pub struct FinishedMatch {
    pub session_id: SessionId,
    pub winner: PlayerId,
    /// Final score as (player1, player2)
    pub score: (u32, u32),
    pub reason: EndReason,
    pub forfeited_by: Option<PlayerId>,
}

/// Receives the lifecycle of the matches it launched
#[async_trait]
pub trait MatchResultSink: Send + Sync {
    async fn match_started(&self, _session_id: &SessionId) {}

    /// Called once per match, before `game_end` goes out. The returned
    /// bracket is attached to `game_end`.
    async fn match_finished(&self, result: &FinishedMatch) -> Option<BracketView>;
}

struct MatchRunner {
    registry: Weak<MatchRegistry>,
    live: Arc<LiveSession>,
    store: Arc<dyn MatchStore>,
    clock: TickClock,
    tick_interval: Duration,
    persist: Throttle,
    persisted_score: (u32, u32),
    start_timeout: Duration,
    stop: watch::Receiver<bool>,
}

/// Spawn the runner of `live` together with a supervisor that aborts the
/// match if the loop panics
pub(crate) fn spawn(
    registry: Weak<MatchRegistry>,
    live: Arc<LiveSession>,
    store: Arc<dyn MatchStore>,
    clock: TickClock,
    tick_interval: Duration,
    persist_interval: Duration,
    start_timeout: Duration,
    stop: watch::Receiver<bool>,
) {
    let runner = MatchRunner {
        registry: registry.clone(),
        live: Arc::clone(&live),
        store,
        clock,
        tick_interval,
        persist: Throttle::new(persist_interval),
        persisted_score: (0, 0),
        start_timeout,
        stop,
    };

    let task = tokio::spawn(runner.run());
    tokio::spawn(async move {
        if let Err(err) = task.await {
            if err.is_panic() {
                error!(session_id = %live.key(), "Match loop panicked, aborting match");
                live.abort("Match aborted after an internal error");
                if let Some(registry) = registry.upgrade() {
                    registry.remove(live.key());
                }
            }
        }
    });
}

impl MatchRunner {
    async fn run(mut self) {
        let start_timeout = self.start_timeout;
        match timeout(start_timeout, self.live.wait_started(&mut self.stop)).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(session_id = %self.live.key(), "Session stopped before it started");
                return;
            }
            Err(_) if self.live.claim_unstarted() => {
                self.abandon().await;
                return;
            }
            // A viewer bound as the deadline passed
            Err(_) => {}
        }

        if let Some(sink) = self.live.sink() {
            sink.match_started(self.live.id()).await;
        }
        self.ensure_record().await;

        info!(session_id = %self.live.key(), "Match loop started");

        let mut ticker = interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        self.clock.reset();

        loop {
            tokio::select! {
                biased;
                _ = self.stop.wait_for(|stopped| *stopped) => {
                    debug!(session_id = %self.live.key(), "Match loop stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }

            let dt = self.clock.next_delta();
            let Some(report) = self.live.tick(dt) else {
                // Ended outside the loop; the forfeiting side concludes
                return;
            };

            if report.active && report.score != self.persisted_score && self.persist.ready() {
                self.checkpoint(report.score).await;
            }

            if !report.active {
                break;
            }
        }

        conclude(self.registry.clone(), Arc::clone(&self.live), Arc::clone(&self.store)).await;
    }

    /// Nobody connected before the start deadline. Casual matches are
    /// dropped. Bracket matches are forfeited by player2 so the tournament
    /// can advance.
    async fn abandon(&self) {
        let id = self.live.id();
        if id.bracket().is_none() {
            warn!(session_id = %self.live.key(), "No player connected in time, dropping match");
            self.live.abort("Match expired before any player connected");
            if let Some(registry) = self.registry.upgrade() {
                registry.remove(self.live.key());
            }
            return;
        }

        warn!(
            session_id = %self.live.key(),
            player = %id.player2(),
            "No player connected in time, forfeiting bracket match"
        );
        if self.live.forfeit(id.player2()) {
            conclude(self.registry.clone(), Arc::clone(&self.live), Arc::clone(&self.store)).await;
        }
    }

    async fn ensure_record(&self) -> Option<RecordHandle> {
        ensure_record(&*self.store, &self.live).await
    }

    async fn checkpoint(&mut self, score: (u32, u32)) {
        let Some(record) = self.ensure_record().await else {
            return;
        };
        match self.store.update_score(record, score.0, score.1).await {
            Ok(()) => self.persisted_score = score,
            Err(err) => {
                warn!(session_id = %self.live.key(), error = %err, "Score checkpoint failed, skipping");
            }
        }
    }
}

async fn ensure_record(store: &dyn MatchStore, live: &LiveSession) -> Option<RecordHandle> {
    if let Some(record) = live.record() {
        return Some(record);
    }

    let id = live.id();
    match store
        .create_or_get_match_record(live.key(), id.player1(), id.player2())
        .await
    {
        Ok(record) => {
            live.set_record(record);
            Some(record)
        }
        Err(err) => {
            warn!(session_id = %live.key(), error = %err, "Failed to create match record");
            None
        }
    }
}

/// Finish an ended match exactly once: persist the result, notify the sink,
/// broadcast `game_end` and evict the session.
pub(crate) async fn conclude(
    registry: Weak<MatchRegistry>,
    live: Arc<LiveSession>,
    store: Arc<dyn MatchStore>,
) {
    let Some(FinalizationClaim {
        result,
        final_state,
        record,
    }) = live.claim_finalization()
    else {
        return;
    };
    live.request_stop();

    persist_result(&*store, &live, &result, record).await;

    let bracket = match live.sink() {
        Some(sink) => sink.match_finished(&result).await,
        None => None,
    };

    info!(
        session_id = %live.key(),
        winner = %result.winner,
        score = ?result.score,
        reason = ?result.reason,
        "Match finished"
    );

    live.publish(MatchEvent::Ended(Arc::new(MatchOutcome {
        result,
        final_state,
        bracket,
    })));

    if let Some(registry) = registry.upgrade() {
        registry.remove(live.key());
    }
}

async fn persist_result(
    store: &dyn MatchStore,
    live: &LiveSession,
    result: &FinishedMatch,
    record: Option<RecordHandle>,
) {
    let record = match record {
        Some(record) => record,
        None => match ensure_record(store, live).await {
            Some(record) => record,
            None => return,
        },
    };

    if let Err(err) = store.update_score(record, result.score.0, result.score.1).await {
        warn!(session_id = %live.key(), error = %err, "Failed to persist final score");
    }
    if let Err(err) = store
        .finalize_match(record, Some(&result.winner), Utc::now())
        .await
    {
        warn!(session_id = %live.key(), error = %err, "Failed to persist match result");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GameConfig;
    use crate::game::physics::PADDLE_LIMIT;
    use crate::store::MemoryStore;
    use parking_lot::Mutex;
    use tokio::sync::broadcast::error::RecvError;

    fn fast_config(winning_score: u32) -> GameConfig {
        GameConfig {
            winning_score,
            ball_speed: 1000.0,
            ..GameConfig::default()
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        started: Mutex<Vec<String>>,
        finished: Mutex<Vec<FinishedMatch>>,
    }

    #[async_trait]
    impl MatchResultSink for RecordingSink {
        async fn match_started(&self, session_id: &SessionId) {
            self.started.lock().push(session_id.key());
        }

        async fn match_finished(&self, result: &FinishedMatch) -> Option<BracketView> {
            self.finished.lock().push(result.clone());
            None
        }
    }

    struct PanickingSink;

    #[async_trait]
    impl MatchResultSink for PanickingSink {
        async fn match_started(&self, _session_id: &SessionId) {
            panic!("sink exploded");
        }

        async fn match_finished(&self, _result: &FinishedMatch) -> Option<BracketView> {
            None
        }
    }

    /// Both players keep their paddle on the opposite side of the ball, so
    /// every serve becomes a point. Returns the events seen up to `game_end`
    /// and the number of `game_end` events observed afterwards.
    async fn play_out(live: Arc<LiveSession>) -> (Vec<MatchEvent>, usize) {
        let mut events = live.subscribe();
        let _p1 = live.bind("alice");
        let _p2 = live.bind("bob");

        let mut seen = Vec::new();
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let MatchEvent::State(snapshot) = &event {
                        let dodge = if snapshot.ball.position.x > 0.0 {
                            -PADDLE_LIMIT
                        } else {
                            PADDLE_LIMIT
                        };
                        live.move_player("alice", dodge);
                        live.move_player("bob", dodge);
                    }
                    let ended = matches!(event, MatchEvent::Ended(_));
                    seen.push(event);
                    if ended {
                        break;
                    }
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }

        let mut extra_ends = 0;
        while let Ok(Ok(event)) =
            tokio::time::timeout(Duration::from_millis(500), events.recv()).await
        {
            if matches!(event, MatchEvent::Ended(_)) {
                extra_ends += 1;
            }
        }
        (seen, extra_ends)
    }

    #[tokio::test(start_paused = true)]
    async fn match_to_three_ends_once_with_persisted_result() {
        let store = Arc::new(MemoryStore::new());
        let registry = MatchRegistry::new(store.clone(), fast_config(3));
        let sink = Arc::new(RecordingSink::default());
        let live = registry
            .launch(SessionId::casual("alice", "bob"), Some(sink.clone()))
            .unwrap();
        let key = live.key().to_string();

        let (seen, extra_ends) = play_out(Arc::clone(&live)).await;
        assert_eq!(extra_ends, 0);

        let Some(MatchEvent::Ended(outcome)) = seen.last() else {
            panic!("last event should be game_end");
        };
        let (s1, s2) = outcome.result.score;
        assert_eq!(s1.max(s2), 3);
        assert!(s1.min(s2) < 3);
        assert_eq!(outcome.result.reason, EndReason::Score);
        let expected_winner = if s1 == 3 { "alice" } else { "bob" };
        assert_eq!(outcome.result.winner, expected_winner);

        // Every state before game_end is active except the last one
        let states: Vec<_> = seen
            .iter()
            .filter_map(|e| match e {
                MatchEvent::State(s) => Some(s.clone()),
                _ => None,
            })
            .collect();
        assert!(!states.last().unwrap().is_active);
        assert!(states[..states.len() - 1].iter().all(|s| s.is_active));

        let game = store.game(&key).unwrap();
        assert_eq!(game.score, (s1, s2));
        assert_eq!(game.winner.as_deref(), Some(expected_winner));
        assert_eq!(game.finalize_count, 1);
        assert!(game.ended_at.is_some());

        assert_eq!(sink.started.lock().as_slice(), &[key.clone()]);
        assert_eq!(sink.finished.lock().len(), 1);
        assert!(registry.get(&key).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn checkpoints_are_throttled_and_monotonic() {
        let store = Arc::new(MemoryStore::new());
        let registry = MatchRegistry::new(store.clone(), fast_config(5));
        let live = registry
            .launch(SessionId::casual("alice", "bob"), None)
            .unwrap();
        let key = live.key().to_string();

        play_out(live).await;

        let game = store.game(&key).unwrap();
        assert!(!game.checkpoints.is_empty());
        for pair in game.checkpoints.windows(2) {
            assert!(pair[1].0 >= pair[0].0 && pair[1].1 >= pair[0].1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn store_outage_does_not_stop_the_match() {
        let store = Arc::new(MemoryStore::new());
        store.set_failing(true);
        let registry = MatchRegistry::new(store.clone(), fast_config(2));
        let live = registry
            .launch(SessionId::casual("alice", "bob"), None)
            .unwrap();

        let (seen, _) = play_out(live).await;
        assert!(matches!(seen.last(), Some(MatchEvent::Ended(_))));
        assert!(store.games().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn runner_does_not_tick_before_first_bind() {
        let store = Arc::new(MemoryStore::new());
        let registry = MatchRegistry::new(store, fast_config(3));
        let live = registry
            .launch(SessionId::casual("alice", "bob"), None)
            .unwrap();
        let mut events = live.subscribe();

        let idle = tokio::time::timeout(Duration::from_secs(5), events.recv()).await;
        assert!(idle.is_err());

        let _guard = live.bind("alice");
        let first = tokio::time::timeout(Duration::from_secs(1), events.recv()).await;
        assert!(matches!(first, Ok(Ok(MatchEvent::State(_)))));
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_loop_aborts_only_its_match() {
        let store = Arc::new(MemoryStore::new());
        let registry = MatchRegistry::new(store, fast_config(3));
        let broken = registry
            .launch(SessionId::casual("alice", "bob"), Some(Arc::new(PanickingSink)))
            .unwrap();
        let healthy = registry
            .launch(SessionId::casual("carol", "dave"), None)
            .unwrap();

        let mut broken_events = broken.subscribe();
        let _guard = broken.bind("alice");

        let event = tokio::time::timeout(Duration::from_secs(1), broken_events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, MatchEvent::Aborted { .. }));

        // Give the supervisor a chance to evict
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(registry.get(broken.key()).is_none());
        assert!(registry.get(healthy.key()).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn unstarted_casual_match_expires() {
        let store = Arc::new(MemoryStore::new());
        let registry = MatchRegistry::new(store.clone(), fast_config(3));
        let live = registry
            .launch(SessionId::casual("alice", "bob"), None)
            .unwrap();
        let mut events = live.subscribe();

        tokio::time::sleep(Duration::from_secs(24 * 60 * 60)).await;

        assert_eq!(registry.active_sessions(), 0);
        assert!(!live.is_active());
        assert!(matches!(events.try_recv(), Ok(MatchEvent::Aborted { .. })));
        assert!(store.games().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unstarted_bracket_match_is_forfeited_by_player2() {
        let store = Arc::new(MemoryStore::new());
        let registry = MatchRegistry::new(store.clone(), fast_config(3));
        let sink = Arc::new(RecordingSink::default());
        let live = registry
            .launch(
                SessionId::tournament(1, crate::game::RoundType::Semi1, "alice", "bob"),
                Some(sink.clone()),
            )
            .unwrap();
        let key = live.key().to_string();

        tokio::time::sleep(GameConfig::default().start_timeout + Duration::from_secs(1)).await;

        assert!(registry.get(&key).is_none());
        let finished = sink.finished.lock().clone();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].winner, "alice");
        assert_eq!(finished[0].score, (3, 0));
        assert_eq!(finished[0].reason, EndReason::Forfeit);
        assert_eq!(finished[0].forfeited_by.as_deref(), Some("bob"));
        assert!(sink.started.lock().is_empty());
        assert_eq!(store.game(&key).unwrap().finalize_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn bound_match_outlives_the_start_deadline() {
        let config = GameConfig {
            winning_score: 1000,
            ..GameConfig::default()
        };
        let registry = MatchRegistry::new(Arc::new(MemoryStore::new()), config);
        let live = registry
            .launch(SessionId::casual("alice", "bob"), None)
            .unwrap();
        let _guard = live.bind("alice");

        tokio::time::sleep(GameConfig::default().start_timeout + Duration::from_secs(1)).await;
        assert!(registry.get(live.key()).is_some());
    }
}
