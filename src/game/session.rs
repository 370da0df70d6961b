//! One Pong match between two players

use super::physics::{PhysicsEngine, PhysicsParams, Side};
use super::session_id::SessionId;
use super::snapshot::MatchSnapshot;
use super::PlayerId;

/// Session-level errors
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("A match needs two distinct players, got {0} twice")]
    SamePlayer(PlayerId),

    #[error("Session {0} not found")]
    NotFound(String),

    #[error("Session {0} is already running")]
    Duplicate(String),

    #[error("Player {player} is not part of session {session}")]
    NotParticipant { session: String, player: PlayerId },
}

/// Opaque handle of the persisted match record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordHandle(pub i64);

/// Authoritative state of one match
#[derive(Debug)]
pub struct MatchSession {
    id: SessionId,
    engine: PhysicsEngine,
    record: Option<RecordHandle>,
}

impl MatchSession {
    pub fn new(id: SessionId, params: PhysicsParams, seed: u64) -> Result<Self, SessionError> {
        if id.player1() == id.player2() {
            return Err(SessionError::SamePlayer(id.player1().to_string()));
        }

        Ok(Self {
            id,
            engine: PhysicsEngine::new(params, seed),
            record: None,
        })
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn player1(&self) -> &str {
        self.id.player1()
    }

    pub fn player2(&self) -> &str {
        self.id.player2()
    }

    pub fn is_participant(&self, player: &str) -> bool {
        self.side_of(player).is_some()
    }

    /// Opponent of `player`, if `player` is in this match
    pub fn opponent_of(&self, player: &str) -> Option<&str> {
        self.side_of(player).map(|side| self.player_at(side.opponent()))
    }

    pub fn is_active(&self) -> bool {
        self.engine.is_active()
    }

    pub fn engine(&self) -> &PhysicsEngine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut PhysicsEngine {
        &mut self.engine
    }

    pub fn record(&self) -> Option<RecordHandle> {
        self.record
    }

    pub fn set_record(&mut self, record: RecordHandle) {
        self.record = Some(record);
    }

    /// Score as (player1, player2)
    pub fn score(&self) -> (u32, u32) {
        (self.engine.score(Side::Near), self.engine.score(Side::Far))
    }

    /// Advance the match and return the new canonical snapshot
    pub fn update(&mut self, dt: f32) -> MatchSnapshot {
        self.engine.update(dt);
        self.snapshot()
    }

    /// Move `player`'s paddle. Returns false for non-participants.
    pub fn move_player(&mut self, player: &str, x: f32) -> bool {
        match self.side_of(player) {
            Some(side) => {
                self.engine.move_paddle(side, x);
                true
            }
            None => false,
        }
    }

    /// Forfeit the match on behalf of a disconnecting player.
    ///
    /// The leaver ends on 0 and the opponent on the winning score. Returns
    /// false when the match already ended or `player` is not in it.
    pub fn handle_disconnection(&mut self, player: &str) -> bool {
        if !self.engine.is_active() {
            return false;
        }
        match self.side_of(player) {
            Some(side) => {
                self.engine.forfeit(side);
                true
            }
            None => false,
        }
    }

    /// Player holding the winning score, if the match is over
    pub fn winner(&self) -> Option<&str> {
        self.engine.winner().map(|side| self.player_at(side))
    }

    pub fn snapshot(&self) -> MatchSnapshot {
        MatchSnapshot::build(self.player1(), self.player2(), self.engine.state())
    }

    /// Snapshot from `player`'s point of view
    pub fn state_for(&self, player: &str) -> MatchSnapshot {
        self.snapshot().for_viewer(player)
    }

    fn side_of(&self, player: &str) -> Option<Side> {
        if player == self.player1() {
            Some(Side::Near)
        } else if player == self.player2() {
            Some(Side::Far)
        } else {
            None
        }
    }

    fn player_at(&self, side: Side) -> &str {
        match side {
            Side::Near => self.player1(),
            Side::Far => self.player2(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::physics::{Ball, Vec2};

    fn session(winning_score: u32) -> MatchSession {
        MatchSession::new(
            SessionId::casual("alice", "bob"),
            PhysicsParams {
                ball_speed: 150.0,
                winning_score,
            },
            11,
        )
        .unwrap()
    }

    fn score_for_player1(session: &mut MatchSession) {
        session.move_player("bob", 500.0);
        session.engine_mut().set_ball(Ball {
            position: Vec2::new(0.0, -1600.0),
            velocity: Vec2::new(0.0, -150.0),
        });
        session.update(0.0);
    }

    #[test]
    fn rejects_identical_players() {
        let result = MatchSession::new(
            SessionId::casual("alice", "alice"),
            PhysicsParams {
                ball_speed: 150.0,
                winning_score: 3,
            },
            1,
        );
        assert!(matches!(result, Err(SessionError::SamePlayer(_))));
    }

    #[test]
    fn move_is_noop_for_strangers() {
        let mut session = session(3);
        assert!(!session.move_player("mallory", 100.0));
        assert!(session.move_player("alice", 100.0));
        assert_eq!(session.snapshot().players["alice"].x, 100.0);
        assert_eq!(session.snapshot().players["bob"].x, 0.0);
    }

    #[test]
    fn winning_by_score_ends_the_match() {
        let mut session = session(3);
        for _ in 0..3 {
            assert_eq!(session.winner(), None);
            score_for_player1(&mut session);
        }
        assert!(!session.is_active());
        assert_eq!(session.winner(), Some("alice"));
        assert_eq!(session.score(), (3, 0));
    }

    #[test]
    fn disconnection_forfeits_regardless_of_score() {
        let mut session = session(15);
        for _ in 0..7 {
            score_for_player1(&mut session);
        }
        assert!(session.handle_disconnection("alice"));
        assert_eq!(session.score(), (0, 15));
        assert!(!session.is_active());
        assert_eq!(session.winner(), Some("bob"));
    }

    #[test]
    fn disconnection_after_the_end_changes_nothing() {
        let mut session = session(1);
        score_for_player1(&mut session);
        assert!(!session.handle_disconnection("alice"));
        assert_eq!(session.winner(), Some("alice"));
    }

    #[test]
    fn disconnection_by_stranger_is_ignored() {
        let mut session = session(3);
        assert!(!session.handle_disconnection("mallory"));
        assert!(session.is_active());
    }

    #[test]
    fn winner_is_consistent_with_activity() {
        let mut session = session(2);
        for _ in 0..500 {
            session.update(0.033);
            assert_eq!(session.is_active(), session.winner().is_none());
        }
    }

    #[test]
    fn state_for_player2_is_mirrored() {
        let session = session(3);
        let canonical = session.snapshot();
        let view = session.state_for("bob");
        assert_eq!(view.ball.velocity.z, -canonical.ball.velocity.z);
        assert_eq!(session.opponent_of("bob"), Some("alice"));
    }
}
