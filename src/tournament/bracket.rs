//! Four-player single-elimination bracket
//!
//! Pure state: no I/O, no locking. The orchestrator owns one of these per
//! tournament behind a mutex and turns the returned effects into sessions
//! and notifications.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::game::{PlayerId, RoundType, SessionId};
use crate::store::TournamentRecord;

use super::TournamentError;

/// Players needed to start a tournament
pub const REQUIRED_PLAYERS: usize = 4;
/// Bracket position of a semifinal winner
pub const FINALIST_POSITION: u8 = 5;
/// Bracket position of the champion
pub const CHAMPION_POSITION: u8 = 6;

/// Tournament lifecycle. Ordered: a tournament only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TournamentStatus {
    WaitingPlayers,
    InProgress,
    FinalReady,
    Completed,
}

impl TournamentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TournamentStatus::WaitingPlayers => "WAITING_PLAYERS",
            TournamentStatus::InProgress => "IN_PROGRESS",
            TournamentStatus::FinalReady => "FINAL_READY",
            TournamentStatus::Completed => "COMPLETED",
        }
    }
}

/// Score of a bracket match as (player1, player2)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScorePair {
    pub player1: u32,
    pub player2: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchResult {
    pub winner: PlayerId,
    pub scores: ScorePair,
}

/// One match of the bracket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BracketMatch {
    pub session_id: SessionId,
    pub result: Option<MatchResult>,
}

impl BracketMatch {
    fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            result: None,
        }
    }

    pub fn key(&self) -> String {
        self.session_id.key()
    }

    pub fn round(&self) -> Option<RoundType> {
        self.session_id.bracket().map(|(_, round)| round)
    }

    pub fn player1(&self) -> &str {
        self.session_id.player1()
    }

    pub fn player2(&self) -> &str {
        self.session_id.player2()
    }

    pub fn involves(&self, player: &str) -> bool {
        self.player1() == player || self.player2() == player
    }

    pub fn opponent_of(&self, player: &str) -> Option<&str> {
        if self.player1() == player {
            Some(self.player2())
        } else if self.player2() == player {
            Some(self.player1())
        } else {
            None
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.result.is_some()
    }

    fn view(&self) -> MatchView {
        MatchView {
            session_id: self.key(),
            round: self.round(),
            player1: self.player1().to_string(),
            player2: self.player2().to_string(),
            winner: self.result.as_ref().map(|r| r.winner.clone()),
            scores: self.result.as_ref().map(|r| r.scores),
        }
    }
}

/// What recording a result changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultEffect {
    /// A semifinal finished, the other one is still open
    SemifinalDecided { winner: PlayerId },
    /// Both semifinals finished and the final was created
    FinalReady { winner: PlayerId, final_match: SessionId },
    /// The final finished
    Completed { champion: PlayerId },
}

/// In-memory state of one tournament
#[derive(Debug, Clone)]
pub struct TournamentState {
    id: u64,
    status: TournamentStatus,
    participants: Vec<PlayerId>,
    positions: BTreeMap<PlayerId, u8>,
    semifinals: Vec<BracketMatch>,
    final_match: Option<BracketMatch>,
    winner: Option<PlayerId>,
    final_started: bool,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl TournamentState {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            status: TournamentStatus::WaitingPlayers,
            participants: Vec::with_capacity(REQUIRED_PLAYERS),
            positions: BTreeMap::new(),
            semifinals: Vec::with_capacity(2),
            final_match: None,
            winner: None,
            final_started: false,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn status(&self) -> TournamentStatus {
        self.status
    }

    pub fn participants(&self) -> &[PlayerId] {
        &self.participants
    }

    pub fn is_participant(&self, player: &str) -> bool {
        self.participants.iter().any(|p| p == player)
    }

    pub fn position(&self, player: &str) -> Option<u8> {
        self.positions.get(player).copied()
    }

    pub fn semifinals(&self) -> &[BracketMatch] {
        &self.semifinals
    }

    pub fn final_match(&self) -> Option<&BracketMatch> {
        self.final_match.as_ref()
    }

    pub fn winner(&self) -> Option<&str> {
        self.winner.as_deref()
    }

    pub fn final_started(&self) -> bool {
        self.final_started
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn is_full(&self) -> bool {
        self.participants.len() >= REQUIRED_PLAYERS
    }

    /// Append a participant while the tournament is still gathering players
    pub fn add_participant(&mut self, player: &str) -> Result<usize, TournamentError> {
        if self.status != TournamentStatus::WaitingPlayers {
            return Err(TournamentError::NotAcceptingPlayers(self.id));
        }
        if self.is_participant(player) {
            return Err(TournamentError::AlreadyJoined(player.to_string()));
        }
        if self.is_full() {
            return Err(TournamentError::Full(self.id));
        }
        self.participants.push(player.to_string());
        Ok(self.participants.len())
    }

    /// Remove a participant; only possible before the bracket is drawn
    pub fn remove_participant(&mut self, player: &str) -> bool {
        if self.status != TournamentStatus::WaitingPlayers {
            return false;
        }
        let before = self.participants.len();
        self.participants.retain(|p| p != player);
        self.participants.len() != before
    }

    /// Shuffle the participants into positions 1-4 and create both semifinals.
    /// Positions (1, 2) meet in semi1, (3, 4) in semi2.
    pub fn seed_bracket<R: Rng + ?Sized>(
        &mut self,
        rng: &mut R,
    ) -> Result<[SessionId; 2], TournamentError> {
        if self.status != TournamentStatus::WaitingPlayers {
            return Err(TournamentError::NotAcceptingPlayers(self.id));
        }
        if self.participants.len() != REQUIRED_PLAYERS {
            return Err(TournamentError::NotEnoughPlayers {
                tournament_id: self.id,
                count: self.participants.len(),
            });
        }

        let mut order = self.participants.clone();
        order.shuffle(rng);

        for (index, player) in order.iter().enumerate() {
            self.positions.insert(player.clone(), index as u8 + 1);
        }

        let semi1 = SessionId::tournament(self.id, RoundType::Semi1, order[0].clone(), order[1].clone());
        let semi2 = SessionId::tournament(self.id, RoundType::Semi2, order[2].clone(), order[3].clone());
        self.semifinals = vec![BracketMatch::new(semi1.clone()), BracketMatch::new(semi2.clone())];
        self.advance(TournamentStatus::InProgress);

        Ok([semi1, semi2])
    }

    pub fn find_match(&self, session_key: &str) -> Option<&BracketMatch> {
        self.semifinals
            .iter()
            .chain(self.final_match.iter())
            .find(|m| m.key() == session_key)
    }

    /// The unresolved match `player` is currently in, if any
    pub fn current_match_of(&self, player: &str) -> Option<&BracketMatch> {
        self.semifinals
            .iter()
            .chain(self.final_match.iter())
            .find(|m| !m.is_resolved() && m.involves(player))
    }

    pub fn completed_semifinals(&self) -> usize {
        self.semifinals.iter().filter(|m| m.is_resolved()).count()
    }

    /// Players who won their semifinal, with their bracket position
    pub fn finalists(&self) -> Vec<(PlayerId, u8)> {
        self.positions
            .iter()
            .filter(|(_, position)| **position >= FINALIST_POSITION)
            .map(|(player, position)| (player.clone(), *position))
            .collect()
    }

    pub fn mark_final_started(&mut self) {
        if self.final_match.is_some() {
            self.final_started = true;
        }
    }

    /// Record the winner of a bracket match and advance the bracket.
    ///
    /// Recording a match twice is rejected with `AlreadyResolved` and leaves
    /// the state untouched.
    pub fn record_result(
        &mut self,
        session_key: &str,
        winner: &str,
        scores: ScorePair,
    ) -> Result<ResultEffect, TournamentError> {
        if !matches!(
            self.status,
            TournamentStatus::InProgress | TournamentStatus::FinalReady
        ) {
            return Err(TournamentError::NotInProgress(self.id));
        }

        let bracket_match = self
            .semifinals
            .iter_mut()
            .chain(self.final_match.iter_mut())
            .find(|m| m.key() == session_key)
            .ok_or_else(|| TournamentError::MatchNotFound(session_key.to_string()))?;

        if bracket_match.is_resolved() {
            return Err(TournamentError::AlreadyResolved(session_key.to_string()));
        }
        if !bracket_match.involves(winner) {
            return Err(TournamentError::NotInMatch {
                player: winner.to_string(),
                session_id: session_key.to_string(),
            });
        }

        bracket_match.result = Some(MatchResult {
            winner: winner.to_string(),
            scores,
        });
        let round = bracket_match.round();

        if round == Some(RoundType::Final) {
            self.positions.insert(winner.to_string(), CHAMPION_POSITION);
            self.winner = Some(winner.to_string());
            self.completed_at = Some(Utc::now());
            self.advance(TournamentStatus::Completed);
            return Ok(ResultEffect::Completed {
                champion: winner.to_string(),
            });
        }

        self.positions.insert(winner.to_string(), FINALIST_POSITION);

        if self.completed_semifinals() < self.semifinals.len() {
            return Ok(ResultEffect::SemifinalDecided {
                winner: winner.to_string(),
            });
        }

        let (Some(first), Some(second)) = (
            self.semifinal_winner(RoundType::Semi1),
            self.semifinal_winner(RoundType::Semi2),
        ) else {
            return Ok(ResultEffect::SemifinalDecided {
                winner: winner.to_string(),
            });
        };

        let final_id = SessionId::tournament(self.id, RoundType::Final, first, second);
        self.final_match = Some(BracketMatch::new(final_id.clone()));
        self.advance(TournamentStatus::FinalReady);

        Ok(ResultEffect::FinalReady {
            winner: winner.to_string(),
            final_match: final_id,
        })
    }

    fn semifinal_winner(&self, round: RoundType) -> Option<PlayerId> {
        self.semifinals
            .iter()
            .find(|m| m.round() == Some(round))
            .and_then(|m| m.result.as_ref())
            .map(|r| r.winner.clone())
    }

    fn advance(&mut self, next: TournamentStatus) {
        debug_assert!(next > self.status, "tournament status moved backwards");
        if next > self.status {
            self.status = next;
        }
    }

    pub fn view(&self) -> BracketView {
        BracketView {
            tournament_id: self.id,
            status: self.status,
            participants: self.participants.clone(),
            positions: self.positions.clone(),
            semifinals: self.semifinals.iter().map(BracketMatch::view).collect(),
            final_match: self.final_match.as_ref().map(BracketMatch::view),
            winner: self.winner.clone(),
            final_started: self.final_started,
        }
    }

    pub fn record(&self) -> TournamentRecord {
        TournamentRecord {
            tournament_id: self.id,
            status: self.status.as_str().to_string(),
            participants: self.participants.clone(),
            winner: self.winner.clone(),
            matches: self
                .semifinals
                .iter()
                .chain(self.final_match.iter())
                .map(BracketMatch::key)
                .collect(),
            completed_at: self.completed_at,
        }
    }
}

/// Serializable bracket for clients and the HTTP surface
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BracketView {
    pub tournament_id: u64,
    pub status: TournamentStatus,
    pub participants: Vec<PlayerId>,
    pub positions: BTreeMap<PlayerId, u8>,
    pub semifinals: Vec<MatchView>,
    #[serde(rename = "final")]
    pub final_match: Option<MatchView>,
    pub winner: Option<PlayerId>,
    pub final_started: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchView {
    pub session_id: String,
    pub round: Option<RoundType>,
    pub player1: PlayerId,
    pub player2: PlayerId,
    pub winner: Option<PlayerId>,
    pub scores: Option<ScorePair>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    const SCORES: ScorePair = ScorePair {
        player1: 15,
        player2: 7,
    };

    fn full_tournament() -> (TournamentState, [SessionId; 2]) {
        let mut state = TournamentState::new(1);
        for player in ["ann", "ben", "cat", "dan"] {
            state.add_participant(player).unwrap();
        }
        let semis = state.seed_bracket(&mut ChaCha8Rng::seed_from_u64(3)).unwrap();
        (state, semis)
    }

    #[test]
    fn rejects_duplicates_and_overflow() {
        let mut state = TournamentState::new(1);
        assert_eq!(state.add_participant("ann").unwrap(), 1);
        assert!(matches!(
            state.add_participant("ann"),
            Err(TournamentError::AlreadyJoined(_))
        ));
        for player in ["ben", "cat", "dan"] {
            state.add_participant(player).unwrap();
        }
        assert!(matches!(state.add_participant("eve"), Err(TournamentError::Full(1))));
    }

    #[test]
    fn seeding_assigns_positions_and_semifinals() {
        let (state, semis) = full_tournament();
        assert_eq!(state.status(), TournamentStatus::InProgress);

        let mut positions: Vec<u8> = state.participants().iter().filter_map(|p| state.position(p)).collect();
        positions.sort();
        assert_eq!(positions, vec![1, 2, 3, 4]);

        assert_eq!(state.position(semis[0].player1()), Some(1));
        assert_eq!(state.position(semis[0].player2()), Some(2));
        assert_eq!(state.position(semis[1].player1()), Some(3));
        assert_eq!(state.position(semis[1].player2()), Some(4));
        assert_eq!(semis[0].bracket(), Some((1, RoundType::Semi1)));

        // Nobody plays in both semifinals
        let all: Vec<&str> = semis.iter().flat_map(|s| [s.player1(), s.player2()]).collect();
        for player in &all {
            assert_eq!(all.iter().filter(|p| *p == player).count(), 1);
        }
    }

    #[test]
    fn cannot_seed_short_bracket_or_leave_after_start() {
        let mut state = TournamentState::new(2);
        state.add_participant("ann").unwrap();
        assert!(matches!(
            state.seed_bracket(&mut ChaCha8Rng::seed_from_u64(1)),
            Err(TournamentError::NotEnoughPlayers { count: 1, .. })
        ));

        let (mut state, _) = full_tournament();
        assert!(!state.remove_participant("ann"));
        assert_eq!(state.participants().len(), 4);
    }

    #[test]
    fn recording_twice_is_rejected_without_side_effects() {
        let (mut state, semis) = full_tournament();
        let key = semis[0].key();
        let winner = semis[0].player1().to_string();

        let effect = state.record_result(&key, &winner, SCORES).unwrap();
        assert_eq!(effect, ResultEffect::SemifinalDecided { winner: winner.clone() });

        let before = state.view();
        let loser = semis[0].player2().to_string();
        assert!(matches!(
            state.record_result(&key, &loser, SCORES),
            Err(TournamentError::AlreadyResolved(_))
        ));
        assert_eq!(state.view(), before);
    }

    #[test]
    fn winner_must_play_in_the_match() {
        let (mut state, semis) = full_tournament();
        let outsider = semis[1].player1().to_string();
        assert!(matches!(
            state.record_result(&semis[0].key(), &outsider, SCORES),
            Err(TournamentError::NotInMatch { .. })
        ));
        assert_eq!(state.completed_semifinals(), 0);
    }

    #[test]
    fn full_bracket_progression() {
        let (mut state, semis) = full_tournament();
        let w1 = semis[0].player2().to_string();
        let w2 = semis[1].player1().to_string();

        state.record_result(&semis[1].key(), &w2, SCORES).unwrap();
        let effect = state.record_result(&semis[0].key(), &w1, SCORES).unwrap();
        let ResultEffect::FinalReady { final_match, .. } = effect else {
            panic!("expected the final to be created, got {effect:?}");
        };

        assert_eq!(state.status(), TournamentStatus::FinalReady);
        // semi1's winner is player1 of the final regardless of finishing order
        assert_eq!(final_match.player1(), w1);
        assert_eq!(final_match.player2(), w2);
        assert_eq!(final_match.bracket(), Some((1, RoundType::Final)));
        assert_eq!(state.finalists().len(), 2);

        state.mark_final_started();
        assert!(state.final_started());
        assert_eq!(state.status(), TournamentStatus::FinalReady);

        let effect = state.record_result(&final_match.key(), &w2, SCORES).unwrap();
        assert_eq!(effect, ResultEffect::Completed { champion: w2.clone() });
        assert_eq!(state.status(), TournamentStatus::Completed);
        assert_eq!(state.position(&w2), Some(CHAMPION_POSITION));
        assert_eq!(state.position(&w1), Some(FINALIST_POSITION));
        assert_eq!(state.winner(), Some(w2.as_str()));

        let champions = state
            .participants()
            .iter()
            .filter(|p| state.position(p) == Some(CHAMPION_POSITION))
            .count();
        assert_eq!(champions, 1);

        assert!(matches!(
            state.record_result(&final_match.key(), &w1, SCORES),
            Err(TournamentError::NotInProgress(1))
        ));
    }

    #[test]
    fn status_serializes_screaming_case() {
        let json = serde_json::to_value(TournamentStatus::FinalReady).unwrap();
        assert_eq!(json, "FINAL_READY");
        assert!(TournamentStatus::WaitingPlayers < TournamentStatus::Completed);
    }

    #[test]
    fn record_lists_matches_in_play_order() {
        let (state, semis) = full_tournament();
        let record = state.record();
        assert_eq!(record.matches, vec![semis[0].key(), semis[1].key()]);
        assert_eq!(record.status, "IN_PROGRESS");
        assert!(record.winner.is_none());
    }
}
