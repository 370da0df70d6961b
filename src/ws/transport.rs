//! How a game socket reaches its session, and what its disconnect means

use std::fmt;
use std::sync::Arc;

use tracing::info;

use crate::game::{LiveSession, MatchKind, MatchOutcome, MatchRegistry, RoundType, SessionError};
use crate::tournament::{TournamentError, TournamentOrchestrator};

use super::protocol::NextStage;

/// Errors while binding a game socket to its session
#[derive(Debug, thiserror::Error)]
pub enum BindError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Tournament(#[from] TournamentError),

    #[error("Session {0} is not a {1} match")]
    WrongKind(String, &'static str),

    #[error("Session {0} has already finished")]
    Finished(String),
}

/// Strategy of a game socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchTransport {
    /// Session key comes from the URL
    Casual,
    /// Session key arrives with `session_init`, checked against the bracket
    Tournament { tournament_id: u64, round: RoundType },
}

impl MatchTransport {
    pub fn kind(&self) -> MatchKind {
        match self {
            MatchTransport::Casual => MatchKind::Casual,
            MatchTransport::Tournament { .. } => MatchKind::Tournament,
        }
    }

    /// Whether the socket binds right away or waits for `session_init`
    pub fn binds_on_connect(&self) -> bool {
        matches!(self, MatchTransport::Casual)
    }

    /// Look up the session behind `key` and check that `player` may bind to it
    pub fn resolve(
        &self,
        registry: &MatchRegistry,
        orchestrator: &TournamentOrchestrator,
        key: &str,
        player: &str,
    ) -> Result<Arc<LiveSession>, BindError> {
        if let MatchTransport::Tournament {
            tournament_id,
            round,
        } = *self
        {
            orchestrator.validate_match(tournament_id, round, key, player)?;
        }

        let live = registry
            .get(key)
            .ok_or_else(|| SessionError::NotFound(key.to_string()))?;

        if MatchKind::of(live.id()) != self.kind() {
            return Err(BindError::WrongKind(key.to_string(), self.label()));
        }
        if !live.is_participant(player) {
            return Err(SessionError::NotParticipant {
                session: key.to_string(),
                player: player.to_string(),
            }
            .into());
        }
        Ok(live)
    }

    /// Forfeit `player`'s match after their socket closed
    pub async fn forfeit(
        &self,
        registry: &MatchRegistry,
        orchestrator: &TournamentOrchestrator,
        key: &str,
        player: &str,
    ) {
        match *self {
            MatchTransport::Casual => {
                if registry.disconnect(key, player).await {
                    info!(session_id = %key, player = %player, "Casual match forfeited");
                }
            }
            MatchTransport::Tournament { tournament_id, .. } => {
                orchestrator
                    .handle_match_disconnection(tournament_id, key, player)
                    .await;
            }
        }
    }

    /// Where `viewer` goes once the match is over
    pub fn next_stage(&self, outcome: &MatchOutcome, viewer: &str) -> Option<NextStage> {
        let stage = match *self {
            MatchTransport::Casual => NextStage::Lobby,
            MatchTransport::Tournament { round, .. } => match round {
                RoundType::Final => NextStage::TournamentComplete,
                _ if outcome.result.winner == viewer => NextStage::WaitingFinal,
                _ => NextStage::Eliminated,
            },
        };
        Some(stage)
    }

    fn label(&self) -> &'static str {
        match self {
            MatchTransport::Casual => "casual",
            MatchTransport::Tournament { .. } => "tournament",
        }
    }
}

impl fmt::Display for MatchTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchTransport::Casual => f.write_str("casual"),
            MatchTransport::Tournament {
                tournament_id,
                round,
            } => write!(f, "tournament {tournament_id} {round}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GameConfig;
    use crate::game::physics::PhysicsParams;
    use crate::game::session::MatchSession;
    use crate::game::{EndReason, FinishedMatch, SessionId};
    use crate::store::MemoryStore;

    fn services() -> (Arc<MatchRegistry>, Arc<TournamentOrchestrator>) {
        let store = Arc::new(MemoryStore::new());
        let registry = MatchRegistry::new(store.clone(), GameConfig::default());
        let orchestrator = TournamentOrchestrator::new(registry.clone(), store);
        (registry, orchestrator)
    }

    fn outcome(id: SessionId, winner: &str) -> MatchOutcome {
        let params = PhysicsParams {
            ball_speed: 200.0,
            winning_score: 15,
        };
        let final_state = MatchSession::new(id.clone(), params, 1).unwrap().snapshot();
        MatchOutcome {
            result: FinishedMatch {
                session_id: id,
                winner: winner.to_string(),
                score: (15, 3),
                reason: EndReason::Score,
                forfeited_by: None,
            },
            final_state,
            bracket: None,
        }
    }

    #[tokio::test]
    async fn casual_transport_resolves_participants_only() {
        let (registry, orchestrator) = services();
        let live = registry.launch(SessionId::casual("alice", "bob"), None).unwrap();

        let resolved = MatchTransport::Casual
            .resolve(&registry, &orchestrator, live.key(), "bob")
            .unwrap();
        assert_eq!(resolved.key(), live.key());

        let err = MatchTransport::Casual
            .resolve(&registry, &orchestrator, live.key(), "mallory")
            .err()
            .expect("binding should be refused");
        assert!(matches!(err, BindError::Session(SessionError::NotParticipant { .. })));

        let err = MatchTransport::Casual
            .resolve(&registry, &orchestrator, "game_nobody", "bob")
            .err()
            .expect("binding should be refused");
        assert!(matches!(err, BindError::Session(SessionError::NotFound(_))));
    }

    #[tokio::test]
    async fn casual_socket_cannot_bind_bracket_match() {
        let (registry, orchestrator) = services();
        let live = registry
            .launch(SessionId::tournament(9, RoundType::Semi1, "a", "b"), None)
            .unwrap();
        let err = MatchTransport::Casual
            .resolve(&registry, &orchestrator, live.key(), "a")
            .err()
            .expect("binding should be refused");
        assert!(matches!(err, BindError::WrongKind(..)));
    }

    #[tokio::test]
    async fn tournament_transport_checks_the_bracket() {
        let (registry, orchestrator) = services();
        for player in ["p1", "p2", "p3", "p4"] {
            orchestrator.join(player).unwrap();
        }
        let bracket = orchestrator.bracket(1).unwrap();
        let semi1 = &bracket.semifinals[0];
        let transport = MatchTransport::Tournament {
            tournament_id: 1,
            round: RoundType::Semi1,
        };

        let live = transport
            .resolve(&registry, &orchestrator, &semi1.session_id, &semi1.player1)
            .unwrap();
        assert_eq!(live.key(), semi1.session_id);

        let wrong_round = MatchTransport::Tournament {
            tournament_id: 1,
            round: RoundType::Semi2,
        };
        let err = wrong_round
            .resolve(&registry, &orchestrator, &semi1.session_id, &semi1.player1)
            .err()
            .expect("binding should be refused");
        assert!(matches!(err, BindError::Tournament(TournamentError::MatchNotFound(_))));

        let outsider = &bracket.semifinals[1].player1;
        let err = transport
            .resolve(&registry, &orchestrator, &semi1.session_id, outsider)
            .err()
            .expect("binding should be refused");
        assert!(matches!(err, BindError::Tournament(TournamentError::NotInMatch { .. })));
    }

    #[test]
    fn next_stage_follows_round_and_winner() {
        let semi = SessionId::tournament(1, RoundType::Semi1, "a", "b");
        let transport = MatchTransport::Tournament {
            tournament_id: 1,
            round: RoundType::Semi1,
        };
        let done = outcome(semi, "a");
        assert_eq!(transport.next_stage(&done, "a"), Some(NextStage::WaitingFinal));
        assert_eq!(transport.next_stage(&done, "b"), Some(NextStage::Eliminated));

        let final_match = SessionId::tournament(1, RoundType::Final, "a", "c");
        let final_transport = MatchTransport::Tournament {
            tournament_id: 1,
            round: RoundType::Final,
        };
        let done = outcome(final_match, "c");
        assert_eq!(
            final_transport.next_stage(&done, "a"),
            Some(NextStage::TournamentComplete)
        );

        let casual = outcome(SessionId::casual("a", "b"), "b");
        assert_eq!(MatchTransport::Casual.next_stage(&casual, "a"), Some(NextStage::Lobby));
    }
}
