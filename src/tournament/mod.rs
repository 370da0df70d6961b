//! Four-player single-elimination tournaments

pub mod bracket;
pub mod service;

pub use bracket::{BracketView, ScorePair, TournamentStatus};
pub use service::{TournamentEvent, TournamentOrchestrator};

use crate::game::{PlayerId, SessionError};

/// Tournament errors
#[derive(Debug, thiserror::Error)]
pub enum TournamentError {
    #[error("Tournament {0} not found")]
    NotFound(u64),

    #[error("Tournament {0} is already completed")]
    AlreadyCompleted(u64),

    #[error("Already joined tournament")]
    AlreadyJoined(PlayerId),

    #[error("Tournament {0} is full")]
    Full(u64),

    #[error("Tournament {0} no longer accepts players")]
    NotAcceptingPlayers(u64),

    #[error("Tournament {tournament_id} has {count} players, 4 are required")]
    NotEnoughPlayers { tournament_id: u64, count: usize },

    #[error("Tournament {0} is not in progress")]
    NotInProgress(u64),

    #[error("Match {0} is not part of this tournament")]
    MatchNotFound(String),

    #[error("Match {0} already has a result")]
    AlreadyResolved(String),

    #[error("{player} does not play in match {session_id}")]
    NotInMatch { player: PlayerId, session_id: String },

    #[error("Match {0} is still being played")]
    MatchStillLive(String),

    #[error(transparent)]
    Session(#[from] SessionError),
}
