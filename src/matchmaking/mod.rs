//! Casual matchmaking

pub mod queue;
pub mod service;

pub use service::{JoinOutcome, MatchmakingLobby};
