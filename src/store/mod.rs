//! Persistence of match and tournament results
//!
//! The game server only writes results; users and history belong to the web
//! application. Every write is best effort: callers log failures and keep the
//! in-memory state authoritative.

pub mod memory;
pub mod rest;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

pub use crate::game::RecordHandle;
use crate::game::PlayerId;

pub use memory::MemoryStore;
pub use rest::{RestClient, RestStore};

/// Snapshot of a tournament as handed to the store
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TournamentRecord {
    pub tournament_id: u64,
    pub status: String,
    pub participants: Vec<PlayerId>,
    pub winner: Option<PlayerId>,
    /// Session ids of the bracket matches, in play order
    pub matches: Vec<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Result persistence used by match runners and the tournament orchestrator
#[async_trait]
pub trait MatchStore: Send + Sync {
    /// Create the record of a match, or return the existing one for `session_id`
    async fn create_or_get_match_record(
        &self,
        session_id: &str,
        player1: &str,
        player2: &str,
    ) -> Result<RecordHandle, StoreError>;

    /// Checkpoint the current score
    async fn update_score(
        &self,
        record: RecordHandle,
        player1: u32,
        player2: u32,
    ) -> Result<(), StoreError>;

    /// Record the winner and end time of a finished match
    async fn finalize_match(
        &self,
        record: RecordHandle,
        winner: Option<&str>,
        ended_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn user_exists(&self, username: &str) -> Result<bool, StoreError>;

    async fn save_tournament(&self, record: &TournamentRecord) -> Result<(), StoreError>;
}

/// Store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("API error (status {status}): {body}")]
    Api { status: u16, body: String },

    #[error("Failed to parse response: {0}")]
    Parse(reqwest::Error),

    #[error("No row returned from insert")]
    NoRowReturned,

    #[error("Unknown match record {0:?}")]
    UnknownRecord(RecordHandle),
}
