//! In-process store used in development and tests

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::{MatchStore, RecordHandle, StoreError, TournamentRecord};
use crate::game::PlayerId;

/// A persisted match as seen by the memory store
#[derive(Debug, Clone, PartialEq)]
pub struct GameRecord {
    pub session_id: String,
    pub player1: PlayerId,
    pub player2: PlayerId,
    pub score: (u32, u32),
    pub winner: Option<PlayerId>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Every score checkpoint, in write order
    pub checkpoints: Vec<(u32, u32)>,
    pub finalize_count: u32,
}

#[derive(Default)]
struct Inner {
    games: HashMap<i64, GameRecord>,
    by_session: HashMap<String, i64>,
    tournaments: HashMap<u64, TournamentRecord>,
}

/// Keeps every write in memory for inspection
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    next_id: AtomicI64,
    /// `None` accepts any username
    users: Option<HashSet<PlayerId>>,
    failing: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only the given usernames exist
    pub fn with_users<I, S>(users: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<PlayerId>,
    {
        Self {
            users: Some(users.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }

    /// Make every subsequent write fail (simulates an unreachable store)
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn game(&self, session_id: &str) -> Option<GameRecord> {
        let inner = self.inner.lock();
        inner
            .by_session
            .get(session_id)
            .and_then(|id| inner.games.get(id))
            .cloned()
    }

    pub fn games(&self) -> Vec<GameRecord> {
        let inner = self.inner.lock();
        let mut games: Vec<_> = inner.games.iter().collect();
        games.sort_by_key(|(id, _)| **id);
        games.into_iter().map(|(_, game)| game.clone()).collect()
    }

    pub fn tournament(&self, tournament_id: u64) -> Option<TournamentRecord> {
        self.inner.lock().tournaments.get(&tournament_id).cloned()
    }

    fn check_failing(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Api {
                status: 503,
                body: "store unavailable".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl MatchStore for MemoryStore {
    async fn create_or_get_match_record(
        &self,
        session_id: &str,
        player1: &str,
        player2: &str,
    ) -> Result<RecordHandle, StoreError> {
        self.check_failing()?;
        let mut inner = self.inner.lock();
        if let Some(id) = inner.by_session.get(session_id) {
            return Ok(RecordHandle(*id));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        inner.by_session.insert(session_id.to_string(), id);
        inner.games.insert(
            id,
            GameRecord {
                session_id: session_id.to_string(),
                player1: player1.to_string(),
                player2: player2.to_string(),
                score: (0, 0),
                winner: None,
                ended_at: None,
                checkpoints: Vec::new(),
                finalize_count: 0,
            },
        );
        Ok(RecordHandle(id))
    }

    async fn update_score(
        &self,
        record: RecordHandle,
        player1: u32,
        player2: u32,
    ) -> Result<(), StoreError> {
        self.check_failing()?;
        let mut inner = self.inner.lock();
        let game = inner
            .games
            .get_mut(&record.0)
            .ok_or(StoreError::UnknownRecord(record))?;
        game.score = (player1, player2);
        game.checkpoints.push((player1, player2));
        Ok(())
    }

    async fn finalize_match(
        &self,
        record: RecordHandle,
        winner: Option<&str>,
        ended_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.check_failing()?;
        let mut inner = self.inner.lock();
        let game = inner
            .games
            .get_mut(&record.0)
            .ok_or(StoreError::UnknownRecord(record))?;
        game.winner = winner.map(str::to_string);
        game.ended_at = Some(ended_at);
        game.finalize_count += 1;
        Ok(())
    }

    async fn user_exists(&self, username: &str) -> Result<bool, StoreError> {
        Ok(match &self.users {
            Some(users) => users.contains(username),
            None => !username.trim().is_empty(),
        })
    }

    async fn save_tournament(&self, record: &TournamentRecord) -> Result<(), StoreError> {
        self.check_failing()?;
        self.inner
            .lock()
            .tournaments
            .insert(record.tournament_id, record.clone());
        Ok(())
    }
}
