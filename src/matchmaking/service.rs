//! Matchmaking lobby - pairs waiting players into casual matches

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{info, warn};

use crate::game::{MatchRegistry, PlayerId, SessionError, SessionId};
use crate::ws::protocol::ServerMsg;

use super::queue::{Waiter, WaitingQueue};

/// What a join resulted in
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    /// Queued; the caller is notified later through its channel
    Waiting,
    /// Paired with a waiting player; the waiter already got `match_found`
    Matched {
        session_id: String,
        player1: PlayerId,
        player2: PlayerId,
    },
}

impl JoinOutcome {
    pub fn into_message(self) -> ServerMsg {
        match self {
            JoinOutcome::Waiting => ServerMsg::waiting("Waiting for opponent..."),
            JoinOutcome::Matched {
                session_id,
                player1,
                player2,
            } => ServerMsg::MatchFound {
                session_id,
                player1,
                player2,
            },
        }
    }
}

/// Casual lobby
pub struct MatchmakingLobby {
    queue: Mutex<WaitingQueue>,
    registry: Arc<MatchRegistry>,
}

impl MatchmakingLobby {
    pub fn new(registry: Arc<MatchRegistry>) -> Self {
        Self {
            queue: Mutex::new(WaitingQueue::new()),
            registry,
        }
    }

    /// Pair `player` with the oldest waiter, or queue them.
    ///
    /// Pop and pair happen under one lock, so concurrent joins can never
    /// hand the same waiter to two callers.
    pub fn join(
        &self,
        player: &str,
        notifier: mpsc::Sender<ServerMsg>,
    ) -> Result<JoinOutcome, SessionError> {
        let mut queue = self.queue.lock();

        while let Some(waiter) = queue.pop_partner(player) {
            let session_id = SessionId::casual(waiter.player.clone(), player);
            let live = match self.registry.launch(session_id, None) {
                Ok(live) => live,
                Err(err) => {
                    queue.requeue_front(waiter);
                    return Err(err);
                }
            };

            let found = ServerMsg::MatchFound {
                session_id: live.key().to_string(),
                player1: waiter.player.clone(),
                player2: player.to_string(),
            };
            match waiter.notifier.try_send(found) {
                Ok(()) => {}
                Err(TrySendError::Full(found)) => {
                    // Backlogged but still connected
                    let notifier = waiter.notifier.clone();
                    tokio::spawn(async move {
                        let _ = notifier.send(found).await;
                    });
                }
                Err(TrySendError::Closed(_)) => {
                    // The waiter vanished between the stale check and now
                    warn!(player = %waiter.player, "Waiter unreachable, discarding pairing");
                    self.registry.remove(live.key());
                    continue;
                }
            }

            info!(
                session_id = %live.key(),
                player1 = %waiter.player,
                player2 = %player,
                waited_ms = waiter.wait_time().as_millis() as u64,
                "Players paired"
            );
            return Ok(JoinOutcome::Matched {
                session_id: live.key().to_string(),
                player1: waiter.player,
                player2: player.to_string(),
            });
        }

        queue.enqueue(Waiter::new(player, notifier));
        info!(player = %player, waiting = queue.len(), "Player queued");
        Ok(JoinOutcome::Waiting)
    }

    /// Leave the queue; no-op once paired.
    ///
    /// Only the entry queued through `notifier` is removed, so a connection
    /// never cancels a newer entry the same player made from another socket.
    pub fn leave(&self, player: &str, notifier: &mpsc::Sender<ServerMsg>) -> bool {
        let removed = self.queue.lock().remove(player, notifier).is_some();
        if removed {
            info!(player = %player, "Player left matchmaking");
        }
        removed
    }

    pub fn is_waiting(&self, player: &str) -> bool {
        self.queue.lock().contains(player)
    }

    pub fn waiting_count(&self) -> usize {
        self.queue.lock().len()
    }
}
