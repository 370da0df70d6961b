//! Waiting queue of the casual lobby

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::game::PlayerId;
use crate::ws::protocol::ServerMsg;

/// Player waiting for an opponent
#[derive(Debug, Clone)]
pub struct Waiter {
    pub player: PlayerId,
    /// Outbound channel of the waiting connection
    pub notifier: mpsc::Sender<ServerMsg>,
    pub queued_at: Instant,
}

impl Waiter {
    pub fn new(player: impl Into<PlayerId>, notifier: mpsc::Sender<ServerMsg>) -> Self {
        Self {
            player: player.into(),
            notifier,
            queued_at: Instant::now(),
        }
    }

    /// How long this player has been waiting
    pub fn wait_time(&self) -> Duration {
        self.queued_at.elapsed()
    }

    /// The connection behind this entry is gone
    pub fn is_stale(&self) -> bool {
        self.notifier.is_closed()
    }
}

/// FIFO of waiting players
#[derive(Debug, Default)]
pub struct WaitingQueue {
    queue: VecDeque<Waiter>,
}

impl WaitingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a player to the back of the queue
    pub fn enqueue(&mut self, waiter: Waiter) {
        // Remove if already in queue (rejoin)
        self.queue.retain(|w| w.player != waiter.player);
        self.queue.push_back(waiter);
    }

    /// Remove `player`'s entry if it was queued through `notifier`
    pub fn remove(&mut self, player: &str, notifier: &mpsc::Sender<ServerMsg>) -> Option<Waiter> {
        let pos = self
            .queue
            .iter()
            .position(|w| w.player == player && w.notifier.same_channel(notifier))?;
        self.queue.remove(pos)
    }

    /// Put a popped waiter back at the head of the queue
    pub fn requeue_front(&mut self, waiter: Waiter) {
        self.queue.push_front(waiter);
    }

    /// Pop the oldest live waiter other than `player`.
    ///
    /// Stale entries met on the way are dropped, and so is an earlier entry of
    /// `player` itself.
    pub fn pop_partner(&mut self, player: &str) -> Option<Waiter> {
        self.queue.retain(|w| !w.is_stale() && w.player != player);
        self.queue.pop_front()
    }

    pub fn contains(&self, player: &str) -> bool {
        self.queue.iter().any(|w| w.player == player)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
