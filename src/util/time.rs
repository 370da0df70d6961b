//! Time utilities

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::time::Instant;

/// Get current Unix timestamp in whole seconds (used in session identifiers)
pub fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

/// Server start time for uptime tracking
static SERVER_START: std::sync::OnceLock<std::time::Instant> = std::sync::OnceLock::new();

/// Initialize server start time (call once at startup)
pub fn init_server_time() {
    SERVER_START.get_or_init(std::time::Instant::now);
}

/// Get server uptime in seconds
pub fn uptime_secs() -> u64 {
    SERVER_START
        .get()
        .map(|start| start.elapsed().as_secs())
        .unwrap_or(0)
}

/// Source of per-tick delta time for a match loop.
///
/// `Fixed` always reports the nominal tick. `Measured` reports the wall time
/// elapsed since the previous tick, clamped so that a scheduler stall cannot
/// move the ball further than `max` worth of simulation in one step.
#[derive(Debug, Clone)]
pub enum TickClock {
    Fixed(Duration),
    Measured { last: Instant, max: Duration },
}

impl TickClock {
    pub fn fixed(tick: Duration) -> Self {
        Self::Fixed(tick)
    }

    pub fn measured(max: Duration) -> Self {
        Self::Measured {
            last: Instant::now(),
            max,
        }
    }

    /// Restart measurement from now (called when the loop actually starts)
    pub fn reset(&mut self) {
        if let Self::Measured { last, .. } = self {
            *last = Instant::now();
        }
    }

    /// Delta time for the next simulation step, in seconds
    pub fn next_delta(&mut self) -> f32 {
        match self {
            Self::Fixed(tick) => tick.as_secs_f32(),
            Self::Measured { last, max } => {
                let now = Instant::now();
                let elapsed = now.duration_since(*last).min(*max);
                *last = now;
                elapsed.as_secs_f32()
            }
        }
    }
}

/// Allows an action at most once per interval
#[derive(Debug, Clone)]
pub struct Throttle {
    interval: Duration,
    last: Option<Instant>,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    /// Returns true (and arms the throttle) if the interval has elapsed
    pub fn ready(&mut self) -> bool {
        let now = Instant::now();
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}
