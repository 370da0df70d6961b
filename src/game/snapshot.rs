//! Snapshot building and per-viewer perspective

use std::collections::BTreeMap;

use serde::Serialize;

use super::physics::{PhysicsState, Side, BALL_HEIGHT};
use super::PlayerId;

/// Ball position/velocity as sent to renderers (y is a constant height)
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Vec3View {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BallView {
    pub position: Vec3View,
    pub velocity: Vec3View,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PaddleView {
    pub x: f32,
    pub z: f32,
}

/// State of one match as broadcast in `state_update`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchSnapshot {
    pub ball: BallView,
    pub players: BTreeMap<PlayerId, PaddleView>,
    pub score: BTreeMap<PlayerId, u32>,
    pub is_active: bool,
    #[serde(skip)]
    player1: PlayerId,
    #[serde(skip)]
    player2: PlayerId,
}

impl MatchSnapshot {
    /// Build the canonical snapshot (player 1's point of view)
    pub fn build(player1: &str, player2: &str, state: &PhysicsState) -> Self {
        let ball = BallView {
            position: Vec3View {
                x: state.ball.position.x,
                y: BALL_HEIGHT,
                z: state.ball.position.z,
            },
            velocity: Vec3View {
                x: state.ball.velocity.x,
                y: 0.0,
                z: state.ball.velocity.z,
            },
        };

        let players = BTreeMap::from([
            (
                player1.to_string(),
                PaddleView {
                    x: state.paddles[0],
                    z: Side::Near.paddle_z(),
                },
            ),
            (
                player2.to_string(),
                PaddleView {
                    x: state.paddles[1],
                    z: Side::Far.paddle_z(),
                },
            ),
        ]);

        let score = BTreeMap::from([
            (player1.to_string(), state.score[0]),
            (player2.to_string(), state.score[1]),
        ]);

        Self {
            ball,
            players,
            score,
            is_active: state.active,
            player1: player1.to_string(),
            player2: player2.to_string(),
        }
    }

    pub fn player1(&self) -> &str {
        &self.player1
    }

    pub fn player2(&self) -> &str {
        &self.player2
    }

    /// Score as (player1, player2)
    pub fn score_pair(&self) -> (u32, u32) {
        (
            self.score.get(&self.player1).copied().unwrap_or(0),
            self.score.get(&self.player2).copied().unwrap_or(0),
        )
    }

    /// Copy with the z axis negated, so the far player sees their own paddle
    /// at the near end. Applying it twice yields the original.
    pub fn mirrored(&self) -> Self {
        let mut view = self.clone();
        view.ball.position.z = -view.ball.position.z;
        view.ball.velocity.z = -view.ball.velocity.z;
        for paddle in view.players.values_mut() {
            paddle.z = -paddle.z;
        }
        view
    }

    /// The snapshot as `viewer` should render it
    pub fn for_viewer(&self, viewer: &str) -> Self {
        if viewer == self.player2 && viewer != self.player1 {
            self.mirrored()
        } else {
            self.clone()
        }
    }
}
