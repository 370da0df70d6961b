//! Ball and paddle simulation for a single match

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

/// Play-field width (x axis, side walls at ±W/2)
pub const FIELD_WIDTH: f32 = 1200.0;
/// Play-field length (z axis, paddles at ±L/2)
pub const FIELD_LENGTH: f32 = 3000.0;
pub const PADDLE_WIDTH: f32 = 200.0;
/// Half of the paddle's depth along z
pub const PADDLE_HALF_DEPTH: f32 = 10.0;
pub const BALL_RADIUS: f32 = 30.0;
/// Constant render height of the ball
pub const BALL_HEIGHT: f32 = 30.0;
/// Lateral velocity added per unit of off-centre paddle contact
pub const PADDLE_ENGLISH: f32 = 0.1;

/// Furthest a paddle centre may travel from the middle of the field
pub const PADDLE_LIMIT: f32 = (FIELD_WIDTH - PADDLE_WIDTH) / 2.0;

/// Position or velocity on the play-field plane
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec2 {
    pub x: f32,
    pub z: f32,
}

impl Vec2 {
    pub const ZERO: Self = Self { x: 0.0, z: 0.0 };

    pub const fn new(x: f32, z: f32) -> Self {
        Self { x, z }
    }
}

/// Which end of the field a player defends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    /// Player 1, paddle at z = +L/2
    Near,
    /// Player 2, paddle at z = -L/2
    Far,
}

impl Side {
    pub fn opponent(self) -> Self {
        match self {
            Side::Near => Side::Far,
            Side::Far => Side::Near,
        }
    }

    /// z coordinate of this side's paddle
    pub fn paddle_z(self) -> f32 {
        match self {
            Side::Near => FIELD_LENGTH / 2.0,
            Side::Far => -FIELD_LENGTH / 2.0,
        }
    }

    fn index(self) -> usize {
        match self {
            Side::Near => 0,
            Side::Far => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ball {
    pub position: Vec2,
    pub velocity: Vec2,
}

/// Tunables of the simulation
#[derive(Debug, Clone, Copy)]
pub struct PhysicsParams {
    pub ball_speed: f32,
    pub winning_score: u32,
}

/// Complete simulation state of one match
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhysicsState {
    pub ball: Ball,
    pub paddles: [f32; 2],
    pub score: [u32; 2],
    pub active: bool,
}

/// Deterministic (per seed) Pong simulation
#[derive(Debug, Clone)]
pub struct PhysicsEngine {
    params: PhysicsParams,
    state: PhysicsState,
    rng: ChaCha8Rng,
}

impl PhysicsEngine {
    pub fn new(params: PhysicsParams, seed: u64) -> Self {
        let state = PhysicsState {
            ball: Ball {
                position: Vec2::ZERO,
                velocity: Vec2::new(params.ball_speed, -params.ball_speed),
            },
            paddles: [0.0, 0.0],
            score: [0, 0],
            active: true,
        };

        Self {
            params,
            state,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    pub fn state(&self) -> &PhysicsState {
        &self.state
    }

    pub fn ball(&self) -> Ball {
        self.state.ball
    }

    pub fn paddle(&self, side: Side) -> f32 {
        self.state.paddles[side.index()]
    }

    pub fn score(&self, side: Side) -> u32 {
        self.state.score[side.index()]
    }

    pub fn is_active(&self) -> bool {
        self.state.active
    }

    /// Side that reached the winning score, if any
    pub fn winner(&self) -> Option<Side> {
        [Side::Near, Side::Far]
            .into_iter()
            .find(|side| self.score(*side) >= self.params.winning_score)
    }

    /// Place the ball explicitly (serves, replays and tests)
    pub fn set_ball(&mut self, ball: Ball) {
        self.state.ball = ball;
    }

    /// Advance the simulation by `dt` seconds.
    /// Returns the side that scored during this step, if any.
    pub fn update(&mut self, dt: f32) -> Option<Side> {
        if !self.state.active {
            return None;
        }

        let ball = &mut self.state.ball;
        ball.position.x += ball.velocity.x * dt;
        ball.position.z += ball.velocity.z * dt;

        self.handle_wall_collision();
        self.handle_paddle_collision();
        self.check_scoring()
    }

    /// Move a paddle to `x`, clamped to the field
    pub fn move_paddle(&mut self, side: Side, x: f32) {
        if !x.is_finite() {
            return;
        }
        self.state.paddles[side.index()] = x.clamp(-PADDLE_LIMIT, PADDLE_LIMIT);
    }

    /// Terminate the match with `loser` on zero and the opponent on the winning score
    pub fn forfeit(&mut self, loser: Side) {
        self.state.score[loser.index()] = 0;
        self.state.score[loser.opponent().index()] = self.params.winning_score;
        self.state.active = false;
    }

    fn handle_wall_collision(&mut self) {
        let ball = &mut self.state.ball;
        let half_width = FIELD_WIDTH / 2.0;
        if ball.position.x.abs() > half_width {
            ball.velocity.x = -ball.velocity.x;
            ball.position.x = half_width.copysign(ball.position.x);
        }
    }

    fn handle_paddle_collision(&mut self) {
        let reach_x = PADDLE_WIDTH / 2.0 + BALL_RADIUS;
        let reach_z = PADDLE_HALF_DEPTH + BALL_RADIUS;

        for side in [Side::Near, Side::Far] {
            let paddle_x = self.paddle(side);
            let paddle_z = side.paddle_z();
            let ball = &mut self.state.ball;

            let overlaps = (ball.position.x - paddle_x).abs() <= reach_x
                && (ball.position.z - paddle_z).abs() <= reach_z;
            // Only a ball travelling towards the paddle bounces; otherwise it
            // would flip back and forth while still inside the hit box.
            let approaching = ball.velocity.z * paddle_z > 0.0;

            if overlaps && approaching {
                ball.velocity.z = -ball.velocity.z;
                ball.velocity.x += (ball.position.x - paddle_x) * PADDLE_ENGLISH;
            }
        }
    }

    fn check_scoring(&mut self) -> Option<Side> {
        let z = self.state.ball.position.z;
        if z.abs() <= FIELD_LENGTH / 2.0 {
            return None;
        }

        // The ball left through the far line: the near player scores, and vice versa
        let scorer = if z < 0.0 { Side::Near } else { Side::Far };
        let score = &mut self.state.score[scorer.index()];
        *score = (*score + 1).min(self.params.winning_score);

        if *score >= self.params.winning_score {
            self.state.active = false;
        } else {
            self.serve();
        }

        Some(scorer)
    }

    /// Reset the ball to the centre with independently randomised directions
    fn serve(&mut self) {
        let speed = self.params.ball_speed;
        let vx = if self.rng.gen_bool(0.5) { speed } else { -speed };
        let vz = if self.rng.gen_bool(0.5) { speed } else { -speed };
        self.state.ball = Ball {
            position: Vec2::ZERO,
            velocity: Vec2::new(vx, vz),
        };
    }
}
