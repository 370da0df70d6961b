//! WebSocket protocol message definitions
//! These are the wire types for client-server communication

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::game::{EndReason, MatchSnapshot, PlayerId};
use crate::tournament::{BracketView, ScorePair};

/// Messages sent from client to server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMsg {
    /// Paddle position along the x axis
    Move { position: f32 },

    JoinMatchmaking { username: PlayerId },

    CancelMatching,

    JoinTournament { username: PlayerId },

    LeaveTournament { username: PlayerId },

    /// Result of a bracket match reported by a client
    MatchResult {
        match_id: String,
        winner: PlayerId,
        scores: ScorePair,
    },

    /// Binds a bracket-match socket to its session
    SessionInit { session_id: String },

    /// Finalist waiting room status poll
    RequestStatus,

    /// Ping for latency measurement
    Ping {
        /// Client timestamp
        t: u64,
    },
}

impl ClientMsg {
    /// Parse a text frame. JSON syntax errors and schema errors are reported
    /// separately so the client can tell them apart.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|_| ProtocolError::InvalidJson)?;

        match value.get("type") {
            Some(serde_json::Value::String(_)) => {}
            _ => return Err(ProtocolError::MissingType),
        }

        serde_json::from_value(value).map_err(|err| ProtocolError::InvalidMessage(err.to_string()))
    }

    /// Name of the message type, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMsg::Move { .. } => "move",
            ClientMsg::JoinMatchmaking { .. } => "join_matchmaking",
            ClientMsg::CancelMatching => "cancel_matching",
            ClientMsg::JoinTournament { .. } => "join_tournament",
            ClientMsg::LeaveTournament { .. } => "leave_tournament",
            ClientMsg::MatchResult { .. } => "match_result",
            ClientMsg::SessionInit { .. } => "session_init",
            ClientMsg::RequestStatus => "request_status",
            ClientMsg::Ping { .. } => "ping",
        }
    }
}

/// Rejected inbound frames
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Invalid JSON format")]
    InvalidJson,

    #[error("Message type is required")]
    MissingType,

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Binary frames are not supported")]
    Binary,
}

/// Where a client should go after `game_end`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NextStage {
    /// Casual match: back to the lobby
    Lobby,
    /// Semifinal won: go to the finalist waiting room
    WaitingFinal,
    Eliminated,
    /// Final finished
    TournamentComplete,
}

/// Finalist entry of `final_status`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FinalistView {
    pub username: PlayerId,
    pub bracket_position: u8,
}

/// Messages sent from server to client
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMsg {
    Waiting {
        message: String,
    },

    MatchFound {
        session_id: String,
        player1: PlayerId,
        player2: PlayerId,
    },

    GameInitialized {
        session_id: String,
    },

    /// Match state from the receiver's point of view
    StateUpdate {
        state: MatchSnapshot,
    },

    PlayerDisconnected {
        disconnected_player: PlayerId,
        state: MatchSnapshot,
    },

    GameEnd {
        session_id: String,
        winner: PlayerId,
        score: BTreeMap<PlayerId, u32>,
        reason: EndReason,
        next_stage: Option<NextStage>,
        bracket: Option<BracketView>,
    },

    WaitingStatus {
        tournament_id: u64,
        players: Vec<PlayerId>,
        total_players: usize,
        required_players: usize,
    },

    TournamentReady {
        tournament_id: u64,
        bracket: BracketView,
    },

    TournamentMatch {
        tournament_id: u64,
        match_type: String,
        match_number: u8,
        session_id: String,
        opponent: PlayerId,
        is_player1: bool,
        next_match: String,
        bracket_position: u8,
    },

    FinalStatus {
        tournament_id: u64,
        completed_semifinals: usize,
        all_semifinals_completed: bool,
        finalists: Vec<FinalistView>,
    },

    FinalReady {
        tournament_id: u64,
        session_id: String,
        player1: PlayerId,
        player2: PlayerId,
        is_player1: bool,
    },

    TournamentComplete {
        tournament_id: u64,
        winner: PlayerId,
        bracket: BracketView,
    },

    Error {
        message: String,
    },

    Pong {
        t: u64,
    },
}

impl ServerMsg {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMsg::Error {
            message: message.into(),
        }
    }

    pub fn waiting(message: impl Into<String>) -> Self {
        ServerMsg::Waiting {
            message: message.into(),
        }
    }
}
