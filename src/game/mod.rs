//! Game simulation modules

pub mod physics;
pub mod registry;
pub mod runner;
pub mod session;
pub mod session_id;
pub mod snapshot;

pub use registry::{
    EndReason, LiveSession, MatchEvent, MatchKind, MatchOutcome, MatchRegistry, ViewerGuard,
};
pub use runner::{FinishedMatch, MatchResultSink};
pub use session::{RecordHandle, SessionError};
pub use session_id::{RoundType, SessionId};
pub use snapshot::MatchSnapshot;

/// Players are identified by their username
pub type PlayerId = String;
