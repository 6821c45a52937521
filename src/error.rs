//! Error taxonomy surfaced at the boundary of every room operation.

use std::time::Duration;

use crate::state::room::TransitionError;
use crate::store::StoreError;

pub type RoomResult<T> = Result<T, RoomError>;

#[derive(Debug, thiserror::Error)]
pub enum RoomError {
    #[error("Room not found")]
    RoomNotFound,

    #[error("Participant not found")]
    ParticipantNotFound,

    #[error("Room has expired")]
    Expired,

    #[error("Room has finished")]
    Finished,

    #[error("Room is full")]
    Full,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid word: {0}")]
    InvalidWord(String),

    #[error("Participant has already voted")]
    AlreadyVoted,

    #[error("Voting has not started")]
    NotStarted,

    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),

    #[error("Could not allocate a unique room code after {attempts} attempts")]
    AllocationExhausted { attempts: u32 },

    #[error("Gave up after {attempts} conflicting attempts")]
    Contention { attempts: u32 },

    #[error("Store did not commit within {0:?}")]
    Timeout(Duration),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl RoomError {
    /// Stable code sent to clients
    pub fn code(&self) -> &'static str {
        match self {
            RoomError::RoomNotFound => "ROOM_NOT_FOUND",
            RoomError::ParticipantNotFound => "PARTICIPANT_NOT_FOUND",
            RoomError::Expired => "ROOM_EXPIRED",
            RoomError::Finished => "ROOM_FINISHED",
            RoomError::Full => "ROOM_FULL",
            RoomError::Forbidden(_) => "FORBIDDEN",
            RoomError::InvalidInput(_) => "INVALID_INPUT",
            RoomError::InvalidWord(_) => "INVALID_WORD",
            RoomError::AlreadyVoted => "ALREADY_VOTED",
            RoomError::NotStarted => "NOT_STARTED",
            RoomError::InvalidTransition(_) => "INVALID_TRANSITION",
            RoomError::AllocationExhausted { .. } => "ALLOCATION_EXHAUSTED",
            RoomError::Contention { .. } => "CONTENTION",
            RoomError::Timeout(_) => "TIMEOUT",
            RoomError::Store(_) => "STORE_ERROR",
        }
    }

    /// Whether the caller may retry the whole operation from scratch
    pub fn is_retryable(&self) -> bool {
        matches!(self, RoomError::Contention { .. } | RoomError::Timeout(_))
    }

    /// Optimistic-concurrency failure reported by the store
    pub(crate) fn is_conflict(&self) -> bool {
        matches!(self, RoomError::Store(StoreError::Conflict(_)))
    }
}
