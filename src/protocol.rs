use crate::types::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRoomRequest {
    pub title: String,
    #[serde(default)]
    pub requires_confirmation: bool,
    /// Minutes
    #[serde(default)]
    pub time_limit: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRoomResponse {
    pub room_id: RoomId,
    pub room_code: String,
    pub title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRoomRequest {
    pub room_code: String,
    #[serde(default)]
    pub participant_name: Option<String>,
    pub identity_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRoomResponse {
    pub participant_id: ParticipantId,
    pub participant_name: String,
    pub room_title: String,
    pub room_state: RoomState,
    pub has_voted: bool,
    pub is_active: bool,
    pub requires_confirmation: bool,
    pub time_limit: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitWordRequest {
    pub participant_id: ParticipantId,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitWordResponse {
    /// Trimmed spelling as submitted
    pub word: String,
    pub participant_name: String,
    pub all_voted: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub rooms_cleaned: u32,
    pub participants_deleted: u32,
    pub words_deleted: u32,
    /// Batches that failed and will be retried by the next sweep
    pub failed_batches: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteRoomResponse {
    pub room_code: String,
    pub participants_deleted: u32,
    pub words_deleted: u32,
}

/// Public view of a room with expiry already applied to `state`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomView {
    pub room_id: RoomId,
    pub room_code: String,
    pub title: String,
    pub state: RoomState,
    pub requires_confirmation: bool,
    pub time_limit: Option<u32>,
    pub participant_count: u32,
    pub word_count: u32,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub finish_reason: Option<FinishReason>,
}

impl RoomView {
    pub fn new(room: &Room, now: DateTime<Utc>) -> Self {
        Self {
            room_id: room.id.clone(),
            room_code: room.code.clone(),
            title: room.title.clone(),
            state: room.effective_state(now),
            requires_confirmation: room.requires_confirmation,
            time_limit: room.time_limit,
            participant_count: room.participant_count,
            word_count: room.word_count,
            created_at: room.created_at,
            expires_at: room.expires_at,
            finished_at: room.finished_at,
            finish_reason: room.finish_reason,
        }
    }
}

/// One line of the tally, as shown in the word cloud
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WordEntry {
    pub text: String,
    pub display_text: String,
    pub count: u32,
}

impl From<&Word> for WordEntry {
    fn from(word: &Word) -> Self {
        Self {
            text: word.text.clone(),
            display_text: word.original_text.clone(),
            count: word.count,
        }
    }
}

/// Messages pushed to live room viewers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "t", rename_all = "snake_case")]
pub enum ServerMessage {
    Welcome {
        room: RoomView,
        words: Vec<WordEntry>,
        server_now: String,
    },
    WordsUpdated {
        room_code: String,
        words: Vec<WordEntry>,
        word_count: u32,
    },
    ParticipantJoined {
        room_code: String,
        participant_count: u32,
    },
    RoomStateChanged {
        room_code: String,
        state: RoomState,
        finish_reason: Option<FinishReason>,
    },
    RoomDeleted {
        room_code: String,
    },
    Error {
        code: String,
        msg: String,
    },
}

impl ServerMessage {
    /// Room this message concerns, if any
    pub fn room_code(&self) -> Option<&str> {
        match self {
            ServerMessage::Welcome { room, .. } => Some(&room.room_code),
            ServerMessage::WordsUpdated { room_code, .. }
            | ServerMessage::ParticipantJoined { room_code, .. }
            | ServerMessage::RoomStateChanged { room_code, .. }
            | ServerMessage::RoomDeleted { room_code } => Some(room_code),
            ServerMessage::Error { .. } => None,
        }
    }
}
