use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Opaque ID types for type safety
pub type RoomId = String;
pub type ParticipantId = String;
pub type OwnerId = String;

pub const ROOM_CODE_LENGTH: usize = 6;
pub const MAX_WORD_LENGTH: usize = 30;
pub const MAX_TITLE_LENGTH: usize = 100;
pub const MAX_NAME_LENGTH: usize = 30;
pub const MAX_PARTICIPANTS_PER_ROOM: u32 = 100;
pub const ROOM_TTL_DAYS: i64 = 7;
pub const MAX_TIME_LIMIT_MINUTES: u32 = 60;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoomState {
    Waiting,
    Active,
    Finished,
    Expired,
}

impl RoomState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RoomState::Finished | RoomState::Expired)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Expired,
    ManualCleanup,
    AllVoted,
    OperatorEnded,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Room {
    pub id: RoomId,
    pub code: String,
    pub title: String,
    pub created_by: OwnerId,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub state: RoomState,
    pub requires_confirmation: bool,
    /// Advisory voting window in minutes, never enforced server-side
    pub time_limit: Option<u32>,
    pub participant_count: u32,
    pub word_count: u32,
    pub is_active: bool,
    pub is_finished: bool,
    pub activated_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub finish_reason: Option<FinishReason>,
    /// Set once the sweeper has deleted the room's participants and words
    #[serde(default)]
    pub purged_at: Option<DateTime<Utc>>,
}

impl Room {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// State as seen by callers: a room past `expires_at` is expired even
    /// if the sweeper has not marked it yet.
    pub fn effective_state(&self, now: DateTime<Utc>) -> RoomState {
        if self.is_expired_at(now) {
            RoomState::Expired
        } else {
            self.state
        }
    }

    pub fn is_purged(&self) -> bool {
        self.purged_at.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Participant {
    pub id: ParticipantId,
    pub room_id: RoomId,
    pub name: String,
    pub identity_token: String,
    pub has_voted: bool,
    pub voted_at: Option<DateTime<Utc>>,
    /// Normalized key of the submitted word
    pub submitted_word: Option<String>,
    pub joined_at: DateTime<Utc>,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Word {
    pub room_id: RoomId,
    /// Normalized comparison key, unique per room
    pub text: String,
    /// First-seen spelling, used for display
    pub original_text: String,
    pub count: u32,
    pub submitted_by: BTreeSet<ParticipantId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Word {
    pub fn first_vote(
        room_id: RoomId,
        text: String,
        original_text: String,
        participant_id: ParticipantId,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            room_id,
            text,
            original_text,
            count: 1,
            submitted_by: BTreeSet::from([participant_id]),
            created_at: now,
            updated_at: now,
        }
    }

    /// Record another participant's vote. Returns false if the participant
    /// was already counted, leaving the word untouched.
    pub fn add_vote(&mut self, participant_id: ParticipantId, now: DateTime<Utc>) -> bool {
        if !self.submitted_by.insert(participant_id) {
            return false;
        }
        self.count = self.submitted_by.len() as u32;
        self.updated_at = now;
        true
    }
}
