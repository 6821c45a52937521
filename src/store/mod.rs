//! Session store abstraction.
//!
//! The service never holds its own locks around shared records. Every
//! multi-record change is expressed as a [`WriteBatch`]: a list of
//! preconditions on record revisions plus the writes to apply. The store
//! checks and applies a batch atomically, or rejects it with
//! [`StoreError::Conflict`] and applies nothing. Callers retry on conflict.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::{Participant, ParticipantId, Room, RoomId, Word};

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Write conflict: {0}")]
    Conflict(String),

    #[error("Capacity of {cap} reached for room {room_id}")]
    LimitReached { room_id: RoomId, cap: u32 },

    #[error("Record not found: {0}")]
    Missing(RecordKey),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Address of a stored record. Words are keyed by their normalized text,
/// so two records for the same `(room, text)` cannot exist.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RecordKey {
    Room(RoomId),
    Participant(ParticipantId),
    Word { room_id: RoomId, text: String },
}

impl RecordKey {
    pub fn word(room_id: &str, text: &str) -> Self {
        RecordKey::Word {
            room_id: room_id.to_string(),
            text: text.to_string(),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKey::Room(id) => write!(f, "rooms/{}", id),
            RecordKey::Participant(id) => write!(f, "participants/{}", id),
            RecordKey::Word { room_id, text } => write!(f, "words/{}/{}", room_id, text),
        }
    }
}

/// A record together with the store revision of its last write
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Versioned<T> {
    pub revision: u64,
    pub record: T,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Room(Room),
    Participant(Participant),
    Word(Word),
}

impl Record {
    pub fn key(&self) -> RecordKey {
        match self {
            Record::Room(room) => RecordKey::Room(room.id.clone()),
            Record::Participant(p) => RecordKey::Participant(p.id.clone()),
            Record::Word(word) => RecordKey::word(&word.room_id, &word.text),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Precondition {
    /// Record must exist with exactly this revision
    Revision(RecordKey, u64),
    /// Record must not exist
    Absent(RecordKey),
}

/// Field-level room mutations applied by the store itself, so concurrent
/// counter updates never read-then-write.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomUpdate {
    /// Increment `participant_count`, failing with `LimitReached` at `cap`
    AddParticipant { cap: u32 },
    /// Increment `word_count`
    AddWord,
    MarkPurged { at: DateTime<Utc> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Put(Record),
    /// Deleting a missing record is a no-op
    Delete(RecordKey),
    UpdateRoom { room_id: RoomId, update: RoomUpdate },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    pub preconditions: Vec<Precondition>,
    pub ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expect_revision(mut self, key: RecordKey, revision: u64) -> Self {
        self.preconditions.push(Precondition::Revision(key, revision));
        self
    }

    pub fn expect_absent(mut self, key: RecordKey) -> Self {
        self.preconditions.push(Precondition::Absent(key));
        self
    }

    pub fn put(mut self, record: Record) -> Self {
        self.ops.push(WriteOp::Put(record));
        self
    }

    pub fn delete(mut self, key: RecordKey) -> Self {
        self.ops.push(WriteOp::Delete(key));
        self
    }

    pub fn update_room(mut self, room_id: &str, update: RoomUpdate) -> Self {
        self.ops.push(WriteOp::UpdateRoom {
            room_id: room_id.to_string(),
            update,
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Document store holding rooms, participants and words.
///
/// Reads are snapshots; only [`SessionStore::commit`] mutates. Unique
/// constraints enforced on commit:
/// - room `code` among non-purged rooms
/// - participant `(room_id, identity_token)` and `(room_id, name)`
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn room(&self, id: &str) -> StoreResult<Option<Versioned<Room>>>;

    /// Non-purged rooms take precedence over purged ones with the same code
    async fn room_by_code(&self, code: &str) -> StoreResult<Option<Versioned<Room>>>;

    /// Unpurged rooms with `expires_at <= now`, ordered by id, starting
    /// after the `after` cursor
    async fn expired_rooms(
        &self,
        now: DateTime<Utc>,
        after: Option<&str>,
        limit: usize,
    ) -> StoreResult<Vec<Versioned<Room>>>;

    async fn participant(&self, id: &str) -> StoreResult<Option<Versioned<Participant>>>;

    async fn participant_by_identity(
        &self,
        room_id: &str,
        identity_token: &str,
    ) -> StoreResult<Option<Versioned<Participant>>>;

    async fn participants_in_room(&self, room_id: &str)
        -> StoreResult<Vec<Versioned<Participant>>>;

    async fn word(&self, room_id: &str, text: &str) -> StoreResult<Option<Versioned<Word>>>;

    async fn words_in_room(&self, room_id: &str) -> StoreResult<Vec<Versioned<Word>>>;

    /// Check all preconditions and apply all ops atomically.
    /// Returns the revision assigned to the written records.
    async fn commit(&self, batch: WriteBatch) -> StoreResult<u64>;
}
