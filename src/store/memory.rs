//! In-process document store with optional JSON snapshot persistence

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use tokio::sync::RwLock;

use super::{
    Precondition, Record, RecordKey, RoomUpdate, SessionStore, StoreError, StoreResult,
    Versioned, WriteBatch, WriteOp,
};
use crate::types::{Participant, ParticipantId, Room, RoomId, Word};

#[derive(Debug, Default, Serialize, Deserialize)]
struct Collections {
    revision: u64,
    rooms: HashMap<RoomId, Versioned<Room>>,
    participants: HashMap<ParticipantId, Versioned<Participant>>,
    /// room id -> normalized text -> word
    words: HashMap<RoomId, BTreeMap<String, Versioned<Word>>>,

    // Participant indexes, rebuilt from `participants` after loading
    #[serde(skip)]
    by_identity: HashMap<(RoomId, String), ParticipantId>,
    #[serde(skip)]
    by_name: HashMap<(RoomId, String), ParticipantId>,
    #[serde(skip)]
    room_participants: HashMap<RoomId, BTreeSet<ParticipantId>>,
}

/// Previous value of a key touched by an in-flight commit
enum Undo {
    Room(RoomId, Option<Versioned<Room>>),
    Participant(ParticipantId, Option<Versioned<Participant>>),
    Word(RoomId, String, Option<Versioned<Word>>),
}

impl Collections {
    fn revision_of(&self, key: &RecordKey) -> Option<u64> {
        match key {
            RecordKey::Room(id) => self.rooms.get(id).map(|r| r.revision),
            RecordKey::Participant(id) => self.participants.get(id).map(|p| p.revision),
            RecordKey::Word { room_id, text } => self
                .words
                .get(room_id)
                .and_then(|words| words.get(text))
                .map(|w| w.revision),
        }
    }

    fn check(&self, precondition: &Precondition) -> StoreResult<()> {
        match precondition {
            Precondition::Revision(key, expected) => match self.revision_of(key) {
                Some(actual) if actual == *expected => Ok(()),
                Some(actual) => Err(StoreError::Conflict(format!(
                    "{} is at revision {}, expected {}",
                    key, actual, expected
                ))),
                None => Err(StoreError::Conflict(format!("{} no longer exists", key))),
            },
            Precondition::Absent(key) => match self.revision_of(key) {
                None => Ok(()),
                Some(_) => Err(StoreError::Conflict(format!("{} already exists", key))),
            },
        }
    }

    fn check_room_code(&self, room: &Room) -> StoreResult<()> {
        if room.is_purged() {
            return Ok(());
        }
        let taken = self.rooms.values().any(|other| {
            other.record.id != room.id && other.record.code == room.code && !other.record.is_purged()
        });
        if taken {
            return Err(StoreError::Conflict(format!(
                "room code {} is already in use",
                room.code
            )));
        }
        Ok(())
    }

    fn check_participant_unique(&self, participant: &Participant) -> StoreResult<()> {
        let held_by_other = |index: &HashMap<(RoomId, String), ParticipantId>, value: &str| {
            index
                .get(&(participant.room_id.clone(), value.to_string()))
                .is_some_and(|owner| *owner != participant.id)
        };

        if held_by_other(&self.by_identity, &participant.identity_token) {
            return Err(StoreError::Conflict(format!(
                "identity already joined room {}",
                participant.room_id
            )));
        }
        if held_by_other(&self.by_name, &participant.name) {
            return Err(StoreError::Conflict(format!(
                "name {:?} already taken in room {}",
                participant.name, participant.room_id
            )));
        }
        Ok(())
    }

    /// Insert or replace a participant, keeping the indexes in step
    fn insert_participant(
        &mut self,
        entry: Versioned<Participant>,
    ) -> Option<Versioned<Participant>> {
        let id = entry.record.id.clone();
        let previous = self.remove_participant(&id);

        let room_id = entry.record.room_id.clone();
        self.by_identity.insert(
            (room_id.clone(), entry.record.identity_token.clone()),
            id.clone(),
        );
        self.by_name
            .insert((room_id.clone(), entry.record.name.clone()), id.clone());
        self.room_participants
            .entry(room_id)
            .or_default()
            .insert(id.clone());
        self.participants.insert(id, entry);
        previous
    }

    fn remove_participant(&mut self, id: &str) -> Option<Versioned<Participant>> {
        let previous = self.participants.remove(id)?;
        let p = &previous.record;
        self.by_identity
            .remove(&(p.room_id.clone(), p.identity_token.clone()));
        self.by_name.remove(&(p.room_id.clone(), p.name.clone()));
        if let Some(ids) = self.room_participants.get_mut(&p.room_id) {
            ids.remove(id);
            if ids.is_empty() {
                self.room_participants.remove(&p.room_id);
            }
        }
        Some(previous)
    }

    fn rebuild_indexes(&mut self) {
        let participants: Vec<_> = self.participants.drain().map(|(_, p)| p).collect();
        for participant in participants {
            self.insert_participant(participant);
        }
    }

    /// Remove a word, dropping the room's map once it is empty
    fn remove_word(&mut self, room_id: &str, text: &str) -> Option<Versioned<Word>> {
        let words = self.words.get_mut(room_id)?;
        let previous = words.remove(text);
        if words.is_empty() {
            self.words.remove(room_id);
        }
        previous
    }

    fn apply(&mut self, op: WriteOp, revision: u64, undo: &mut Vec<Undo>) -> StoreResult<()> {
        match op {
            WriteOp::Put(Record::Room(room)) => {
                self.check_room_code(&room)?;
                let previous = self
                    .rooms
                    .insert(room.id.clone(), Versioned { revision, record: room.clone() });
                undo.push(Undo::Room(room.id, previous));
            }
            WriteOp::Put(Record::Participant(participant)) => {
                self.check_participant_unique(&participant)?;
                let id = participant.id.clone();
                let previous = self.insert_participant(Versioned {
                    revision,
                    record: participant,
                });
                undo.push(Undo::Participant(id, previous));
            }
            WriteOp::Put(Record::Word(word)) => {
                let room_id = word.room_id.clone();
                let text = word.text.clone();
                let previous = self
                    .words
                    .entry(room_id.clone())
                    .or_default()
                    .insert(text.clone(), Versioned { revision, record: word });
                undo.push(Undo::Word(room_id, text, previous));
            }
            WriteOp::Delete(RecordKey::Room(id)) => {
                let previous = self.rooms.remove(&id);
                undo.push(Undo::Room(id, previous));
            }
            WriteOp::Delete(RecordKey::Participant(id)) => {
                let previous = self.remove_participant(&id);
                undo.push(Undo::Participant(id, previous));
            }
            WriteOp::Delete(RecordKey::Word { room_id, text }) => {
                let previous = self.remove_word(&room_id, &text);
                undo.push(Undo::Word(room_id, text, previous));
            }
            WriteOp::UpdateRoom { room_id, update } => {
                let entry = self
                    .rooms
                    .get_mut(&room_id)
                    .ok_or_else(|| StoreError::Missing(RecordKey::Room(room_id.clone())))?;

                // Closing a room bumps its revision, but votes and joins
                // don't guard on it, so the counters refuse closed rooms.
                let adds_child = matches!(
                    update,
                    RoomUpdate::AddParticipant { .. } | RoomUpdate::AddWord
                );
                if adds_child && entry.record.state.is_terminal() {
                    return Err(StoreError::Conflict(format!(
                        "room {} is {:?}",
                        room_id, entry.record.state
                    )));
                }

                if let RoomUpdate::AddParticipant { cap } = update {
                    if entry.record.participant_count >= cap {
                        return Err(StoreError::LimitReached { room_id, cap });
                    }
                }

                undo.push(Undo::Room(room_id, Some(entry.clone())));
                match update {
                    RoomUpdate::AddParticipant { .. } => entry.record.participant_count += 1,
                    RoomUpdate::AddWord => entry.record.word_count += 1,
                    RoomUpdate::MarkPurged { at } => entry.record.purged_at = Some(at),
                }
                entry.revision = revision;
            }
        }
        Ok(())
    }

    fn rollback(&mut self, undo: Vec<Undo>) {
        for entry in undo.into_iter().rev() {
            match entry {
                Undo::Room(id, Some(previous)) => {
                    self.rooms.insert(id, previous);
                }
                Undo::Room(id, None) => {
                    self.rooms.remove(&id);
                }
                Undo::Participant(_, Some(previous)) => {
                    self.insert_participant(previous);
                }
                Undo::Participant(id, None) => {
                    self.remove_participant(&id);
                }
                Undo::Word(room_id, text, Some(previous)) => {
                    self.words.entry(room_id).or_default().insert(text, previous);
                }
                Undo::Word(room_id, text, None) => {
                    self.remove_word(&room_id, &text);
                }
            }
        }
    }
}

/// Store backed by in-memory maps behind one `RwLock`.
///
/// With a snapshot path the full contents can be written to and restored
/// from a JSON file.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: RwLock<Collections>,
    snapshot_path: Option<PathBuf>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a store persisted at `path`, starting empty if the file is missing
    pub async fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();
        let mut data: Collections = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "No snapshot found, starting empty");
                Collections::default()
            }
            Err(e) => return Err(e.into()),
        };
        data.rebuild_indexes();

        Ok(Self {
            data: RwLock::new(data),
            snapshot_path: Some(path),
        })
    }

    /// Write the current contents to the snapshot file (no-op without one)
    pub async fn persist(&self) -> StoreResult<()> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };

        let json = {
            let data = self.data.read().await;
            serde_json::to_vec_pretty(&*data)?
        };

        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn room(&self, id: &str) -> StoreResult<Option<Versioned<Room>>> {
        Ok(self.data.read().await.rooms.get(id).cloned())
    }

    async fn room_by_code(&self, code: &str) -> StoreResult<Option<Versioned<Room>>> {
        let data = self.data.read().await;
        let found = data
            .rooms
            .values()
            .filter(|r| r.record.code == code)
            .max_by_key(|r| (!r.record.is_purged(), r.record.created_at))
            .cloned();
        Ok(found)
    }

    async fn expired_rooms(
        &self,
        now: DateTime<Utc>,
        after: Option<&str>,
        limit: usize,
    ) -> StoreResult<Vec<Versioned<Room>>> {
        let data = self.data.read().await;
        let mut rooms: Vec<_> = data
            .rooms
            .values()
            .filter(|r| r.record.expires_at <= now && !r.record.is_purged())
            .filter(|r| after.is_none_or(|cursor| r.record.id.as_str() > cursor))
            .cloned()
            .collect();
        rooms.sort_by(|a, b| a.record.id.cmp(&b.record.id));
        rooms.truncate(limit);
        Ok(rooms)
    }

    async fn participant(&self, id: &str) -> StoreResult<Option<Versioned<Participant>>> {
        Ok(self.data.read().await.participants.get(id).cloned())
    }

    async fn participant_by_identity(
        &self,
        room_id: &str,
        identity_token: &str,
    ) -> StoreResult<Option<Versioned<Participant>>> {
        let data = self.data.read().await;
        Ok(data
            .by_identity
            .get(&(room_id.to_string(), identity_token.to_string()))
            .and_then(|id| data.participants.get(id))
            .cloned())
    }

    async fn participants_in_room(
        &self,
        room_id: &str,
    ) -> StoreResult<Vec<Versioned<Participant>>> {
        let data = self.data.read().await;
        let mut participants: Vec<_> = data
            .room_participants
            .get(room_id)
            .into_iter()
            .flatten()
            .filter_map(|id| data.participants.get(id))
            .cloned()
            .collect();
        participants.sort_by(|a, b| a.record.joined_at.cmp(&b.record.joined_at));
        Ok(participants)
    }

    async fn word(&self, room_id: &str, text: &str) -> StoreResult<Option<Versioned<Word>>> {
        let data = self.data.read().await;
        Ok(data
            .words
            .get(room_id)
            .and_then(|words| words.get(text))
            .cloned())
    }

    async fn words_in_room(&self, room_id: &str) -> StoreResult<Vec<Versioned<Word>>> {
        let data = self.data.read().await;
        Ok(data
            .words
            .get(room_id)
            .map(|words| words.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn commit(&self, batch: WriteBatch) -> StoreResult<u64> {
        let mut data = self.data.write().await;

        for precondition in &batch.preconditions {
            data.check(precondition)?;
        }

        let revision = data.revision + 1;
        let mut undo = Vec::with_capacity(batch.ops.len());
        for op in batch.ops {
            if let Err(e) = data.apply(op, revision, &mut undo) {
                data.rollback(undo);
                return Err(e);
            }
        }

        data.revision = revision;
        Ok(revision)
    }
}
