use super::room::ensure_open;
use super::{backoff, AppState};
use crate::error::{RoomError, RoomResult};
use crate::protocol::{JoinRoomRequest, JoinRoomResponse, ServerMessage};
use crate::store::{Record, RecordKey, RoomUpdate, StoreError, WriteBatch};
use crate::types::*;
use chrono::{DateTime, Utc};
use rand::Rng;
use std::collections::HashSet;

/// Suffixes tried before giving up on a free display name
pub const MAX_NAME_ATTEMPTS: u32 = 100;

fn placeholder_name() -> String {
    format!("Guest{}", rand::rng().random_range(0..1000))
}

/// Pick a display name not yet used in the room.
///
/// Empty requests get a random placeholder. Collisions get " 1", " 2", ...
/// appended until one is free.
pub fn resolve_unique_name(requested: Option<&str>, taken: &HashSet<String>) -> RoomResult<String> {
    let trimmed: String = requested
        .unwrap_or_default()
        .trim()
        .chars()
        .take(MAX_NAME_LENGTH)
        .collect();
    let base = match trimmed.trim_end() {
        "" => placeholder_name(),
        name => name.to_string(),
    };

    if !taken.contains(&base) {
        return Ok(base);
    }

    (1..=MAX_NAME_ATTEMPTS)
        .map(|n| format!("{} {}", base, n))
        .find(|candidate| !taken.contains(candidate))
        .ok_or_else(|| {
            RoomError::InvalidInput(format!("No free display name left for {:?}", base))
        })
}

fn join_response(participant: &Participant, room: &Room, now: DateTime<Utc>) -> JoinRoomResponse {
    JoinRoomResponse {
        participant_id: participant.id.clone(),
        participant_name: participant.name.clone(),
        room_title: room.title.clone(),
        room_state: room.effective_state(now),
        has_voted: participant.has_voted,
        is_active: participant.is_active,
        requires_confirmation: room.requires_confirmation,
        time_limit: room.time_limit,
    }
}

impl AppState {
    /// Join a room, or return the existing participant for this identity
    pub async fn join_room(&self, req: JoinRoomRequest) -> RoomResult<JoinRoomResponse> {
        let token = req.identity_token.trim();
        if token.is_empty() {
            return Err(RoomError::InvalidInput(
                "Identity token is required".to_string(),
            ));
        }

        let max_attempts = self.config.max_attempts;
        for attempt in 0..max_attempts {
            let room = self.resolve_room(&req.room_code).await?.record;
            let now = Utc::now();
            ensure_open(&room, now)?;

            // Reloading the page must not need a free seat
            if let Some(existing) = self.store.participant_by_identity(&room.id, token).await? {
                tracing::debug!(
                    room_code = %room.code,
                    participant_id = %existing.record.id,
                    "Participant re-joined"
                );
                return Ok(join_response(&existing.record, &room, now));
            }

            if room.participant_count >= self.config.max_participants {
                return Err(RoomError::Full);
            }

            let taken: HashSet<String> = self
                .store
                .participants_in_room(&room.id)
                .await?
                .into_iter()
                .map(|p| p.record.name)
                .collect();
            let name = resolve_unique_name(req.participant_name.as_deref(), &taken)?;

            let participant = Participant {
                id: ulid::Ulid::new().to_string(),
                room_id: room.id.clone(),
                name,
                identity_token: token.to_string(),
                has_voted: false,
                voted_at: None,
                submitted_word: None,
                joined_at: now,
                is_active: true,
            };

            let batch = WriteBatch::new()
                .expect_absent(RecordKey::Participant(participant.id.clone()))
                .put(Record::Participant(participant.clone()))
                .update_room(
                    &room.id,
                    RoomUpdate::AddParticipant {
                        cap: self.config.max_participants,
                    },
                );

            match self.commit(batch).await {
                Ok(_) => {
                    let participant_count = match self.store.room(&room.id).await {
                        Ok(Some(current)) => current.record.participant_count,
                        _ => room.participant_count + 1,
                    };
                    tracing::info!(
                        room_code = %room.code,
                        participant_id = %participant.id,
                        name = %participant.name,
                        participant_count,
                        "Participant joined"
                    );
                    self.publish(ServerMessage::ParticipantJoined {
                        room_code: room.code.clone(),
                        participant_count,
                    });
                    return Ok(join_response(&participant, &room, now));
                }
                Err(RoomError::Store(StoreError::LimitReached { .. })) => {
                    return Err(RoomError::Full);
                }
                Err(e) if e.is_conflict() => {
                    // Same token or same name raced us; the next pass sees it
                    tracing::debug!(room_code = %room.code, attempt, "Join conflicted, retrying");
                    backoff(attempt).await;
                }
                Err(e) => return Err(e),
            }
        }

        Err(RoomError::Contention {
            attempts: max_attempts,
        })
    }

    /// Participant ids and names of a room, in join order
    pub async fn list_participants(&self, room_id: &str) -> RoomResult<Vec<Participant>> {
        Ok(self
            .store
            .participants_in_room(room_id)
            .await?
            .into_iter()
            .map(|p| p.record)
            .collect())
    }
}
