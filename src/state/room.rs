use super::{backoff, AppState};
use crate::code::{self, MAX_ALLOCATION_ATTEMPTS};
use crate::error::{RoomError, RoomResult};
use crate::protocol::{
    CreateRoomRequest, CreateRoomResponse, DeleteRoomResponse, RoomView, ServerMessage,
};
use crate::store::{Record, RecordKey, Versioned, WriteBatch};
use crate::types::*;
use chrono::{DateTime, Utc};

/// Events that move a room through its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomEvent {
    Activate,
    Finish(FinishReason),
    Expire(FinishReason),
}

/// Outcome of applying an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied(RoomState),
    /// Room was already in the target state
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid room transition from {from:?} on {event:?}")]
pub struct TransitionError {
    pub from: RoomState,
    pub event: RoomEvent,
}

impl RoomState {
    /// Lifecycle table. FINISHED and EXPIRED never lead back to WAITING or ACTIVE.
    pub fn apply(self, event: RoomEvent) -> Result<Transition, TransitionError> {
        use RoomState::*;

        match (self, event) {
            (Waiting, RoomEvent::Activate) => Ok(Transition::Applied(Active)),
            (Active, RoomEvent::Activate) => Ok(Transition::Unchanged),

            (Waiting | Active, RoomEvent::Finish(_)) => Ok(Transition::Applied(Finished)),
            (Finished, RoomEvent::Finish(_)) => Ok(Transition::Unchanged),

            (Expired, RoomEvent::Expire(_)) => Ok(Transition::Unchanged),
            (_, RoomEvent::Expire(_)) => Ok(Transition::Applied(Expired)),

            (from, event) => Err(TransitionError { from, event }),
        }
    }
}

impl Room {
    /// Apply an event to the record, stamping the matching timestamps
    pub fn apply_event(
        &mut self,
        event: RoomEvent,
        now: DateTime<Utc>,
    ) -> Result<Transition, TransitionError> {
        let transition = self.state.apply(event)?;
        let Transition::Applied(next) = transition else {
            return Ok(transition);
        };

        self.state = next;
        match event {
            RoomEvent::Activate => {
                self.is_active = true;
                self.activated_at = Some(now);
            }
            RoomEvent::Finish(reason) => {
                self.is_finished = true;
                self.finished_at = Some(now);
                self.finish_reason = Some(reason);
            }
            RoomEvent::Expire(reason) => {
                self.is_active = false;
                self.is_finished = true;
                // A room that already finished keeps how and when it ended
                if self.finished_at.is_none() {
                    self.finished_at = Some(now);
                    self.finish_reason = Some(reason);
                }
            }
        }
        Ok(transition)
    }
}

fn validate_title(title: &str) -> RoomResult<String> {
    let title = title.trim();
    if title.is_empty() {
        return Err(RoomError::InvalidInput("Title cannot be empty".to_string()));
    }
    if title.chars().count() > MAX_TITLE_LENGTH {
        return Err(RoomError::InvalidInput(format!(
            "Title cannot exceed {} characters",
            MAX_TITLE_LENGTH
        )));
    }
    Ok(title.to_string())
}

fn validate_time_limit(time_limit: Option<u32>) -> RoomResult<Option<u32>> {
    match time_limit {
        Some(minutes) if !(1..=MAX_TIME_LIMIT_MINUTES).contains(&minutes) => {
            Err(RoomError::InvalidInput(format!(
                "Time limit must be between 1 and {} minutes",
                MAX_TIME_LIMIT_MINUTES
            )))
        }
        other => Ok(other),
    }
}

/// Reject operations on rooms that no longer take joins or votes
pub(crate) fn ensure_open(room: &Room, now: DateTime<Utc>) -> RoomResult<()> {
    match room.effective_state(now) {
        RoomState::Expired => Err(RoomError::Expired),
        RoomState::Finished => Err(RoomError::Finished),
        RoomState::Waiting | RoomState::Active => Ok(()),
    }
}

fn ensure_owner(room: &Room, owner: &str, action: &str) -> RoomResult<()> {
    if room.created_by != owner {
        return Err(RoomError::Forbidden(format!(
            "Only the room owner can {}",
            action
        )));
    }
    Ok(())
}

impl AppState {
    /// Create a room in WAITING with a freshly allocated code
    pub async fn create_room(
        &self,
        owner: &str,
        req: CreateRoomRequest,
    ) -> RoomResult<CreateRoomResponse> {
        if owner.trim().is_empty() {
            return Err(RoomError::Forbidden(
                "An owner identity is required".to_string(),
            ));
        }
        let title = validate_title(&req.title)?;
        let time_limit = validate_time_limit(req.time_limit)?;

        // The code check and the insert are separate steps, so a concurrent
        // create may still claim the code first. The store's unique index
        // rejects that commit and we draw again.
        for attempt in 1..=MAX_ALLOCATION_ATTEMPTS {
            let code = code::allocate_room_code(self.store.as_ref()).await?;
            let now = Utc::now();
            let room = Room {
                id: ulid::Ulid::new().to_string(),
                code,
                title: title.clone(),
                created_by: owner.to_string(),
                created_at: now,
                expires_at: now + self.config.room_ttl,
                state: RoomState::Waiting,
                requires_confirmation: req.requires_confirmation,
                time_limit,
                participant_count: 0,
                word_count: 0,
                is_active: false,
                is_finished: false,
                activated_at: None,
                finished_at: None,
                finish_reason: None,
                purged_at: None,
            };

            let batch = WriteBatch::new()
                .expect_absent(RecordKey::Room(room.id.clone()))
                .put(Record::Room(room.clone()));

            match self.commit(batch).await {
                Ok(_) => {
                    tracing::info!(room_code = %room.code, room_id = %room.id, "Room created");
                    return Ok(CreateRoomResponse {
                        room_id: room.id,
                        room_code: room.code,
                        title: room.title,
                    });
                }
                Err(e) if e.is_conflict() => {
                    tracing::debug!(attempt, code = %room.code, "Room code claimed concurrently");
                }
                Err(e) => return Err(e),
            }
        }

        Err(RoomError::AllocationExhausted {
            attempts: MAX_ALLOCATION_ATTEMPTS,
        })
    }

    /// Look a room up by its human-facing code (case-insensitive)
    pub async fn resolve_room(&self, code: &str) -> RoomResult<Versioned<Room>> {
        let code = code.trim().to_uppercase();
        if !code::is_well_formed(&code) {
            return Err(RoomError::RoomNotFound);
        }
        self.store
            .room_by_code(&code)
            .await?
            .ok_or(RoomError::RoomNotFound)
    }

    pub async fn get_room(&self, code: &str) -> RoomResult<RoomView> {
        let room = self.resolve_room(code).await?;
        Ok(RoomView::new(&room.record, Utc::now()))
    }

    /// Open voting. Owner only; activating an active room is a no-op.
    pub async fn activate_room(&self, code: &str, owner: &str) -> RoomResult<RoomView> {
        let room = self.resolve_room(code).await?;
        let room = self
            .transition_room(&room.record.id, RoomEvent::Activate, Some(owner))
            .await?;
        Ok(RoomView::new(&room, Utc::now()))
    }

    /// End voting on the owner's request
    pub async fn finish_room(&self, code: &str, owner: &str) -> RoomResult<RoomView> {
        let room = self.resolve_room(code).await?;
        let room = self
            .transition_room(
                &room.record.id,
                RoomEvent::Finish(FinishReason::OperatorEnded),
                Some(owner),
            )
            .await?;
        Ok(RoomView::new(&room, Utc::now()))
    }

    /// Finish without an ownership check (auto-finish)
    pub(crate) async fn finish(&self, room_id: &str, reason: FinishReason) -> RoomResult<Room> {
        self.transition_room(room_id, RoomEvent::Finish(reason), None)
            .await
    }

    /// Apply a lifecycle event with compare-and-swap on the room revision.
    ///
    /// Expiry is checked against `expires_at` before anything else, so a
    /// room the sweeper has not reached yet still rejects activation and
    /// finishing.
    pub(crate) async fn transition_room(
        &self,
        room_id: &str,
        event: RoomEvent,
        owner: Option<&str>,
    ) -> RoomResult<Room> {
        let max_attempts = self.config.max_attempts;

        for attempt in 0..max_attempts {
            let Versioned {
                revision,
                record: mut room,
            } = self
                .store
                .room(room_id)
                .await?
                .ok_or(RoomError::RoomNotFound)?;

            if let Some(owner) = owner {
                ensure_owner(&room, owner, "change its state")?;
            }

            let now = Utc::now();
            if !matches!(event, RoomEvent::Expire(_)) && room.is_expired_at(now) {
                return Err(RoomError::Expired);
            }

            if room.apply_event(event, now)? == Transition::Unchanged {
                return Ok(room);
            }

            let batch = WriteBatch::new()
                .expect_revision(RecordKey::Room(room.id.clone()), revision)
                .put(Record::Room(room.clone()));

            match self.commit(batch).await {
                Ok(_) => {
                    tracing::info!(
                        room_code = %room.code,
                        state = ?room.state,
                        ?event,
                        "Room state changed"
                    );
                    self.publish(ServerMessage::RoomStateChanged {
                        room_code: room.code.clone(),
                        state: room.state,
                        finish_reason: room.finish_reason,
                    });
                    return Ok(room);
                }
                Err(e) if e.is_conflict() => {
                    tracing::debug!(room_id, attempt, "Room transition conflicted, retrying");
                    backoff(attempt).await;
                }
                Err(e) => return Err(e),
            }
        }

        Err(RoomError::Contention {
            attempts: max_attempts,
        })
    }

    /// Hard-delete a room with all its participants and words. Owner only.
    pub async fn delete_room(&self, code: &str, owner: &str) -> RoomResult<DeleteRoomResponse> {
        let max_attempts = self.config.max_attempts;

        for attempt in 0..max_attempts {
            let Versioned { revision, record: room } = self.resolve_room(code).await?;
            ensure_owner(&room, owner, "delete it")?;

            let participants = self.store.participants_in_room(&room.id).await?;
            let words = self.store.words_in_room(&room.id).await?;

            // The room revision guard catches joins and votes that land
            // between the reads above and the commit.
            let mut batch = WriteBatch::new()
                .expect_revision(RecordKey::Room(room.id.clone()), revision);
            for p in &participants {
                batch = batch.delete(RecordKey::Participant(p.record.id.clone()));
            }
            for w in &words {
                batch = batch.delete(RecordKey::word(&room.id, &w.record.text));
            }
            batch = batch.delete(RecordKey::Room(room.id.clone()));

            match self.commit(batch).await {
                Ok(_) => {
                    tracing::info!(
                        room_code = %room.code,
                        participants = participants.len(),
                        words = words.len(),
                        "Room deleted"
                    );
                    self.publish(ServerMessage::RoomDeleted {
                        room_code: room.code.clone(),
                    });
                    return Ok(DeleteRoomResponse {
                        room_code: room.code,
                        participants_deleted: participants.len() as u32,
                        words_deleted: words.len() as u32,
                    });
                }
                Err(e) if e.is_conflict() => backoff(attempt).await,
                Err(e) => return Err(e),
            }
        }

        Err(RoomError::Contention {
            attempts: max_attempts,
        })
    }
}
