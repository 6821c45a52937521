use super::room::{RoomEvent, Transition};
use super::AppState;
use crate::error::RoomResult;
use crate::protocol::{CleanupReport, ServerMessage};
use crate::store::{Record, RecordKey, RoomUpdate, Versioned, WriteBatch};
use crate::types::*;
use chrono::{DateTime, Utc};

/// Deletes per commit when purging a room's children
const PURGE_CHUNK_SIZE: usize = 100;

impl AppState {
    /// Expire and purge every room past its TTL.
    ///
    /// Rooms are processed in id order, `cleanup_batch_size` at a time. A
    /// failed batch is logged and skipped; its rooms still match the query
    /// and are picked up by the next run.
    pub async fn sweep_expired_rooms(&self, reason: FinishReason) -> CleanupReport {
        let now = Utc::now();
        let limit = self.config.cleanup_batch_size;
        let mut report = CleanupReport::default();
        let mut cursor: Option<RoomId> = None;

        loop {
            let batch = match self.store.expired_rooms(now, cursor.as_deref(), limit).await {
                Ok(batch) => batch,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to query expired rooms");
                    report.failed_batches += 1;
                    break;
                }
            };
            let Some(last) = batch.last() else {
                break;
            };
            cursor = Some(last.record.id.clone());
            let exhausted = batch.len() < limit;

            let rooms = match self.expire_batch(batch, reason, now).await {
                Ok(rooms) => rooms,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to expire room batch, continuing");
                    report.failed_batches += 1;
                    if exhausted {
                        break;
                    }
                    continue;
                }
            };

            for room in &rooms {
                match self.purge_room_children(room).await {
                    Ok((participants, words)) => {
                        report.rooms_cleaned += 1;
                        report.participants_deleted += participants;
                        report.words_deleted += words;
                    }
                    Err(e) => {
                        tracing::warn!(room_code = %room.code, error = %e, "Failed to purge room");
                        report.failed_batches += 1;
                    }
                }
            }

            tracing::debug!(rooms = rooms.len(), "Expired room batch processed");
            if exhausted {
                break;
            }
        }

        tracing::info!(
            ?reason,
            rooms = report.rooms_cleaned,
            participants = report.participants_deleted,
            words = report.words_deleted,
            failed_batches = report.failed_batches,
            "Expired room sweep finished"
        );
        report
    }

    /// Owner/admin-triggered sweep
    pub async fn manual_cleanup(&self) -> CleanupReport {
        self.sweep_expired_rooms(FinishReason::ManualCleanup).await
    }

    /// Mark a batch of rooms EXPIRED in one commit.
    ///
    /// If another writer touched one of them in the meantime the batch
    /// falls back to per-room transitions, which retry on their own. Rooms
    /// that fail there (deleted by their owner, say) are left out.
    async fn expire_batch(
        &self,
        batch: Vec<Versioned<Room>>,
        reason: FinishReason,
        now: DateTime<Utc>,
    ) -> RoomResult<Vec<Room>> {
        let event = RoomEvent::Expire(reason);
        let mut write = WriteBatch::new();
        let mut rooms = Vec::with_capacity(batch.len());
        let mut changed = Vec::new();

        for Versioned {
            revision,
            record: mut room,
        } in batch
        {
            if room.apply_event(event, now)? != Transition::Unchanged {
                write = write
                    .expect_revision(RecordKey::Room(room.id.clone()), revision)
                    .put(Record::Room(room.clone()));
                changed.push(room.clone());
            }
            rooms.push(room);
        }

        if write.is_empty() {
            return Ok(rooms);
        }

        match self.commit(write).await {
            Ok(_) => {
                for room in &changed {
                    self.publish(ServerMessage::RoomStateChanged {
                        room_code: room.code.clone(),
                        state: room.state,
                        finish_reason: room.finish_reason,
                    });
                }
                Ok(rooms)
            }
            Err(e) if e.is_conflict() => {
                tracing::debug!("Expire batch conflicted, falling back to per-room updates");
                let mut expired = Vec::with_capacity(rooms.len());
                for room in rooms {
                    match self.transition_room(&room.id, event, None).await {
                        Ok(room) => expired.push(room),
                        Err(e) => {
                            tracing::warn!(
                                room_code = %room.code,
                                error = %e,
                                "Failed to expire room, skipping"
                            );
                        }
                    }
                }
                Ok(expired)
            }
            Err(e) => Err(e),
        }
    }

    /// Delete a room's participants and words, keeping the room itself.
    /// Returns how many of each were deleted.
    async fn purge_room_children(&self, room: &Room) -> RoomResult<(u32, u32)> {
        let participants: Vec<RecordKey> = self
            .store
            .participants_in_room(&room.id)
            .await?
            .into_iter()
            .map(|p| RecordKey::Participant(p.record.id))
            .collect();
        let words: Vec<RecordKey> = self
            .store
            .words_in_room(&room.id)
            .await?
            .into_iter()
            .map(|w| RecordKey::word(&room.id, &w.record.text))
            .collect();

        let keys: Vec<&RecordKey> = participants.iter().chain(words.iter()).collect();
        for chunk in keys.chunks(PURGE_CHUNK_SIZE) {
            let batch = chunk
                .iter()
                .fold(WriteBatch::new(), |batch, key| batch.delete((*key).clone()));
            self.commit(batch).await?;
        }

        self.commit(
            WriteBatch::new().update_room(&room.id, RoomUpdate::MarkPurged { at: Utc::now() }),
        )
        .await?;

        tracing::debug!(
            room_code = %room.code,
            participants = participants.len(),
            words = words.len(),
            "Room purged"
        );
        Ok((participants.len() as u32, words.len() as u32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RoomConfig;
    use crate::protocol::{CreateRoomRequest, JoinRoomRequest, SubmitWordRequest};
    use crate::store::test_support::{faulty_state, Fault};
    use crate::store::MemoryStore;
    use std::sync::Arc;

    /// Room with `voters` participants who each voted, then backdated past its TTL
    async fn expired_room(state: &AppState, voters: usize, expire: bool) -> Room {
        let code = state
            .create_room(
                "owner-1",
                CreateRoomRequest {
                    title: "Old".to_string(),
                    requires_confirmation: false,
                    time_limit: None,
                },
            )
            .await
            .unwrap()
            .room_code;

        // One extra silent participant keeps the room from auto-finishing
        for i in 0..=voters {
            let joined = state
                .join_room(JoinRoomRequest {
                    room_code: code.clone(),
                    participant_name: None,
                    identity_token: format!("tok-{i}"),
                })
                .await
                .unwrap();
            if i < voters {
                state
                    .submit_word(SubmitWordRequest {
                        participant_id: joined.participant_id,
                        text: format!("word{i}"),
                    })
                    .await
                    .unwrap();
            }
        }

        let mut room = state.resolve_room(&code).await.unwrap().record;
        if expire {
            room.expires_at = Utc::now() - chrono::Duration::minutes(1);
            state
                .store
                .commit(WriteBatch::new().put(Record::Room(room.clone())))
                .await
                .unwrap();
        }
        room
    }

    #[tokio::test]
    async fn test_sweep_expires_and_purges() {
        let state = AppState::in_memory();
        let old = expired_room(&state, 2, true).await;
        let fresh = expired_room(&state, 1, false).await;

        let report = state.sweep_expired_rooms(FinishReason::Expired).await;
        assert_eq!(
            report,
            CleanupReport {
                rooms_cleaned: 1,
                participants_deleted: 3,
                words_deleted: 2,
                failed_batches: 0,
            }
        );

        // Room record survives for audit, children are gone
        let kept = state.store.room(&old.id).await.unwrap().unwrap().record;
        assert_eq!(kept.state, RoomState::Expired);
        assert_eq!(kept.finish_reason, Some(FinishReason::Expired));
        assert!(kept.is_finished);
        assert!(kept.is_purged());
        assert_eq!(kept.participant_count, 3);
        assert!(state.store.participants_in_room(&old.id).await.unwrap().is_empty());
        assert!(state.store.words_in_room(&old.id).await.unwrap().is_empty());

        let untouched = state.store.room(&fresh.id).await.unwrap().unwrap().record;
        assert_eq!(untouched.state, RoomState::Waiting);
        assert_eq!(state.store.participants_in_room(&fresh.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_second_sweep_is_noop() {
        let state = AppState::in_memory();
        expired_room(&state, 1, true).await;

        state.sweep_expired_rooms(FinishReason::Expired).await;
        let again = state.sweep_expired_rooms(FinishReason::Expired).await;
        assert_eq!(again, CleanupReport::default());
    }

    #[tokio::test]
    async fn test_sweep_pages_through_batches() {
        let config = RoomConfig {
            cleanup_batch_size: 2,
            ..RoomConfig::default()
        };
        let state = AppState::new(Arc::new(MemoryStore::new()), config);
        for _ in 0..5 {
            expired_room(&state, 1, true).await;
        }

        let report = state.manual_cleanup().await;
        assert_eq!(report.rooms_cleaned, 5);
        assert_eq!(report.words_deleted, 5);
        assert_eq!(report.failed_batches, 0);
    }

    #[tokio::test]
    async fn test_manual_cleanup_reason_and_prior_finish() {
        let state = AppState::in_memory();
        let plain = expired_room(&state, 1, true).await;

        let finished = expired_room(&state, 1, false).await;
        state.finish_room(&finished.code, "owner-1").await.unwrap();
        let mut room = state.store.room(&finished.id).await.unwrap().unwrap().record;
        room.expires_at = Utc::now() - chrono::Duration::minutes(1);
        state
            .store
            .commit(WriteBatch::new().put(Record::Room(room)))
            .await
            .unwrap();

        state.manual_cleanup().await;

        let plain = state.store.room(&plain.id).await.unwrap().unwrap().record;
        assert_eq!(plain.finish_reason, Some(FinishReason::ManualCleanup));

        let finished = state.store.room(&finished.id).await.unwrap().unwrap().record;
        assert_eq!(finished.state, RoomState::Expired);
        assert_eq!(finished.finish_reason, Some(FinishReason::OperatorEnded));
    }

    #[tokio::test]
    async fn test_failed_expire_batch_is_skipped_and_retried() {
        let config = RoomConfig {
            cleanup_batch_size: 1,
            ..RoomConfig::default()
        };
        let (state, store) = faulty_state(config);
        let first = expired_room(&state, 1, true).await;
        let second = expired_room(&state, 1, true).await;

        // The very next commit is the first batch's expire write
        store.set_fault(Some(Fault::FailAfter(0)));
        let report = state.sweep_expired_rooms(FinishReason::Expired).await;
        assert_eq!(
            report,
            CleanupReport {
                rooms_cleaned: 1,
                participants_deleted: 2,
                words_deleted: 1,
                failed_batches: 1,
            }
        );

        let rooms = [
            state.store.room(&first.id).await.unwrap().unwrap().record,
            state.store.room(&second.id).await.unwrap().unwrap().record,
        ];
        let skipped: Vec<_> = rooms.iter().filter(|r| !r.is_purged()).collect();
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].state, RoomState::Waiting);

        let retry = state.sweep_expired_rooms(FinishReason::Expired).await;
        assert_eq!(
            retry,
            CleanupReport {
                rooms_cleaned: 1,
                participants_deleted: 2,
                words_deleted: 1,
                failed_batches: 0,
            }
        );
        let skipped = state.store.room(&skipped[0].id).await.unwrap().unwrap().record;
        assert_eq!(skipped.state, RoomState::Expired);
        assert!(skipped.is_purged());
    }

    #[tokio::test]
    async fn test_failed_purge_is_rediscovered() {
        let (state, store) = faulty_state(RoomConfig::default());
        let old = expired_room(&state, 1, true).await;

        // Expire commit goes through, the first purge chunk fails
        store.set_fault(Some(Fault::FailAfter(1)));
        let report = state.sweep_expired_rooms(FinishReason::Expired).await;
        assert_eq!(report.rooms_cleaned, 0);
        assert_eq!(report.failed_batches, 1);

        let room = state.store.room(&old.id).await.unwrap().unwrap().record;
        assert_eq!(room.state, RoomState::Expired);
        assert!(!room.is_purged());
        assert_eq!(state.store.participants_in_room(&old.id).await.unwrap().len(), 2);

        let retry = state.sweep_expired_rooms(FinishReason::Expired).await;
        assert_eq!(
            retry,
            CleanupReport {
                rooms_cleaned: 1,
                participants_deleted: 2,
                words_deleted: 1,
                failed_batches: 0,
            }
        );
        assert!(state.store.room(&old.id).await.unwrap().unwrap().record.is_purged());
    }

    #[tokio::test]
    async fn test_expire_fallback_skips_deleted_room() {
        let state = AppState::in_memory();
        let gone = expired_room(&state, 1, true).await;
        let kept = expired_room(&state, 1, true).await;

        let now = Utc::now();
        let batch = state.store.expired_rooms(now, None, 10).await.unwrap();
        assert_eq!(batch.len(), 2);

        // Owner deletes one room after the sweeper read it
        state
            .store
            .commit(WriteBatch::new().delete(RecordKey::Room(gone.id.clone())))
            .await
            .unwrap();

        let expired = state
            .expire_batch(batch, FinishReason::Expired, now)
            .await
            .unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, kept.id);
        assert_eq!(expired[0].state, RoomState::Expired);
    }

    #[tokio::test]
    async fn test_purged_room_code_can_be_reused() {
        let state = AppState::in_memory();
        let old = expired_room(&state, 0, true).await;
        state.sweep_expired_rooms(FinishReason::Expired).await;

        let mut reused = crate::store::test_support::sample_room("r-new", &old.code);
        reused.created_at = Utc::now() + chrono::Duration::seconds(1);
        state
            .store
            .commit(WriteBatch::new().put(Record::Room(reused)))
            .await
            .unwrap();
        assert_eq!(state.resolve_room(&old.code).await.unwrap().record.id, "r-new");
    }
}
