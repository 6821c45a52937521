use super::room::ensure_open;
use super::{backoff, AppState};
use crate::error::{RoomError, RoomResult};
use crate::normalize::{is_valid_key, normalize_word, validate_word};
use crate::protocol::{ServerMessage, SubmitWordRequest, SubmitWordResponse, WordEntry};
use crate::store::{Record, RecordKey, RoomUpdate, Versioned, WriteBatch};
use crate::types::*;
use chrono::{DateTime, Utc};

/// Everything one vote writes, built from a consistent set of reads
struct MergedVote {
    batch: WriteBatch,
    room: Room,
    participant_name: String,
}

/// Build the atomic batch for one vote.
///
/// The participant's revision guard makes a second concurrent vote from the
/// same participant fail, and the word guard (revision or absence) makes
/// racing voters on the same key re-read instead of overwriting each other.
fn merge_vote(
    participant: Versioned<Participant>,
    room: Room,
    existing: Option<Versioned<Word>>,
    key: &str,
    display: &str,
    now: DateTime<Utc>,
) -> MergedVote {
    let Versioned {
        revision: participant_rev,
        record: mut participant,
    } = participant;
    let word_key = RecordKey::word(&room.id, key);

    let mut batch = WriteBatch::new().expect_revision(
        RecordKey::Participant(participant.id.clone()),
        participant_rev,
    );

    let word = match existing {
        Some(Versioned {
            revision,
            record: mut word,
        }) => {
            batch = batch.expect_revision(word_key, revision);
            word.add_vote(participant.id.clone(), now);
            word
        }
        None => {
            batch = batch.expect_absent(word_key);
            Word::first_vote(
                room.id.clone(),
                key.to_string(),
                display.to_string(),
                participant.id.clone(),
                now,
            )
        }
    };

    participant.has_voted = true;
    participant.voted_at = Some(now);
    participant.submitted_word = Some(key.to_string());
    let participant_name = participant.name.clone();

    let batch = batch
        .put(Record::Word(word))
        .put(Record::Participant(participant))
        .update_room(&room.id, RoomUpdate::AddWord);

    MergedVote {
        batch,
        room,
        participant_name,
    }
}

/// Rank by votes, then first seen, then key
fn rank(words: &mut [Word]) {
    words.sort_by(|a, b| {
        b.count
            .cmp(&a.count)
            .then_with(|| a.created_at.cmp(&b.created_at))
            .then_with(|| a.text.cmp(&b.text))
    });
}

impl AppState {
    /// Submit a participant's single vote
    pub async fn submit_word(&self, req: SubmitWordRequest) -> RoomResult<SubmitWordResponse> {
        let display = validate_word(&req.text)?;
        let key = normalize_word(display);
        if !is_valid_key(&key) {
            return Err(RoomError::InvalidWord(
                "Word must contain a letter or digit".to_string(),
            ));
        }

        let max_attempts = self.config.max_attempts;
        for attempt in 0..max_attempts {
            let participant = self
                .store
                .participant(&req.participant_id)
                .await?
                .ok_or(RoomError::ParticipantNotFound)?;
            if participant.record.has_voted {
                return Err(RoomError::AlreadyVoted);
            }

            let room = self
                .store
                .room(&participant.record.room_id)
                .await?
                .ok_or(RoomError::RoomNotFound)?
                .record;
            let now = Utc::now();
            ensure_open(&room, now)?;
            if room.requires_confirmation && room.state != RoomState::Active {
                return Err(RoomError::NotStarted);
            }

            let existing = self.store.word(&room.id, &key).await?;
            let merged = merge_vote(participant, room, existing, &key, display, now);

            match self.commit(merged.batch).await {
                Ok(_) => {
                    tracing::info!(
                        room_code = %merged.room.code,
                        participant_id = %req.participant_id,
                        word = %key,
                        "Vote recorded"
                    );
                    self.publish_tally(&merged.room).await;
                    let all_voted = self.check_auto_finish(&merged.room.id).await;
                    return Ok(SubmitWordResponse {
                        word: display.to_string(),
                        participant_name: merged.participant_name,
                        all_voted,
                    });
                }
                Err(e) if e.is_conflict() => {
                    tracing::debug!(
                        participant_id = %req.participant_id,
                        attempt,
                        "Vote conflicted, retrying"
                    );
                    backoff(attempt).await;
                }
                Err(e) => return Err(e),
            }
        }

        tracing::warn!(
            participant_id = %req.participant_id,
            attempts = max_attempts,
            "Vote gave up under contention"
        );
        Err(RoomError::Contention {
            attempts: max_attempts,
        })
    }

    /// Finish the room once every active participant has voted.
    ///
    /// Runs after the vote has committed and never undoes it. Two voters may
    /// both see "all voted"; finishing twice is a no-op.
    async fn check_auto_finish(&self, room_id: &str) -> bool {
        let participants = match self.list_participants(room_id).await {
            Ok(participants) => participants,
            Err(e) => {
                tracing::warn!(room_id, error = %e, "Auto-finish check failed");
                return false;
            }
        };

        let active: Vec<_> = participants.iter().filter(|p| p.is_active).collect();
        let all_voted = !active.is_empty() && active.iter().all(|p| p.has_voted);
        if !all_voted {
            return false;
        }

        match self.finish(room_id, FinishReason::AllVoted).await {
            Ok(room) => {
                tracing::info!(room_code = %room.code, voters = active.len(), "All participants voted");
            }
            Err(e) => {
                tracing::warn!(room_id, error = %e, "Auto-finish failed");
            }
        }
        true
    }

    async fn ranked_words(&self, room_id: &str) -> RoomResult<Vec<Word>> {
        let mut words: Vec<Word> = self
            .store
            .words_in_room(room_id)
            .await?
            .into_iter()
            .map(|w| w.record)
            .collect();
        rank(&mut words);
        Ok(words)
    }

    /// Tally for a room, most voted first
    pub async fn list_words(&self, code: &str) -> RoomResult<Vec<WordEntry>> {
        let room = self.resolve_room(code).await?;
        let words = self.ranked_words(&room.record.id).await?;
        Ok(words.iter().map(WordEntry::from).collect())
    }

    async fn publish_tally(&self, room: &Room) {
        match self.ranked_words(&room.id).await {
            Ok(words) => {
                let word_count = words.iter().map(|w| w.count).sum::<u32>();
                self.publish(ServerMessage::WordsUpdated {
                    room_code: room.code.clone(),
                    words: words.iter().map(WordEntry::from).collect(),
                    word_count,
                });
            }
            Err(e) => {
                tracing::warn!(room_code = %room.code, error = %e, "Failed to read tally for broadcast");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RoomConfig;
    use crate::protocol::{CreateRoomRequest, JoinRoomRequest};
    use crate::store::test_support::{faulty_state, Fault};
    use crate::store::MemoryStore;
    use std::sync::Arc;
    use std::time::Duration;

    async fn setup(state: &AppState, requires_confirmation: bool) -> String {
        state
            .create_room(
                "owner-1",
                CreateRoomRequest {
                    title: "Retro".to_string(),
                    requires_confirmation,
                    time_limit: None,
                },
            )
            .await
            .unwrap()
            .room_code
    }

    async fn join(state: &AppState, code: &str, token: &str) -> ParticipantId {
        state
            .join_room(JoinRoomRequest {
                room_code: code.to_string(),
                participant_name: Some(token.to_string()),
                identity_token: token.to_string(),
            })
            .await
            .unwrap()
            .participant_id
    }

    fn vote(participant_id: &str, text: &str) -> SubmitWordRequest {
        SubmitWordRequest {
            participant_id: participant_id.to_string(),
            text: text.to_string(),
        }
    }

    #[tokio::test]
    async fn test_vote_gives_up_after_bounded_conflicts() {
        let (state, store) = faulty_state(RoomConfig::default());
        let code = setup(&state, false).await;
        let alice = join(&state, &code, "alice").await;
        join(&state, &code, "bob").await;

        store.set_fault(Some(Fault::Conflict));
        let err = state.submit_word(vote(&alice, "calm")).await.unwrap_err();
        assert!(matches!(err, RoomError::Contention { attempts: 5 }));
        assert!(err.is_retryable());

        store.set_fault(None);
        let participant = state.store.participant(&alice).await.unwrap().unwrap();
        assert!(!participant.record.has_voted);
        assert!(state.list_words(&code).await.unwrap().is_empty());

        // A fresh attempt goes through once the store recovers
        state.submit_word(vote(&alice, "calm")).await.unwrap();
        assert_eq!(state.list_words(&code).await.unwrap()[0].count, 1);
    }

    #[tokio::test]
    async fn test_vote_commit_deadline() {
        let config = RoomConfig {
            commit_timeout: Duration::from_millis(20),
            ..RoomConfig::default()
        };
        let (state, store) = faulty_state(config);
        let code = setup(&state, false).await;
        let alice = join(&state, &code, "alice").await;

        store.set_fault(Some(Fault::Stall(Duration::from_millis(500))));
        let err = state.submit_word(vote(&alice, "calm")).await.unwrap_err();
        assert!(matches!(err, RoomError::Timeout(d) if d == Duration::from_millis(20)));
        assert!(err.is_retryable());

        store.set_fault(None);
        let participant = state.store.participant(&alice).await.unwrap().unwrap();
        assert!(!participant.record.has_voted);
        let room = state.resolve_room(&code).await.unwrap().record;
        assert_eq!(room.word_count, 0);
    }

    #[tokio::test]
    async fn test_unswept_expired_room_rejects_votes() {
        let state = AppState::in_memory();
        let code = setup(&state, false).await;
        let alice = join(&state, &code, "alice").await;

        let mut room = state.resolve_room(&code).await.unwrap().record;
        room.expires_at = Utc::now() - chrono::Duration::minutes(1);
        state
            .store
            .commit(WriteBatch::new().put(Record::Room(room)))
            .await
            .unwrap();

        assert!(matches!(
            state.submit_word(vote(&alice, "late")).await,
            Err(RoomError::Expired)
        ));
        let stored = state.resolve_room(&code).await.unwrap().record;
        assert_eq!(stored.state, RoomState::Waiting);
        assert_eq!(stored.word_count, 0);
        assert!(state.list_words(&code).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_confirmation_gate() {
        let state = AppState::in_memory();
        let code = setup(&state, true).await;
        let p1 = join(&state, &code, "tok-1").await;
        join(&state, &code, "tok-2").await;

        assert!(matches!(
            state.submit_word(vote(&p1, "hello")).await,
            Err(RoomError::NotStarted)
        ));

        state.activate_room(&code, "owner-1").await.unwrap();
        let response = state.submit_word(vote(&p1, "hello")).await.unwrap();
        assert_eq!(response.word, "hello");
        assert!(!response.all_voted);

        let words = state.list_words(&code).await.unwrap();
        assert_eq!(words.len(), 1);
        assert_eq!(words[0].count, 1);
    }

    #[tokio::test]
    async fn test_equivalent_spellings_merge() {
        let state = AppState::in_memory();
        let code = setup(&state, false).await;
        let p1 = join(&state, &code, "tok-1").await;
        let p2 = join(&state, &code, "tok-2").await;
        join(&state, &code, "tok-3").await;

        state.submit_word(vote(&p1, "Café")).await.unwrap();
        state.submit_word(vote(&p2, "cafe")).await.unwrap();

        let room = state.resolve_room(&code).await.unwrap().record;
        let word = state.store.word(&room.id, "cafe").await.unwrap().unwrap().record;
        assert_eq!(word.count, 2);
        assert_eq!(word.submitted_by.len(), 2);
        assert_eq!(word.original_text, "Café");
        assert_eq!(state.list_words(&code).await.unwrap().len(), 1);
        assert_eq!(room.word_count, 2);
    }

    #[tokio::test]
    async fn test_last_vote_finishes_room() {
        let state = AppState::in_memory();
        let code = setup(&state, false).await;
        let p1 = join(&state, &code, "tok-1").await;
        let p2 = join(&state, &code, "tok-2").await;

        assert!(!state.submit_word(vote(&p1, "blue")).await.unwrap().all_voted);
        let last = state.submit_word(vote(&p2, "green")).await.unwrap();
        assert!(last.all_voted);

        let view = state.get_room(&code).await.unwrap();
        assert_eq!(view.state, RoomState::Finished);
        assert_eq!(view.finish_reason, Some(FinishReason::AllVoted));
    }

    #[tokio::test]
    async fn test_second_vote_rejected() {
        let state = AppState::in_memory();
        let code = setup(&state, false).await;
        let p1 = join(&state, &code, "tok-1").await;
        join(&state, &code, "tok-2").await;

        state.submit_word(vote(&p1, "blue")).await.unwrap();
        assert!(matches!(
            state.submit_word(vote(&p1, "red")).await,
            Err(RoomError::AlreadyVoted)
        ));

        let participant = state.store.participant(&p1).await.unwrap().unwrap().record;
        assert_eq!(participant.submitted_word.as_deref(), Some("blue"));
        assert!(participant.voted_at.is_some());
    }

    #[tokio::test]
    async fn test_vote_validation() {
        let state = AppState::in_memory();
        let code = setup(&state, false).await;
        let p1 = join(&state, &code, "tok-1").await;

        for bad in ["", "   ", "two$words", &"x".repeat(31), "..."] {
            assert!(
                matches!(
                    state.submit_word(vote(&p1, bad)).await,
                    Err(RoomError::InvalidWord(_))
                ),
                "accepted {bad:?}"
            );
        }
        assert!(matches!(
            state.submit_word(vote("ghost", "hello")).await,
            Err(RoomError::ParticipantNotFound)
        ));
    }

    #[tokio::test]
    async fn test_finished_room_rejects_votes() {
        let state = AppState::in_memory();
        let code = setup(&state, false).await;
        let p1 = join(&state, &code, "tok-1").await;
        state.finish_room(&code, "owner-1").await.unwrap();

        assert!(matches!(
            state.submit_word(vote(&p1, "late")).await,
            Err(RoomError::Finished)
        ));
    }

    #[test]
    fn test_ranking() {
        let mut words = vec![
            Word::first_vote("r".into(), "b".into(), "b".into(), "p1".into(), Utc::now()),
            Word::first_vote("r".into(), "a".into(), "a".into(), "p2".into(), Utc::now()),
        ];
        words[0].created_at = words[1].created_at;
        let later = Utc::now() + chrono::Duration::seconds(5);
        let mut popular =
            Word::first_vote("r".into(), "z".into(), "z".into(), "p3".into(), later);
        popular.add_vote("p4".into(), later);
        words.push(popular);

        rank(&mut words);
        let order: Vec<_> = words.iter().map(|w| w.text.as_str()).collect();
        assert_eq!(order, vec!["z", "a", "b"]);
    }

    #[tokio::test]
    async fn test_vote_broadcasts_tally() {
        let state = AppState::in_memory();
        let code = setup(&state, false).await;
        let p1 = join(&state, &code, "tok-1").await;
        join(&state, &code, "tok-2").await;

        let mut rx = state.broadcast.subscribe();
        state.submit_word(vote(&p1, "Blue")).await.unwrap();

        match rx.recv().await.unwrap() {
            ServerMessage::WordsUpdated {
                words, word_count, ..
            } => {
                assert_eq!(word_count, 1);
                assert_eq!(words[0].display_text, "Blue");
                assert_eq!(words[0].text, "blue");
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_votes_apply_at_most_once() {
        let config = RoomConfig {
            max_attempts: 50,
            ..RoomConfig::default()
        };
        let state = AppState::new(Arc::new(MemoryStore::new()), config);
        let code = setup(&state, false).await;

        let mut participants = Vec::new();
        for i in 0..20 {
            participants.push(join(&state, &code, &format!("tok-{i}")).await);
        }

        // Every participant fires the same vote three times at once,
        // across a handful of shared words
        let mut handles = Vec::new();
        for (i, participant_id) in participants.iter().enumerate() {
            for _ in 0..3 {
                let state = state.clone();
                let req = vote(participant_id, ["Café", "cafe", "tea", "Tea "][i % 4]);
                handles.push(tokio::spawn(async move { state.submit_word(req).await }));
            }
        }

        let mut accepted = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => accepted += 1,
                Err(RoomError::AlreadyVoted) => {}
                Err(e) => panic!("unexpected error {e:?}"),
            }
        }
        assert_eq!(accepted, participants.len());

        let room = state.resolve_room(&code).await.unwrap().record;
        let words = state.list_words(&code).await.unwrap();
        let tally: u32 = words.iter().map(|w| w.count).sum();
        let voted = state
            .list_participants(&room.id)
            .await
            .unwrap()
            .iter()
            .filter(|p| p.has_voted)
            .count();

        assert_eq!(words.len(), 2);
        assert_eq!(tally as usize, voted);
        assert_eq!(room.word_count, tally);
        assert_eq!(room.state, RoomState::Finished);
    }
}
