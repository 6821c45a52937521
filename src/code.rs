//! Room code generation and allocation

use rand::Rng;

use crate::error::RoomError;
use crate::store::SessionStore;
use crate::types::ROOM_CODE_LENGTH;

const CODE_CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
pub const MAX_ALLOCATION_ATTEMPTS: u32 = 10;

/// Generate a random room code (6 uppercase alphanumerics)
pub fn generate_room_code() -> String {
    let mut rng = rand::rng();
    (0..ROOM_CODE_LENGTH)
        .map(|_| CODE_CHARS[rng.random_range(0..CODE_CHARS.len())] as char)
        .collect()
}

/// Whether `code` has the shape of a room code (after uppercasing)
pub fn is_well_formed(code: &str) -> bool {
    code.len() == ROOM_CODE_LENGTH && code.bytes().all(|b| CODE_CHARS.contains(&b))
}

/// Find a code not held by any non-purged room
pub async fn allocate_room_code(store: &dyn SessionStore) -> Result<String, RoomError> {
    allocate_with(store, generate_room_code).await
}

pub(crate) async fn allocate_with(
    store: &dyn SessionStore,
    mut generate: impl FnMut() -> String,
) -> Result<String, RoomError> {
    for attempt in 1..=MAX_ALLOCATION_ATTEMPTS {
        let candidate = generate();
        let taken = store
            .room_by_code(&candidate)
            .await?
            .is_some_and(|room| !room.record.is_purged());

        if !taken {
            return Ok(candidate);
        }
        tracing::debug!(attempt, code = %candidate, "Room code collision");
    }

    Err(RoomError::AllocationExhausted {
        attempts: MAX_ALLOCATION_ATTEMPTS,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::sample_room;
    use crate::store::{MemoryStore, Record, WriteBatch};

    #[test]
    fn test_generated_code_shape() {
        for _ in 0..100 {
            let code = generate_room_code();
            assert!(is_well_formed(&code), "bad code {code}");
        }
    }

    #[test]
    fn test_is_well_formed() {
        assert!(is_well_formed("AB12CD"));
        assert!(!is_well_formed("ab12cd"));
        assert!(!is_well_formed("AB12C"));
        assert!(!is_well_formed("AB-2CD"));
    }

    #[tokio::test]
    async fn test_sequential_allocations_differ() {
        let store = MemoryStore::new();
        let a = allocate_room_code(&store).await.unwrap();
        let b = allocate_room_code(&store).await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_skips_taken_codes() {
        let store = MemoryStore::new();
        store
            .commit(WriteBatch::new().put(Record::Room(sample_room("r1", "AAAAAA"))))
            .await
            .unwrap();

        let mut candidates = vec!["BBBBBB".to_string(), "AAAAAA".to_string()];
        let code = allocate_with(&store, || candidates.pop().unwrap())
            .await
            .unwrap();
        assert_eq!(code, "BBBBBB");
    }

    #[tokio::test]
    async fn test_purged_rooms_release_their_code() {
        let store = MemoryStore::new();
        let mut room = sample_room("r1", "AAAAAA");
        room.purged_at = Some(chrono::Utc::now());
        store
            .commit(WriteBatch::new().put(Record::Room(room)))
            .await
            .unwrap();

        let code = allocate_with(&store, || "AAAAAA".to_string()).await.unwrap();
        assert_eq!(code, "AAAAAA");
    }

    #[tokio::test]
    async fn test_exhaustion_is_reported() {
        let store = MemoryStore::new();
        store
            .commit(WriteBatch::new().put(Record::Room(sample_room("r1", "AAAAAA"))))
            .await
            .unwrap();

        let result = allocate_with(&store, || "AAAAAA".to_string()).await;
        assert!(matches!(
            result,
            Err(RoomError::AllocationExhausted { attempts: 10 })
        ));
    }
}
