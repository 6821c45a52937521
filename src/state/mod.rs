pub mod cleanup;
pub mod participant;
pub mod room;
pub mod word;

use crate::config::RoomConfig;
use crate::error::{RoomError, RoomResult};
use crate::protocol::ServerMessage;
use crate::store::{MemoryStore, SessionStore, WriteBatch};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Shared application state.
///
/// Holds no room data of its own: every read and write goes through the
/// store, so several processes can serve the same rooms.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn SessionStore>,
    pub config: Arc<RoomConfig>,
    /// Broadcast channel for live room updates
    pub broadcast: broadcast::Sender<ServerMessage>,
}

impl AppState {
    pub fn new(store: Arc<dyn SessionStore>, config: RoomConfig) -> Self {
        let (tx, _rx) = broadcast::channel(256);
        Self {
            store,
            config: Arc::new(config),
            broadcast: tx,
        }
    }

    /// State over a fresh in-memory store with default config
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()), RoomConfig::default())
    }

    /// Commit a batch, bounded by the configured deadline
    pub(crate) async fn commit(&self, batch: WriteBatch) -> RoomResult<u64> {
        let deadline = self.config.commit_timeout;
        match tokio::time::timeout(deadline, self.store.commit(batch)).await {
            Ok(result) => Ok(result?),
            Err(_) => {
                tracing::warn!(?deadline, "Store commit timed out");
                Err(RoomError::Timeout(deadline))
            }
        }
    }

    /// Send to live viewers. No receivers connected is fine.
    pub(crate) fn publish(&self, msg: ServerMessage) {
        let _ = self.broadcast.send(msg);
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::in_memory()
    }
}

/// Sleep before retrying a conflicting commit (exponential, jittered)
pub(crate) async fn backoff(attempt: u32) {
    let base = 5u64 << attempt.min(6);
    let jitter = rand::rng().random_range(0..=base);
    tokio::time::sleep(Duration::from_millis(base + jitter)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::sample_room;
    use crate::store::{Record, StoreError};

    #[tokio::test]
    async fn test_commit_surfaces_store_errors() {
        let state = AppState::in_memory();
        state
            .commit(WriteBatch::new().put(Record::Room(sample_room("r1", "ABC123"))))
            .await
            .unwrap();

        let clash = WriteBatch::new().put(Record::Room(sample_room("r2", "ABC123")));
        let err = state.commit(clash).await.unwrap_err();
        assert!(err.is_conflict());
        assert!(matches!(err, RoomError::Store(StoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_publish_without_receivers() {
        let state = AppState::in_memory();
        state.publish(ServerMessage::RoomDeleted {
            room_code: "ABC123".to_string(),
        });

        let mut rx = state.broadcast.subscribe();
        state.publish(ServerMessage::RoomDeleted {
            room_code: "XYZ789".to_string(),
        });
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.room_code(), Some("XYZ789"));
    }
}
