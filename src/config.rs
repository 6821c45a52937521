//! Service configuration loaded from environment variables

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::types::{MAX_PARTICIPANTS_PER_ROOM, ROOM_TTL_DAYS};

#[derive(Debug, Clone)]
pub struct RoomConfig {
    /// Lifetime of a room from creation
    pub room_ttl: chrono::Duration,
    pub max_participants: u32,
    /// Period of the scheduled expiration sweep
    pub cleanup_interval: Duration,
    /// Rooms marked expired per store commit
    pub cleanup_batch_size: usize,
    /// Deadline for a single store commit
    pub commit_timeout: Duration,
    /// Attempts for optimistic read-modify-write loops before giving up
    pub max_attempts: u32,
    pub snapshot_path: Option<PathBuf>,
    pub snapshot_interval: Duration,
    pub bind_addr: SocketAddr,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            room_ttl: chrono::Duration::days(ROOM_TTL_DAYS),
            max_participants: MAX_PARTICIPANTS_PER_ROOM,
            cleanup_interval: Duration::from_secs(24 * 60 * 60),
            cleanup_batch_size: 50,
            commit_timeout: Duration::from_secs(5),
            max_attempts: 5,
            snapshot_path: None,
            snapshot_interval: Duration::from_secs(60),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring unparsable config value");
            None
        }
    }
}

impl RoomConfig {
    /// Load config from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let room_ttl = env_parse::<i64>("ROOM_TTL_HOURS")
            .filter(|hours| *hours > 0)
            .map(chrono::Duration::hours)
            .unwrap_or(defaults.room_ttl);

        let max_participants = env_parse("MAX_PARTICIPANTS")
            .filter(|max: &u32| *max > 0)
            .unwrap_or(defaults.max_participants);

        let cleanup_interval = env_parse("CLEANUP_INTERVAL_SECS")
            .filter(|secs: &u64| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(defaults.cleanup_interval);

        let cleanup_batch_size = env_parse("CLEANUP_BATCH_SIZE")
            .filter(|size: &usize| *size > 0)
            .unwrap_or(defaults.cleanup_batch_size);

        let commit_timeout = env_parse("COMMIT_TIMEOUT_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.commit_timeout);

        let max_attempts = env_parse("VOTE_MAX_ATTEMPTS")
            .filter(|n: &u32| *n > 0)
            .unwrap_or(defaults.max_attempts);

        let snapshot_path = std::env::var("WORDCLOUD_SNAPSHOT_PATH")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);

        let snapshot_interval = env_parse("SNAPSHOT_INTERVAL_SECS")
            .filter(|secs: &u64| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(defaults.snapshot_interval);

        let bind_addr = env_parse("BIND_ADDR").unwrap_or(defaults.bind_addr);

        let config = Self {
            room_ttl,
            max_participants,
            cleanup_interval,
            cleanup_batch_size,
            commit_timeout,
            max_attempts,
            snapshot_path,
            snapshot_interval,
            bind_addr,
        };

        tracing::info!(
            ttl_hours = config.room_ttl.num_hours(),
            max_participants = config.max_participants,
            cleanup_interval_secs = config.cleanup_interval.as_secs(),
            cleanup_batch_size = config.cleanup_batch_size,
            persistent = config.snapshot_path.is_some(),
            "Room config loaded"
        );

        config
    }
}
