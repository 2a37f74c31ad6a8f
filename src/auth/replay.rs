// src/auth/replay.rs
//! jti replay suppression: atomic test-and-set of "seen" with a TTL window.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;

use crate::store::Store;

/// Which guarantee the active store provides. `ProcessLocal` is a degraded
/// mode: it suppresses replays within this process only and offers no
/// cross-instance protection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayMode {
    Shared,
    ProcessLocal,
}

#[async_trait]
pub trait ReplayStore: Send + Sync {
    /// Atomically record `jti` as seen for `ttl`. Returns `true` on first
    /// sighting, `false` if already seen within the window.
    async fn check_and_set(&self, jti: &str, ttl: Duration) -> Result<bool>;

    fn mode(&self) -> ReplayMode;
}

/// Replay suppression backed by the shared durable store.
pub struct SqliteReplayStore {
    store: Store,
}

impl SqliteReplayStore {
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ReplayStore for SqliteReplayStore {
    async fn check_and_set(&self, jti: &str, ttl: Duration) -> Result<bool> {
        Ok(self.store.replay_check_and_set(jti, ttl).await?)
    }

    fn mode(&self) -> ReplayMode {
        ReplayMode::Shared
    }
}

/// In-process fallback used when no shared store is reachable. Same TTL
/// semantics, plus a sweep of expired entries on every access.
pub struct InProcessReplayStore {
    seen: Mutex<HashMap<String, Instant>>,
}

impl InProcessReplayStore {
    pub fn new() -> Self {
        Self {
            seen: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for InProcessReplayStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReplayStore for InProcessReplayStore {
    async fn check_and_set(&self, jti: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut seen = self
            .seen
            .lock()
            .map_err(|_| anyhow::anyhow!("replay set poisoned"))?;
        seen.retain(|_, expires| *expires > now);
        if seen.contains_key(jti) {
            return Ok(false);
        }
        seen.insert(jti.to_string(), now + ttl);
        Ok(true)
    }

    fn mode(&self) -> ReplayMode {
        ReplayMode::ProcessLocal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_store_rejects_second_sighting() {
        let store = InProcessReplayStore::new();
        let ttl = Duration::from_secs(300);
        assert!(store.check_and_set("jti-1", ttl).await.unwrap());
        assert!(!store.check_and_set("jti-1", ttl).await.unwrap());
        assert!(store.check_and_set("jti-2", ttl).await.unwrap());
        assert_eq!(store.mode(), ReplayMode::ProcessLocal);
    }

    #[tokio::test]
    async fn expired_entries_are_swept() {
        let store = InProcessReplayStore::new();
        assert!(store
            .check_and_set("jti-1", Duration::from_millis(5))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(store
            .check_and_set("jti-1", Duration::from_secs(300))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn shared_store_reports_shared_mode() {
        let store = Store::open_in_memory().await.unwrap();
        let replay = SqliteReplayStore::new(store);
        assert_eq!(replay.mode(), ReplayMode::Shared);
        let ttl = Duration::from_secs(300);
        assert!(replay.check_and_set("jti-9", ttl).await.unwrap());
        assert!(!replay.check_and_set("jti-9", ttl).await.unwrap());
    }
}
