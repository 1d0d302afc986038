/// Read-state cache: per-user `lastReadAt` markers kept on the client.
///
/// Markers mask the window between a local "mark as read" and the server flag
/// catching up. Persistence is best-effort: when the backend fails the cache
/// keeps working from memory for the rest of the session.
use crate::error::{InboxError, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Durable home for read markers
pub trait ReadMarkerBackend: Send + Sync {
    fn get(&self, user_id: &str, thread_id: &str) -> Result<Option<DateTime<Utc>>>;
    fn set(&self, user_id: &str, thread_id: &str, at: DateTime<Utc>) -> Result<()>;
    /// Every marker stored for `user_id`
    fn load_user(&self, user_id: &str) -> Result<Vec<(String, DateTime<Utc>)>>;
}

fn marker_key(user_id: &str, thread_id: &str) -> Vec<u8> {
    let mut key = user_id.as_bytes().to_vec();
    key.push(0);
    key.extend_from_slice(thread_id.as_bytes());
    key
}

/// sled-backed markers, one key per (user, thread)
pub struct SledReadMarkers {
    db: sled::Db,
}

impl SledReadMarkers {
    pub fn open(data_dir: &Path) -> Result<Self> {
        let db = sled::open(data_dir.join("read_state.db"))
            .map_err(|e| InboxError::Storage(format!("Failed to open read-state DB: {}", e)))?;
        Ok(Self { db })
    }
}

impl ReadMarkerBackend for SledReadMarkers {
    fn get(&self, user_id: &str, thread_id: &str) -> Result<Option<DateTime<Utc>>> {
        match self.db.get(marker_key(user_id, thread_id))? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    fn set(&self, user_id: &str, thread_id: &str, at: DateTime<Utc>) -> Result<()> {
        let value = serde_json::to_vec(&at)?;
        self.db.insert(marker_key(user_id, thread_id), value)?;
        Ok(())
    }

    fn load_user(&self, user_id: &str) -> Result<Vec<(String, DateTime<Utc>)>> {
        let mut prefix = user_id.as_bytes().to_vec();
        prefix.push(0);

        let mut out = Vec::new();
        for entry in self.db.scan_prefix(&prefix) {
            let (key, value) = entry?;
            let thread_id = String::from_utf8_lossy(&key[prefix.len()..]).to_string();
            if let Ok(at) = serde_json::from_slice::<DateTime<Utc>>(&value) {
                out.push((thread_id, at));
            }
        }
        Ok(out)
    }
}

/// Point-in-time copy of one user's markers, handed to the aggregator
#[derive(Debug, Clone, Default)]
pub struct ReadSnapshot {
    markers: HashMap<String, DateTime<Utc>>,
}

impl ReadSnapshot {
    pub fn last_read_at(&self, thread_id: &str) -> Option<DateTime<Utc>> {
        self.markers.get(thread_id).copied()
    }

    pub fn set(&mut self, thread_id: impl Into<String>, at: DateTime<Utc>) {
        self.markers.insert(thread_id.into(), at);
    }
}

#[derive(Clone)]
pub struct ReadStateCache {
    markers: Arc<RwLock<HashMap<(String, String), DateTime<Utc>>>>,
    backend: Option<Arc<dyn ReadMarkerBackend>>,
    degraded: Arc<AtomicBool>,
}

impl ReadStateCache {
    /// Session-scoped cache with no persistence
    pub fn in_memory() -> Self {
        Self {
            markers: Arc::new(RwLock::new(HashMap::new())),
            backend: None,
            degraded: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_backend(backend: Arc<dyn ReadMarkerBackend>) -> Self {
        Self {
            backend: Some(backend),
            ..Self::in_memory()
        }
    }

    /// Cache persisted under `data_dir`; falls back to memory if the DB cannot be opened
    pub fn with_storage(data_dir: &Path) -> Self {
        match SledReadMarkers::open(data_dir) {
            Ok(backend) => Self::with_backend(Arc::new(backend)),
            Err(e) => {
                warn!("Read-state storage unavailable, keeping markers in memory: {}", e);
                let cache = Self::in_memory();
                cache.degraded.store(true, Ordering::Relaxed);
                cache
            }
        }
    }

    /// True once persistence has been abandoned for this session
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    fn live_backend(&self) -> Option<&Arc<dyn ReadMarkerBackend>> {
        if self.is_degraded() {
            None
        } else {
            self.backend.as_ref()
        }
    }

    fn degrade(&self, op: &str, e: InboxError) {
        if !self.degraded.swap(true, Ordering::Relaxed) {
            warn!("Read-state {} failed, continuing in memory only: {}", op, e);
        }
    }

    /// Pull every persisted marker for `user_id` into memory
    pub async fn load_user(&self, user_id: &str) {
        let Some(backend) = self.live_backend() else {
            return;
        };
        match backend.load_user(user_id) {
            Ok(stored) => {
                let mut markers = self.markers.write().await;
                for (thread_id, at) in stored {
                    let slot = markers.entry((user_id.to_string(), thread_id)).or_insert(at);
                    *slot = (*slot).max(at);
                }
            }
            Err(e) => self.degrade("load", e),
        }
    }

    pub async fn last_read_at(&self, user_id: &str, thread_id: &str) -> Option<DateTime<Utc>> {
        let key = (user_id.to_string(), thread_id.to_string());
        if let Some(at) = self.markers.read().await.get(&key) {
            return Some(*at);
        }

        let backend = self.live_backend()?;
        match backend.get(user_id, thread_id) {
            Ok(Some(at)) => {
                let mut markers = self.markers.write().await;
                let slot = markers.entry(key).or_insert(at);
                *slot = (*slot).max(at);
                Some(*slot)
            }
            Ok(None) => None,
            Err(e) => {
                self.degrade("read", e);
                None
            }
        }
    }

    /// Record "read up to now" for a thread. Idempotent; markers never move backwards.
    pub async fn mark_thread_read(&self, user_id: &str, thread_id: &str) -> DateTime<Utc> {
        self.mark_thread_read_at(user_id, thread_id, Utc::now()).await
    }

    pub async fn mark_thread_read_at(
        &self,
        user_id: &str,
        thread_id: &str,
        at: DateTime<Utc>,
    ) -> DateTime<Utc> {
        let effective = {
            let mut markers = self.markers.write().await;
            let slot = markers
                .entry((user_id.to_string(), thread_id.to_string()))
                .or_insert(at);
            *slot = (*slot).max(at);
            *slot
        };

        if let Some(backend) = self.live_backend() {
            if let Err(e) = backend.set(user_id, thread_id, effective) {
                self.degrade("write", e);
            }
        }
        debug!("Marked {} read for {} at {}", thread_id, user_id, effective);
        effective
    }

    /// Mark every listed thread read with one shared timestamp
    pub async fn mark_all_read<I, S>(&self, user_id: &str, thread_ids: I) -> DateTime<Utc>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let now = Utc::now();
        for thread_id in thread_ids {
            self.mark_thread_read_at(user_id, thread_id.as_ref(), now).await;
        }
        now
    }

    /// True if the marker covers `as_of` (normally the thread's `lastMessageAt`)
    pub async fn is_thread_read(&self, user_id: &str, thread_id: &str, as_of: DateTime<Utc>) -> bool {
        matches!(self.last_read_at(user_id, thread_id).await, Some(at) if at >= as_of)
    }

    pub async fn snapshot(&self, user_id: &str) -> ReadSnapshot {
        let markers = self.markers.read().await;
        let mut snapshot = ReadSnapshot::default();
        for ((user, thread_id), at) in markers.iter() {
            if user == user_id {
                snapshot.set(thread_id.clone(), *at);
            }
        }
        snapshot
    }
}

impl Default for ReadStateCache {
    fn default() -> Self {
        Self::in_memory()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::TempDir;

    struct BrokenBackend;

    impl ReadMarkerBackend for BrokenBackend {
        fn get(&self, _: &str, _: &str) -> Result<Option<DateTime<Utc>>> {
            Err(InboxError::Storage("quota exceeded".into()))
        }
        fn set(&self, _: &str, _: &str, _: DateTime<Utc>) -> Result<()> {
            Err(InboxError::Storage("quota exceeded".into()))
        }
        fn load_user(&self, _: &str) -> Result<Vec<(String, DateTime<Utc>)>> {
            Err(InboxError::Storage("quota exceeded".into()))
        }
    }

    #[tokio::test]
    async fn test_mark_is_idempotent_and_forward_only() {
        let cache = ReadStateCache::in_memory();
        let t0 = Utc::now();

        cache.mark_thread_read_at("guest", "t1", t0).await;
        cache.mark_thread_read_at("guest", "t1", t0).await;
        assert_eq!(cache.last_read_at("guest", "t1").await, Some(t0));

        cache.mark_thread_read_at("guest", "t1", t0 - Duration::seconds(30)).await;
        assert_eq!(cache.last_read_at("guest", "t1").await, Some(t0));

        let later = t0 + Duration::seconds(30);
        cache.mark_thread_read_at("guest", "t1", later).await;
        assert_eq!(cache.last_read_at("guest", "t1").await, Some(later));
    }

    #[tokio::test]
    async fn test_is_thread_read() {
        let cache = ReadStateCache::in_memory();
        let t0 = Utc::now();
        assert!(!cache.is_thread_read("guest", "t1", t0).await);

        cache.mark_thread_read_at("guest", "t1", t0).await;
        assert!(cache.is_thread_read("guest", "t1", t0).await);
        assert!(!cache.is_thread_read("guest", "t1", t0 + Duration::milliseconds(1)).await);
        assert!(!cache.is_thread_read("host", "t1", t0).await);
    }

    #[tokio::test]
    async fn test_mark_all_read_and_snapshot() {
        let cache = ReadStateCache::in_memory();
        let at = cache.mark_all_read("guest", ["t1", "t2"]).await;
        cache.mark_thread_read("host", "t3").await;

        let snapshot = cache.snapshot("guest").await;
        assert_eq!(snapshot.last_read_at("t1"), Some(at));
        assert_eq!(snapshot.last_read_at("t2"), Some(at));
        assert_eq!(snapshot.last_read_at("t3"), None);
    }

    #[tokio::test]
    async fn test_persists_through_backend() {
        let temp_dir = TempDir::new().unwrap();
        let backend = Arc::new(SledReadMarkers::open(temp_dir.path()).unwrap());
        let t0 = Utc::now();

        let cache = ReadStateCache::with_backend(backend.clone());
        cache.mark_thread_read_at("guest", "t1", t0).await;
        assert!(!cache.is_degraded());

        // A fresh cache over the same backend sees the marker
        let fresh = ReadStateCache::with_backend(backend);
        fresh.load_user("guest").await;
        assert_eq!(fresh.snapshot("guest").await.last_read_at("t1"), Some(t0));
    }

    #[tokio::test]
    async fn test_broken_backend_degrades_silently() {
        let cache = ReadStateCache::with_backend(Arc::new(BrokenBackend));
        let at = cache.mark_thread_read("guest", "t1").await;

        assert!(cache.is_degraded());
        assert_eq!(cache.last_read_at("guest", "t1").await, Some(at));
        assert!(cache.is_thread_read("guest", "t1", at).await);
    }
}
