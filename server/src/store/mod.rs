//! Snapshot storage over two interchangeable backends.
//!
//! * [`KvSnapshotStore`] sits on a durable key-value namespace with per-key
//!   expiry (SQLite in production).
//! * [`CacheSnapshotStore`] sits on a response cache keyed by synthetic URLs
//!   and relies on `Cache-Control` for expiry and on the cache's own eviction.
//!
//! Callers only see [`SnapshotStore`]; [`open`] picks the backend once at
//! startup.

pub mod cache;
pub mod kv;
pub mod memory;
pub mod sqlite;

pub use cache::{CacheSnapshotStore, CachedResponse, ResponseCache};
pub use kv::{KvNamespace, KvSnapshotStore};
pub use memory::{MemoryCache, MemoryKv};
pub use sqlite::SqliteKv;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use tracing::{info, warn};
use view_api::{ActiveRoom, RoomCode, Snapshot};

use crate::clock::Clock;
use crate::config::Config;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("failed to encode value: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("backend rejected write: {0}")]
    Rejected(String),
}

/// Which backend variant serves a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Kv,
    Cache,
}

/// Retention and windowing rules shared by both backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoomPolicy {
    /// How long a snapshot survives after its last write.
    pub ttl: Duration,
    /// Index entries older than this are pruned on every index update.
    pub index_window: Duration,
    /// Only rooms written within this window are listed as active.
    pub active_window: Duration,
    /// Upper bound on index entries and on the fallback key scan.
    pub max_rooms: usize,
}

impl Default for RoomPolicy {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60 * 60 * 12),
            index_window: Duration::from_secs(60 * 60 * 12),
            active_window: Duration::from_secs(60 * 10),
            max_rooms: 100,
        }
    }
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    fn backend(&self) -> Backend;

    /// Latest snapshot for a room. Missing, expired or undecodable data all
    /// come back as an empty snapshot.
    async fn load(&self, code: &RoomCode) -> Snapshot;

    /// Replace the room's snapshot and record the write in the room index.
    async fn save(
        &self,
        code: &RoomCode,
        image: Option<String>,
        updated_at: i64,
    ) -> Result<(), StoreError>;

    /// Re-stamp a room without changing its image.
    async fn touch(&self, code: &RoomCode, updated_at: i64) -> Result<(), StoreError> {
        let current = self.load(code).await;
        self.save(code, current.image, updated_at).await
    }

    /// Rooms written within the active window, newest first.
    async fn list_active(&self) -> Result<Vec<ActiveRoom>, StoreError>;

    /// Drop expired entries to reclaim space. Expiry is already enforced on
    /// read, so this never changes what callers observe.
    async fn purge_expired(&self) -> Result<usize, StoreError> {
        Ok(0)
    }
}

/// Read a millisecond timestamp stored as any JSON number.
pub fn as_millis(value: &Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_f64().filter(|f| f.is_finite()).map(|f| f as i64))
}

/// Decode a stored snapshot, degrading to empty on anything unexpected.
pub fn decode_snapshot(raw: &str) -> Snapshot {
    match serde_json::from_str::<Value>(raw) {
        Ok(value) => Snapshot {
            image: value
                .get("image")
                .and_then(Value::as_str)
                .map(str::to_owned),
            updated_at: value.get("updatedAt").and_then(as_millis),
        },
        Err(e) => {
            warn!(error = %e, "stored snapshot is not valid json; treating as empty");
            Snapshot::default()
        }
    }
}

pub fn encode_snapshot(image: Option<String>, updated_at: i64) -> Result<String, StoreError> {
    Ok(serde_json::to_string(&Snapshot {
        image,
        updated_at: Some(updated_at),
    })?)
}

/// Build the store selected by configuration.
pub fn open(config: &Config, clock: Arc<dyn Clock>) -> Result<Arc<dyn SnapshotStore>> {
    let policy = config.rooms;
    let store: Arc<dyn SnapshotStore> = match config.storage.resolved_backend() {
        Backend::Kv => {
            let path = config.storage.kv_path_or_default();
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("creating {}", dir.display()))?;
            }
            let kv = SqliteKv::open(&path, clock.clone())
                .with_context(|| format!("opening key-value store at {}", path.display()))?;
            info!(path = %path.display(), "using durable key-value backend");
            Arc::new(KvSnapshotStore::new(kv, clock, policy))
        }
        Backend::Cache => {
            let cache = MemoryCache::new(config.storage.cache_capacity, clock.clone());
            info!(
                capacity = config.storage.cache_capacity,
                "using edge cache backend"
            );
            Arc::new(CacheSnapshotStore::new(cache, clock, policy))
        }
    };
    Ok(store)
}
