use async_trait::async_trait;
use futures::future::try_join_all;
use std::{sync::Arc, time::Duration};
use tracing::warn;
use view_api::{normalize, ActiveRoom, RoomCode, Snapshot};

use super::{decode_snapshot, encode_snapshot, Backend, RoomPolicy, SnapshotStore, StoreError};
use crate::clock::Clock;
use crate::index::{is_within, sort_newest_first, RoomIndex, RoomIndexEntry};

pub const ROOM_KEY_PREFIX: &str = "room:";
pub const ROOM_INDEX_KEY: &str = "rooms:index";

/// A flat string namespace with per-key expiry and prefix listing.
#[async_trait]
pub trait KvNamespace: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Store `value` under `key`, replacing any previous value, for `ttl`.
    async fn put(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError>;

    /// Up to `limit` live keys starting with `prefix`, in key order.
    async fn list(&self, prefix: &str, limit: usize) -> Result<Vec<String>, StoreError>;

    async fn purge_expired(&self) -> Result<usize, StoreError> {
        Ok(0)
    }
}

pub fn room_key(code: &RoomCode) -> String {
    format!("{ROOM_KEY_PREFIX}{code}")
}

/// Snapshot store on a durable key-value namespace.
///
/// Each room lives under `room:{code}` as JSON; the index under
/// [`ROOM_INDEX_KEY`] holds codes and timestamps only, so listing re-reads
/// every active room to get its image.
pub struct KvSnapshotStore<K> {
    kv: K,
    clock: Arc<dyn Clock>,
    policy: RoomPolicy,
}

impl<K: KvNamespace> KvSnapshotStore<K> {
    pub fn new(kv: K, clock: Arc<dyn Clock>, policy: RoomPolicy) -> Self {
        Self { kv, clock, policy }
    }

    pub fn namespace(&self) -> &K {
        &self.kv
    }

    async fn read_room(&self, key: &str) -> Result<Snapshot, StoreError> {
        Ok(self
            .kv
            .get(key)
            .await?
            .map(|raw| decode_snapshot(&raw))
            .unwrap_or_default())
    }

    async fn load_index(&self) -> Result<RoomIndex, StoreError> {
        Ok(self
            .kv
            .get(ROOM_INDEX_KEY)
            .await?
            .map(|raw| RoomIndex::decode(&raw))
            .unwrap_or_default())
    }

    async fn update_index(&self, code: &RoomCode, updated_at: i64) -> Result<(), StoreError> {
        let now = self.clock.now_ms();
        // a missing or unreadable index starts over rather than failing the save
        let mut index = self.load_index().await.unwrap_or_else(|e| {
            warn!(error = %e, "room index unreadable; rebuilding");
            RoomIndex::default()
        });
        index.record(
            RoomIndexEntry {
                code: code.clone(),
                updated_at: Some(updated_at),
                image: None,
            },
            now,
            &self.policy,
        );
        self.kv
            .put(ROOM_INDEX_KEY, index.encode()?, self.policy.ttl)
            .await
    }

    async fn resolve(&self, codes: Vec<RoomCode>) -> Result<Vec<ActiveRoom>, StoreError> {
        try_join_all(codes.into_iter().map(|code| async move {
            let snapshot = self.read_room(&room_key(&code)).await?;
            Ok::<_, StoreError>(ActiveRoom {
                code,
                updated_at: snapshot.updated_at,
                image: snapshot.image,
            })
        }))
        .await
    }

    fn keep_active(&self, mut rooms: Vec<ActiveRoom>) -> Vec<ActiveRoom> {
        let now = self.clock.now_ms();
        rooms.retain(|r| is_within(r.updated_at, now, self.policy.active_window));
        sort_newest_first(&mut rooms, |r| r.updated_at);
        rooms
    }

    async fn list_from_index(&self) -> Result<Option<Vec<ActiveRoom>>, StoreError> {
        let index = self.load_index().await?;
        if index.is_empty() {
            return Ok(None);
        }
        let now = self.clock.now_ms();
        let codes = index
            .active(now, self.policy.active_window)
            .into_iter()
            .map(|e| e.code)
            .collect();
        Ok(Some(self.resolve(codes).await?))
    }

    /// Rebuild the listing from the room keys themselves. Slow; only used
    /// when the index is absent or unreadable.
    async fn scan(&self) -> Result<Vec<ActiveRoom>, StoreError> {
        let keys = self.kv.list(ROOM_KEY_PREFIX, self.policy.max_rooms).await?;
        let codes = keys
            .iter()
            .filter_map(|key| normalize(&key[ROOM_KEY_PREFIX.len()..]).ok())
            .collect();
        self.resolve(codes).await
    }
}

#[async_trait]
impl<K: KvNamespace> SnapshotStore for KvSnapshotStore<K> {
    fn backend(&self) -> Backend {
        Backend::Kv
    }

    async fn load(&self, code: &RoomCode) -> Snapshot {
        match self.read_room(&room_key(code)).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(%code, error = %e, "snapshot read failed; treating as empty");
                Snapshot::default()
            }
        }
    }

    async fn save(
        &self,
        code: &RoomCode,
        image: Option<String>,
        updated_at: i64,
    ) -> Result<(), StoreError> {
        let payload = encode_snapshot(image, updated_at)?;
        self.kv.put(&room_key(code), payload, self.policy.ttl).await?;
        self.update_index(code, updated_at).await
    }

    async fn list_active(&self) -> Result<Vec<ActiveRoom>, StoreError> {
        match self.list_from_index().await {
            Ok(Some(rooms)) => return Ok(self.keep_active(rooms)),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "room index unavailable; falling back to key scan"),
        }
        let rooms = self.scan().await?;
        Ok(self.keep_active(rooms))
    }

    async fn purge_expired(&self) -> Result<usize, StoreError> {
        self.kv.purge_expired().await
    }
}
