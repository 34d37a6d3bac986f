use async_trait::async_trait;
use once_cell::sync::Lazy;
use std::sync::Arc;
use url::Url;
use view_api::{ActiveRoom, RoomCode, Snapshot};

use super::{decode_snapshot, encode_snapshot, Backend, RoomPolicy, SnapshotStore, StoreError};
use crate::clock::Clock;
use crate::index::{RoomIndex, RoomIndexEntry};

static CACHE_ORIGIN: Lazy<Url> = Lazy::new(|| Url::parse("https://pawpaint/").unwrap());

/// A stored response body together with the header that governs its lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
    pub body: String,
    pub cache_control: String,
}

/// A response cache addressed by request URL.
#[async_trait]
pub trait ResponseCache: Send + Sync {
    async fn lookup(&self, key: &Url) -> Option<CachedResponse>;

    async fn put(&self, key: &Url, response: CachedResponse) -> Result<(), StoreError>;

    async fn purge_expired(&self) -> usize {
        0
    }
}

pub fn room_url(code: &RoomCode) -> Url {
    let mut url = CACHE_ORIGIN.clone();
    url.set_path(&format!("/view/{code}"));
    url
}

pub fn index_url() -> Url {
    let mut url = CACHE_ORIGIN.clone();
    url.set_path("/view/_rooms");
    url
}

/// Snapshot store on a response cache.
///
/// The cache offers no secondary lookup, so each index entry carries its
/// room's image and listing never touches the per-room keys.
pub struct CacheSnapshotStore<C> {
    cache: C,
    clock: Arc<dyn Clock>,
    policy: RoomPolicy,
}

impl<C: ResponseCache> CacheSnapshotStore<C> {
    pub fn new(cache: C, clock: Arc<dyn Clock>, policy: RoomPolicy) -> Self {
        Self {
            cache,
            clock,
            policy,
        }
    }

    pub fn cache(&self) -> &C {
        &self.cache
    }

    fn storage_response(&self, body: String) -> CachedResponse {
        CachedResponse {
            body,
            cache_control: format!("public, max-age={}", self.policy.ttl.as_secs()),
        }
    }

    async fn load_index(&self) -> RoomIndex {
        match self.cache.lookup(&index_url()).await {
            Some(cached) => RoomIndex::decode(&cached.body),
            None => RoomIndex::default(),
        }
    }
}

#[async_trait]
impl<C: ResponseCache> SnapshotStore for CacheSnapshotStore<C> {
    fn backend(&self) -> Backend {
        Backend::Cache
    }

    async fn load(&self, code: &RoomCode) -> Snapshot {
        match self.cache.lookup(&room_url(code)).await {
            Some(cached) => decode_snapshot(&cached.body),
            None => Snapshot::default(),
        }
    }

    async fn save(
        &self,
        code: &RoomCode,
        image: Option<String>,
        updated_at: i64,
    ) -> Result<(), StoreError> {
        let payload = encode_snapshot(image.clone(), updated_at)?;
        self.cache
            .put(&room_url(code), self.storage_response(payload))
            .await?;

        let now = self.clock.now_ms();
        let mut index = self.load_index().await;
        index.record(
            RoomIndexEntry {
                code: code.clone(),
                updated_at: Some(updated_at),
                image,
            },
            now,
            &self.policy,
        );
        self.cache
            .put(&index_url(), self.storage_response(index.encode()?))
            .await
    }

    async fn list_active(&self) -> Result<Vec<ActiveRoom>, StoreError> {
        let now = self.clock.now_ms();
        Ok(self
            .load_index()
            .await
            .active(now, self.policy.active_window)
            .into_iter()
            .map(ActiveRoom::from)
            .collect())
    }

    async fn purge_expired(&self) -> Result<usize, StoreError> {
        Ok(self.cache.purge_expired().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryCache;
    use std::time::Duration;
    use view_api::normalize;

    const START: i64 = 1_700_000_000_000;

    fn store(capacity: usize) -> (CacheSnapshotStore<MemoryCache>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(START));
        let cache = MemoryCache::new(capacity, clock.clone());
        (
            CacheSnapshotStore::new(cache, clock.clone(), RoomPolicy::default()),
            clock,
        )
    }

    #[test]
    fn synthetic_urls() {
        let code = normalize("abc").unwrap();
        assert_eq!(room_url(&code).as_str(), "https://pawpaint/view/ABC");
        assert_eq!(index_url().as_str(), "https://pawpaint/view/_rooms");
    }

    #[tokio::test]
    async fn index_embeds_images() {
        let (store, _) = store(64);
        let code = normalize("PAINT1").unwrap();
        store
            .save(&code, Some("data:image/webp;base64,AA==".into()), START)
            .await
            .unwrap();
        let cached = store.cache().lookup(&index_url()).await.unwrap();
        assert!(cached.body.contains("data:image/webp;base64,AA=="));
        assert_eq!(cached.cache_control, "public, max-age=43200");

        let rooms = store.list_active().await.unwrap();
        assert_eq!(rooms.len(), 1);
        assert_eq!(rooms[0].image.as_deref(), Some("data:image/webp;base64,AA=="));
    }

    #[tokio::test]
    async fn touch_restamps_index_entry() {
        let (store, clock) = store(64);
        let code = normalize("SLEEPY").unwrap();
        store.save(&code, Some("data:image/png;base64,AA".into()), START).await.unwrap();
        clock.advance(Duration::from_secs(15 * 60));
        assert!(store.list_active().await.unwrap().is_empty());
        let now = clock.now_ms();
        store.touch(&code, now).await.unwrap();
        let rooms = store.list_active().await.unwrap();
        assert_eq!(rooms[0].updated_at, Some(now));
        assert_eq!(rooms[0].image.as_deref(), Some("data:image/png;base64,AA"));
    }

    #[tokio::test]
    async fn evicted_rooms_load_empty() {
        let (store, _) = store(2);
        let a = normalize("AAA").unwrap();
        let b = normalize("BBB").unwrap();
        store.save(&a, Some("data:image/png;base64,A".into()), START).await.unwrap();
        store.save(&b, Some("data:image/png;base64,B".into()), START + 1).await.unwrap();
        // capacity 2 holds the index plus one room
        assert_eq!(store.load(&a).await, Snapshot::default());
        assert_eq!(store.load(&b).await.updated_at, Some(START + 1));
    }

    #[tokio::test]
    async fn corrupt_index_reads_as_empty() {
        let (store, _) = store(8);
        store
            .cache()
            .put(
                &index_url(),
                CachedResponse {
                    body: "<html>".into(),
                    cache_control: "max-age=60".into(),
                },
            )
            .await
            .unwrap();
        assert!(store.list_active().await.unwrap().is_empty());
    }
}
