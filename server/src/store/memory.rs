use async_trait::async_trait;
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::Duration,
};
use url::Url;

use super::{CachedResponse, KvNamespace, ResponseCache, StoreError};
use crate::clock::Clock;

struct KvEntry {
    value: String,
    expires_at: i64,
}

/// In-process key-value namespace with the same expiry rules as [`super::SqliteKv`].
///
/// Clones share the same underlying map.
#[derive(Clone)]
pub struct MemoryKv {
    entries: Arc<Mutex<BTreeMap<String, KvEntry>>>,
    clock: Arc<dyn Clock>,
}

impl MemoryKv {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Arc::new(Mutex::new(BTreeMap::new())),
            clock,
        }
    }

    /// Stored entries, expired ones included until purged.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl KvNamespace for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = self.clock.now_ms();
        let guard = self.entries.lock();
        Ok(guard
            .get(key)
            .filter(|e| e.expires_at > now)
            .map(|e| e.value.clone()))
    }

    async fn put(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError> {
        let expires_at = self.clock.now_ms() + ttl.as_millis() as i64;
        self.entries
            .lock()
            .insert(key.to_string(), KvEntry { value, expires_at });
        Ok(())
    }

    async fn list(&self, prefix: &str, limit: usize) -> Result<Vec<String>, StoreError> {
        let now = self.clock.now_ms();
        let guard = self.entries.lock();
        Ok(guard
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .filter(|(_, e)| e.expires_at > now)
            .take(limit)
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn purge_expired(&self) -> Result<usize, StoreError> {
        let now = self.clock.now_ms();
        let mut guard = self.entries.lock();
        let before = guard.len();
        guard.retain(|_, e| e.expires_at > now);
        Ok(before - guard.len())
    }
}

struct CacheSlot {
    response: CachedResponse,
    expires_at: Option<i64>,
    last_used: u64,
}

#[derive(Default)]
struct CacheInner {
    slots: HashMap<Url, CacheSlot>,
    tick: u64,
}

/// In-process response cache.
///
/// Honours `max-age` and `no-store` from the stored `Cache-Control` header and
/// evicts the least recently used entry once `capacity` is exceeded, so a
/// room can vanish before its max-age under pressure.
#[derive(Clone)]
pub struct MemoryCache {
    inner: Arc<Mutex<CacheInner>>,
    capacity: usize,
    clock: Arc<dyn Clock>,
}

impl MemoryCache {
    pub fn new(capacity: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CacheInner::default())),
            capacity: capacity.max(1),
            clock,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Directives this cache understands from a `Cache-Control` value.
fn cache_directives(header: &str) -> (bool, Option<u64>) {
    let mut no_store = false;
    let mut max_age = None;
    for directive in header.split(',').map(str::trim) {
        let lower = directive.to_ascii_lowercase();
        if lower == "no-store" {
            no_store = true;
        } else if let Some(secs) = lower.strip_prefix("max-age=") {
            max_age = secs.trim_matches('"').parse().ok();
        }
    }
    (no_store, max_age)
}

#[async_trait]
impl ResponseCache for MemoryCache {
    async fn lookup(&self, key: &Url) -> Option<CachedResponse> {
        let now = self.clock.now_ms();
        let mut guard = self.inner.lock();
        let expired = guard
            .slots
            .get(key)
            .map(|slot| slot.expires_at.map_or(false, |at| at <= now))?;
        if expired {
            guard.slots.remove(key);
            return None;
        }
        guard.tick += 1;
        let tick = guard.tick;
        let slot = guard.slots.get_mut(key)?;
        slot.last_used = tick;
        Some(slot.response.clone())
    }

    async fn put(&self, key: &Url, response: CachedResponse) -> Result<(), StoreError> {
        let (no_store, max_age) = cache_directives(&response.cache_control);
        let mut guard = self.inner.lock();
        if no_store {
            guard.slots.remove(key);
            return Ok(());
        }
        let expires_at = max_age.map(|secs| self.clock.now_ms() + secs as i64 * 1000);
        guard.tick += 1;
        let last_used = guard.tick;
        guard.slots.insert(
            key.clone(),
            CacheSlot {
                response,
                expires_at,
                last_used,
            },
        );
        while guard.slots.len() > self.capacity {
            let victim = guard
                .slots
                .iter()
                .min_by_key(|(_, slot)| slot.last_used)
                .map(|(k, _)| k.clone());
            match victim {
                Some(k) => {
                    guard.slots.remove(&k);
                }
                None => break,
            }
        }
        Ok(())
    }

    async fn purge_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let mut guard = self.inner.lock();
        let before = guard.slots.len();
        guard
            .slots
            .retain(|_, slot| slot.expires_at.map_or(true, |at| at > now));
        before - guard.slots.len()
    }
}
