//! The room directory: a bounded, most-recent-first list of rooms written
//! within the retention window.
//!
//! The index is only a hint. It is rewritten as a side effect of every save
//! with no locking, so concurrent writers can drop each other's entry; the
//! lost room reappears on its next write.

use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::warn;
use view_api::{normalize, ActiveRoom, RoomCode};

use crate::store::{as_millis, RoomPolicy};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomIndexEntry {
    pub code: RoomCode,
    pub updated_at: Option<i64>,
    /// Only populated by backends that cannot look the image up cheaply.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

impl From<RoomIndexEntry> for ActiveRoom {
    fn from(entry: RoomIndexEntry) -> Self {
        ActiveRoom {
            code: entry.code,
            updated_at: entry.updated_at,
            image: entry.image,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomIndex {
    entries: Vec<RoomIndexEntry>,
}

/// True when `updated_at` lies strictly within `window` of `now`.
///
/// Timestamps come from storage, so the age saturates instead of overflowing
/// on garbage values.
pub fn is_within(updated_at: Option<i64>, now: i64, window: Duration) -> bool {
    match updated_at {
        Some(t) => now.saturating_sub(t) < window.as_millis() as i64,
        None => false,
    }
}

impl RoomIndex {
    pub fn new(entries: Vec<RoomIndexEntry>) -> Self {
        Self { entries }
    }

    /// Parse a stored index. Anything unreadable yields an empty index and
    /// individual entries with an invalid code are skipped.
    pub fn decode(raw: &str) -> Self {
        let value: Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "room index is not valid json; treating as empty");
                return Self::default();
            }
        };
        let Some(items) = value.as_array() else {
            warn!("room index is not a list; treating as empty");
            return Self::default();
        };
        let entries = items
            .iter()
            .filter_map(|item| {
                let code = normalize(item.get("code")?.as_str()?).ok()?;
                Some(RoomIndexEntry {
                    code,
                    updated_at: item.get("updatedAt").and_then(as_millis),
                    image: item
                        .get("image")
                        .and_then(Value::as_str)
                        .map(str::to_owned),
                })
            })
            .collect();
        Self { entries }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.entries)
    }

    pub fn entries(&self) -> &[RoomIndexEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Record a write: prune stale entries, drop any previous entry for the
    /// same code, prepend the new one and cap the length.
    pub fn record(&mut self, entry: RoomIndexEntry, now: i64, policy: &RoomPolicy) {
        self.entries
            .retain(|e| e.code != entry.code && is_within(e.updated_at, now, policy.index_window));
        self.entries.insert(0, entry);
        self.entries.truncate(policy.max_rooms);
    }

    /// Entries written within `window`, newest first.
    pub fn active(&self, now: i64, window: Duration) -> Vec<RoomIndexEntry> {
        let mut active: Vec<RoomIndexEntry> = self
            .entries
            .iter()
            .filter(|e| is_within(e.updated_at, now, window))
            .cloned()
            .collect();
        sort_newest_first(&mut active, |e| e.updated_at);
        active
    }
}

pub fn sort_newest_first<T>(items: &mut [T], key: impl Fn(&T) -> Option<i64>) {
    items.sort_by(|a, b| key(b).cmp(&key(a)));
}
