use async_trait::async_trait;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension};
use std::{path::Path, sync::Arc, time::Duration};

use super::{KvNamespace, StoreError};
use crate::clock::Clock;

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL,
  expires_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS kv_expires_at ON kv(expires_at);
"#;

/// Durable key-value namespace on SQLite.
///
/// Expired rows stay on disk until [`KvNamespace::purge_expired`] runs but are
/// invisible to every read.
#[derive(Clone)]
pub struct SqliteKv {
    pool: Pool<SqliteConnectionManager>,
    clock: Arc<dyn Clock>,
}

impl SqliteKv {
    /// Open (creating if needed) a database file and run migrations.
    pub fn open<P: AsRef<Path>>(path: P, clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        let manager = SqliteConnectionManager::file(path)
            .with_init(|conn| conn.busy_timeout(Duration::from_secs(5)));
        Self::with_pool(Pool::new(manager)?, clock)
    }

    /// A private in-memory database. The pool is held to one connection since
    /// every SQLite memory connection is its own database.
    pub fn memory(clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        let pool = Pool::builder()
            .max_size(1)
            .build(SqliteConnectionManager::memory())?;
        Self::with_pool(pool, clock)
    }

    fn with_pool(
        pool: Pool<SqliteConnectionManager>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StoreError> {
        pool.get()?.execute_batch(SCHEMA)?;
        Ok(Self { pool, clock })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            f(&conn)
        })
        .await?
    }
}

#[async_trait]
impl KvNamespace for SqliteKv {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let key = key.to_string();
        let now = self.clock.now_ms();
        self.with_conn(move |conn| {
            let mut stmt =
                conn.prepare_cached("SELECT value FROM kv WHERE key = ?1 AND expires_at > ?2")?;
            let value = stmt
                .query_row(params![key, now], |row| row.get(0))
                .optional()?;
            Ok(value)
        })
        .await
    }

    async fn put(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError> {
        let key = key.to_string();
        let expires_at = self.clock.now_ms() + ttl.as_millis() as i64;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
                params![key, value, expires_at],
            )?;
            Ok(())
        })
        .await
    }

    async fn list(&self, prefix: &str, limit: usize) -> Result<Vec<String>, StoreError> {
        let prefix = prefix.to_string();
        let now = self.clock.now_ms();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT key FROM kv WHERE substr(key, 1, ?1) = ?2 AND expires_at > ?3 ORDER BY key LIMIT ?4",
            )?;
            let keys = stmt
                .query_map(
                    params![prefix.chars().count() as i64, prefix, now, limit as i64],
                    |row| row.get::<_, String>(0),
                )?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(keys)
        })
        .await
    }

    async fn purge_expired(&self) -> Result<usize, StoreError> {
        let now = self.clock.now_ms();
        self.with_conn(move |conn| Ok(conn.execute("DELETE FROM kv WHERE expires_at <= ?1", [now])?))
            .await
    }
}
