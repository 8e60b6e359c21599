use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use crate::store::{SpecStore, StoreError};
use crate::types::ConsumerSpec;

const BUSY_TIMEOUT_MS: u64 = 5_000;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS consumers (
    queue TEXT PRIMARY KEY,
    webhook TEXT NOT NULL,
    min_interval_ms INTEGER NOT NULL,
    max_interval_ms INTEGER NOT NULL,
    business_hours_start INTEGER NOT NULL,
    business_hours_end INTEGER NOT NULL,
    paused INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
";

/// SQLite-backed [`SpecStore`].
///
/// The connection runs in WAL mode with `synchronous=FULL`, so a mutation
/// returns only once the write-ahead log is on stable storage. Opening
/// checkpoints the log before the first read: rows committed by a process
/// that died between write and checkpoint are consolidated into the main
/// database file. rusqlite is synchronous, so every call runs under
/// `spawn_blocking`.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let conn = tokio::task::spawn_blocking(move || open_connection(&path))
            .await
            .map_err(|err| StoreError::Task(err.to_string()))??;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| StoreError::Task("store mutex poisoned".into()))?;
            f(&guard)
        })
        .await
        .map_err(|err| StoreError::Task(err.to_string()))?
    }
}

#[async_trait]
impl SpecStore for SqliteStore {
    async fn upsert(&self, spec: &ConsumerSpec) -> Result<(), StoreError> {
        let spec = spec.clone();
        self.with_conn(move |conn| {
            let now = Utc::now();
            conn.execute(
                "INSERT INTO consumers \
                 (queue, webhook, min_interval_ms, max_interval_ms, \
                  business_hours_start, business_hours_end, paused, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8) \
                 ON CONFLICT(queue) DO UPDATE SET \
                   webhook = excluded.webhook, \
                   min_interval_ms = excluded.min_interval_ms, \
                   max_interval_ms = excluded.max_interval_ms, \
                   business_hours_start = excluded.business_hours_start, \
                   business_hours_end = excluded.business_hours_end, \
                   paused = excluded.paused, \
                   updated_at = excluded.updated_at",
                params![
                    spec.queue,
                    spec.webhook,
                    spec.min_interval_ms as i64,
                    spec.max_interval_ms as i64,
                    spec.business_hours_start as i64,
                    spec.business_hours_end as i64,
                    spec.paused as i64,
                    now,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, queue: &str) -> Result<(), StoreError> {
        let queue = queue.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM consumers WHERE queue = ?1", params![queue])?;
            Ok(())
        })
        .await
    }

    async fn set_paused(&self, queue: &str, paused: bool) -> Result<(), StoreError> {
        let queue = queue.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE consumers SET paused = ?2, updated_at = ?3 WHERE queue = ?1",
                params![queue, paused as i64, Utc::now()],
            )?;
            Ok(())
        })
        .await
    }

    async fn load_all(&self) -> Result<Vec<ConsumerSpec>, StoreError> {
        self.with_conn(|conn| {
            let mut statement = conn.prepare(
                "SELECT queue, webhook, min_interval_ms, max_interval_ms, \
                        business_hours_start, business_hours_end, paused, created_at, updated_at \
                 FROM consumers ORDER BY queue",
            )?;
            let rows = statement.query_map([], |row| {
                Ok(ConsumerSpec {
                    queue: row.get(0)?,
                    webhook: row.get(1)?,
                    min_interval_ms: row.get::<_, i64>(2)? as u64,
                    max_interval_ms: row.get::<_, i64>(3)? as u64,
                    business_hours_start: row.get::<_, i64>(4)? as u8,
                    business_hours_end: row.get::<_, i64>(5)? as u8,
                    paused: row.get::<_, i64>(6)? != 0,
                    created_at: Some(row.get::<_, DateTime<Utc>>(7)?),
                    updated_at: Some(row.get::<_, DateTime<Utc>>(8)?),
                })
            })?;

            let mut specs = Vec::new();
            for row in rows {
                specs.push(row?);
            }
            Ok(specs)
        })
        .await
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| checkpoint(conn)).await
    }
}

fn open_connection(path: &Path) -> Result<Connection, StoreError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "FULL")?;
    conn.busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS))?;
    conn.execute_batch(SCHEMA)?;
    checkpoint(&conn)?;
    Ok(conn)
}

fn checkpoint(conn: &Connection) -> Result<(), StoreError> {
    conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BusinessHours;

    fn spec(queue: &str) -> ConsumerSpec {
        ConsumerSpec::build(
            queue,
            "http://example.com/hook",
            30_000,
            110_000,
            BusinessHours { start: 8, end: 21 },
        )
        .expect("valid spec")
    }

    #[tokio::test]
    async fn upsert_then_load_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteStore::open(dir.path().join("consumers.db"))
            .await
            .expect("open");

        store.upsert(&spec("q1")).await.expect("upsert");
        let all = store.load_all().await.expect("load");

        assert_eq!(all.len(), 1);
        assert_eq!(all[0].queue, "q1");
        assert_eq!(all[0].webhook, "http://example.com/hook");
        assert_eq!(all[0].min_interval_ms, 30_000);
        assert!(!all[0].paused);
        assert!(all[0].created_at.is_some());
    }

    #[tokio::test]
    async fn duplicate_upsert_keeps_one_row_and_created_at() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteStore::open(dir.path().join("consumers.db"))
            .await
            .expect("open");

        store.upsert(&spec("q1")).await.expect("upsert");
        let created = store.load_all().await.expect("load")[0].created_at;

        let mut updated = spec("q1");
        updated.webhook = "http://example.com/other".into();
        store.upsert(&updated).await.expect("upsert");

        let all = store.load_all().await.expect("load");
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].webhook, "http://example.com/other");
        assert_eq!(all[0].created_at, created);
    }

    #[tokio::test]
    async fn delete_removes_the_row() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteStore::open(dir.path().join("consumers.db"))
            .await
            .expect("open");

        store.upsert(&spec("q1")).await.expect("upsert");
        store.delete("q1").await.expect("delete");

        assert!(store.load_all().await.expect("load").is_empty());
    }

    #[tokio::test]
    async fn set_paused_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("consumers.db");

        {
            let store = SqliteStore::open(&path).await.expect("open");
            store.upsert(&spec("q1")).await.expect("upsert");
            store.set_paused("q1", true).await.expect("pause");
        }

        let store = SqliteStore::open(&path).await.expect("reopen");
        let all = store.load_all().await.expect("load");
        assert_eq!(all.len(), 1);
        assert!(all[0].paused);
    }

    #[tokio::test]
    async fn rows_written_before_a_crash_are_visible_after_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("consumers.db");

        // Simulate a process that wrote and died without a clean close: the
        // store is dropped while its WAL still holds the committed rows.
        {
            let store = SqliteStore::open(&path).await.expect("open");
            store.upsert(&spec("q1")).await.expect("upsert");
            store.upsert(&spec("q2")).await.expect("upsert");
        }

        let store = SqliteStore::open(&path).await.expect("reopen");
        let all = store.load_all().await.expect("load");
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].queue, "q1");
        assert_eq!(all[1].queue, "q2");
    }

    #[tokio::test]
    async fn pause_resume_leaves_flag_false() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteStore::open(dir.path().join("consumers.db"))
            .await
            .expect("open");

        store.upsert(&spec("q1")).await.expect("upsert");
        store.set_paused("q1", true).await.expect("pause");
        store.set_paused("q1", false).await.expect("resume");

        let all = store.load_all().await.expect("load");
        assert!(!all[0].paused);
    }
}
