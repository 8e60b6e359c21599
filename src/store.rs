use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::types::ConsumerSpec;

/// Failure talking to the durable store.
///
/// Every variant is fatal at the process level: in-memory state and durable
/// state may only diverge when a write silently fails, so the service exits
/// and lets its supervisor restart from a consistent snapshot.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store task failed: {0}")]
    Task(String),
}

/// Durable mapping `queue -> ConsumerSpec`.
///
/// Mutations are atomic single-row writes and return only once the record is
/// on stable storage. After `open`, every record whose prior mutation
/// reported success is visible to `load_all`.
#[async_trait]
pub trait SpecStore: Send + Sync {
    /// Insert or replace the spec for its queue. `created_at` is fixed at
    /// first insert; `updated_at` is refreshed on every call.
    async fn upsert(&self, spec: &ConsumerSpec) -> Result<(), StoreError>;

    async fn delete(&self, queue: &str) -> Result<(), StoreError>;

    async fn set_paused(&self, queue: &str, paused: bool) -> Result<(), StoreError>;

    async fn load_all(&self) -> Result<Vec<ConsumerSpec>, StoreError>;

    /// Flush outstanding state; for WAL-backed stores this checkpoints the log.
    async fn close(&self) -> Result<(), StoreError>;
}

/// In-memory store for tests and lightweight embedding.
#[derive(Default)]
pub struct MemoryStore {
    specs: Mutex<HashMap<String, ConsumerSpec>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SpecStore for MemoryStore {
    async fn upsert(&self, spec: &ConsumerSpec) -> Result<(), StoreError> {
        let mut guard = self.specs.lock().await;
        let now = Utc::now();
        let mut stored = spec.clone();
        stored.created_at = guard
            .get(&spec.queue)
            .and_then(|existing| existing.created_at)
            .or(Some(now));
        stored.updated_at = Some(now);
        guard.insert(spec.queue.clone(), stored);
        Ok(())
    }

    async fn delete(&self, queue: &str) -> Result<(), StoreError> {
        self.specs.lock().await.remove(queue);
        Ok(())
    }

    async fn set_paused(&self, queue: &str, paused: bool) -> Result<(), StoreError> {
        let mut guard = self.specs.lock().await;
        if let Some(spec) = guard.get_mut(queue) {
            spec.paused = paused;
            spec.updated_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<ConsumerSpec>, StoreError> {
        let guard = self.specs.lock().await;
        let mut specs: Vec<ConsumerSpec> = guard.values().cloned().collect();
        specs.sort_by(|a, b| a.queue.cmp(&b.queue));
        Ok(specs)
    }

    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
