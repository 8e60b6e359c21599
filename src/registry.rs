use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::RwLock;

use crate::types::ConsumerSpec;

/// Live state of one subscribed consumer.
///
/// Created on successful subscribe and discarded on stop, drain, broker
/// cancel, or epoch change. At most one exists per queue within an epoch.
#[derive(Debug, Clone)]
pub struct RuntimeConsumer {
    pub spec: ConsumerSpec,

    /// Consumer tag assigned by the broker.
    pub broker_tag: String,

    /// Channel generation this consumer was subscribed under.
    pub epoch: u64,

    /// Runtime mirror of the persisted flag.
    pub paused: bool,

    /// Last successfully forwarded payload.
    pub last_message: Option<Value>,

    /// Delay to apply before the next forward, drawn after each message.
    pub next_interval_ms: Option<u64>,
}

impl RuntimeConsumer {
    pub fn new(spec: ConsumerSpec, broker_tag: String, epoch: u64) -> Self {
        let paused = spec.paused;
        Self {
            spec,
            broker_tag,
            epoch,
            paused,
            last_message: None,
            next_interval_ms: None,
        }
    }
}

/// In-memory mapping `queue -> RuntimeConsumer`.
///
/// Source of truth for what is currently being consumed. Reads hand out
/// clones; writers hold the lock only for the mutation itself.
#[derive(Debug, Default)]
pub struct Registry {
    inner: RwLock<HashMap<String, RuntimeConsumer>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, consumer: RuntimeConsumer) {
        let mut guard = self.inner.write().await;
        guard.insert(consumer.spec.queue.clone(), consumer);
    }

    pub async fn remove(&self, queue: &str) -> Option<RuntimeConsumer> {
        self.inner.write().await.remove(queue)
    }

    pub async fn get(&self, queue: &str) -> Option<RuntimeConsumer> {
        self.inner.read().await.get(queue).cloned()
    }

    pub async fn contains(&self, queue: &str) -> bool {
        self.inner.read().await.contains_key(queue)
    }

    pub async fn find_by_tag(&self, broker_tag: &str) -> Option<RuntimeConsumer> {
        self.inner
            .read()
            .await
            .values()
            .find(|consumer| consumer.broker_tag == broker_tag)
            .cloned()
    }

    pub async fn snapshot(&self) -> Vec<RuntimeConsumer> {
        let guard = self.inner.read().await;
        let mut consumers: Vec<RuntimeConsumer> = guard.values().cloned().collect();
        consumers.sort_by(|a, b| a.spec.queue.cmp(&b.spec.queue));
        consumers
    }

    /// Drop every consumer; used right before restoration from the store.
    pub async fn clear(&self) {
        self.inner.write().await.clear();
    }

    /// Returns false when the queue is not registered.
    pub async fn set_paused(&self, queue: &str, paused: bool) -> bool {
        let mut guard = self.inner.write().await;
        match guard.get_mut(queue) {
            Some(consumer) => {
                consumer.paused = paused;
                true
            }
            None => false,
        }
    }

    pub async fn update_last(&self, queue: &str, payload: Value) {
        let mut guard = self.inner.write().await;
        if let Some(consumer) = guard.get_mut(queue) {
            consumer.last_message = Some(payload);
        }
    }

    pub async fn set_next_interval(&self, queue: &str, interval_ms: u64) {
        let mut guard = self.inner.write().await;
        if let Some(consumer) = guard.get_mut(queue) {
            consumer.next_interval_ms = Some(interval_ms);
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BusinessHours;
    use serde_json::json;

    fn consumer(queue: &str, tag: &str, epoch: u64) -> RuntimeConsumer {
        let spec = ConsumerSpec::build(
            queue,
            "http://example.com/hook",
            1_000,
            2_000,
            BusinessHours { start: 0, end: 24 },
        )
        .expect("valid spec");
        RuntimeConsumer::new(spec, tag.to_string(), epoch)
    }

    #[tokio::test]
    async fn insert_get_remove() {
        let registry = Registry::new();
        registry.insert(consumer("q1", "ctag-1", 1)).await;

        let found = registry.get("q1").await.expect("present");
        assert_eq!(found.broker_tag, "ctag-1");
        assert_eq!(found.epoch, 1);

        registry.remove("q1").await;
        assert!(registry.get("q1").await.is_none());
    }

    #[tokio::test]
    async fn insert_overwrites_same_queue() {
        let registry = Registry::new();
        registry.insert(consumer("q1", "ctag-1", 1)).await;
        registry.insert(consumer("q1", "ctag-2", 2)).await;

        assert_eq!(registry.len().await, 1);
        assert_eq!(registry.get("q1").await.expect("present").broker_tag, "ctag-2");
    }

    #[tokio::test]
    async fn snapshot_is_sorted_by_queue() {
        let registry = Registry::new();
        registry.insert(consumer("beta", "t1", 1)).await;
        registry.insert(consumer("alpha", "t2", 1)).await;

        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot[0].spec.queue, "alpha");
        assert_eq!(snapshot[1].spec.queue, "beta");
    }

    #[tokio::test]
    async fn clear_empties_the_registry() {
        let registry = Registry::new();
        registry.insert(consumer("q1", "t1", 1)).await;
        registry.insert(consumer("q2", "t2", 1)).await;
        registry.clear().await;
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn set_paused_reports_missing_queue() {
        let registry = Registry::new();
        assert!(!registry.set_paused("q1", true).await);

        registry.insert(consumer("q1", "t1", 1)).await;
        assert!(registry.set_paused("q1", true).await);
        assert!(registry.get("q1").await.expect("present").paused);
    }

    #[tokio::test]
    async fn update_last_records_payload() {
        let registry = Registry::new();
        registry.insert(consumer("q1", "t1", 1)).await;
        registry.update_last("q1", json!({"x": 1})).await;

        let found = registry.get("q1").await.expect("present");
        assert_eq!(found.last_message, Some(json!({"x": 1})));
    }

    #[tokio::test]
    async fn find_by_tag_matches_broker_tag() {
        let registry = Registry::new();
        registry.insert(consumer("q1", "ctag-9", 1)).await;

        let found = registry.find_by_tag("ctag-9").await.expect("present");
        assert_eq!(found.spec.queue, "q1");
        assert!(registry.find_by_tag("ctag-0").await.is_none());
    }

    #[tokio::test]
    async fn paused_spec_starts_paused() {
        let mut spec = ConsumerSpec::build(
            "q1",
            "http://example.com/hook",
            0,
            0,
            BusinessHours { start: 0, end: 24 },
        )
        .expect("valid spec");
        spec.paused = true;

        let runtime = RuntimeConsumer::new(spec, "t1".into(), 3);
        assert!(runtime.paused);
    }
}
