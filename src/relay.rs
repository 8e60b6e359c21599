use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, RwLock};

use crate::broker::{BrokerError, BrokerEvent, BrokerLink};
use crate::config::RelayConfig;
use crate::delivery;
use crate::epoch::Epoch;
use crate::error::RelayError;
use crate::registry::{Registry, RuntimeConsumer};
use crate::store::{SpecStore, StoreError};
use crate::types::ConsumerSpec;

/// Invoked on unrecoverable failures (store I/O, reconnect exhaustion).
///
/// The binary installs a handler that exits non-zero so the container
/// supervisor restarts the process with a consistent snapshot; tests install
/// a no-op. Library code never calls `std::process::exit` itself.
pub type FatalHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// Shared wiring for every component: store, registry, epoch counter, the
/// current broker link, the lifecycle event channel, and the outbound HTTP
/// client.
pub struct RelayContext {
    pub config: RelayConfig,
    pub store: Arc<dyn SpecStore>,
    pub registry: Registry,
    pub epoch: Epoch,
    pub link: RwLock<Option<BrokerLink>>,
    pub events: mpsc::UnboundedSender<BrokerEvent>,
    pub http: reqwest::Client,
    pub on_fatal: FatalHandler,
}

impl RelayContext {
    pub fn fatal(&self, message: &str) {
        tracing::error!(error = %message, "fatal failure");
        (self.on_fatal)(message);
    }
}

/// Registry snapshot row for `GET /active-queues`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveQueue {
    pub queue: String,
    pub webhook: String,
    pub paused: bool,
    pub message_count: u32,
    pub avg_interval_seconds: f64,
    pub estimated_completion: String,
}

/// Broker counters for `GET /queue-info/:queue`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueInfo {
    pub queue: String,
    pub message_count: u32,
    pub consumer_count: u32,
    pub is_active: bool,
}

pub(crate) async fn current_link(ctx: &RelayContext) -> Result<BrokerLink, RelayError> {
    ctx.link
        .read()
        .await
        .clone()
        .ok_or(RelayError::BrokerUnavailable)
}

fn store_op<T>(ctx: &RelayContext, result: Result<T, StoreError>) -> Result<T, RelayError> {
    match result {
        Ok(value) => Ok(value),
        Err(err) => {
            ctx.fatal(&format!("config store failure: {err}"));
            Err(RelayError::Store(err))
        }
    }
}

/// Persist a spec and start consuming its queue.
pub async fn start_consumer(
    ctx: &Arc<RelayContext>,
    spec: ConsumerSpec,
) -> Result<(), RelayError> {
    if ctx.registry.contains(&spec.queue).await {
        return Err(RelayError::AlreadyConsuming(spec.queue));
    }

    let link = current_link(ctx).await?;
    match link.check_queue(&spec.queue).await {
        Ok(_) => {}
        Err(BrokerError::NotFound) => {
            // A persisted spec must not outlive its queue.
            store_op(ctx, ctx.store.delete(&spec.queue).await)?;
            return Err(RelayError::QueueNotFound(spec.queue));
        }
        Err(err) => return Err(err.into()),
    }

    store_op(ctx, ctx.store.upsert(&spec).await)?;
    subscribe_and_run(ctx, &link, spec).await
}

/// Subscribe on the link's channel and spawn the per-queue consume loop.
///
/// The runtime consumer is registered (with its persisted `paused` flag)
/// before the loop starts, so the first delivery already observes it.
pub(crate) async fn subscribe_and_run(
    ctx: &Arc<RelayContext>,
    link: &BrokerLink,
    spec: ConsumerSpec,
) -> Result<(), RelayError> {
    let consumer = match link.subscribe(&spec.queue).await {
        Ok(consumer) => consumer,
        Err(BrokerError::NotFound) => {
            // The queue vanished between the probe and the subscribe; its
            // store row must not outlive it.
            store_op(ctx, ctx.store.delete(&spec.queue).await)?;
            return Err(RelayError::QueueNotFound(spec.queue));
        }
        Err(err) => return Err(err.into()),
    };

    let queue = spec.queue.clone();
    let tag = consumer.tag().to_string();
    tracing::info!(%queue, %tag, epoch = link.epoch(), paused = spec.paused, "consumer subscribed");

    ctx.registry
        .insert(RuntimeConsumer::new(spec, tag, link.epoch()))
        .await;

    tokio::spawn(delivery::consume_loop(
        ctx.clone(),
        link.clone(),
        consumer,
        queue,
    ));
    Ok(())
}

/// Set the paused flag. The store write leads the runtime flag: an API
/// success must survive a restart.
pub async fn pause(ctx: &Arc<RelayContext>, queue: &str) -> Result<(), RelayError> {
    let consumer = ctx
        .registry
        .get(queue)
        .await
        .ok_or_else(|| RelayError::NotConsuming(queue.to_string()))?;
    if consumer.paused {
        return Err(RelayError::AlreadyPaused(queue.to_string()));
    }

    store_op(ctx, ctx.store.set_paused(queue, true).await)?;
    ctx.registry.set_paused(queue, true).await;
    tracing::info!(%queue, "consumer paused");
    Ok(())
}

pub async fn resume(ctx: &Arc<RelayContext>, queue: &str) -> Result<(), RelayError> {
    let consumer = ctx
        .registry
        .get(queue)
        .await
        .ok_or_else(|| RelayError::NotConsuming(queue.to_string()))?;
    if !consumer.paused {
        return Err(RelayError::NotPaused(queue.to_string()));
    }

    store_op(ctx, ctx.store.set_paused(queue, false).await)?;
    ctx.registry.set_paused(queue, false).await;
    tracing::info!(%queue, "consumer resumed");
    Ok(())
}

/// Cancel the subscription, notify the finish webhook, and drop the consumer
/// from registry and store.
pub async fn stop(ctx: &Arc<RelayContext>, queue: &str) -> Result<(), RelayError> {
    let consumer = ctx
        .registry
        .get(queue)
        .await
        .ok_or_else(|| RelayError::NotConsuming(queue.to_string()))?;

    let link = current_link(ctx).await?;
    link.cancel(&consumer.broker_tag).await?;

    notify_finish(ctx, queue, consumer.last_message.clone());
    ctx.registry.remove(queue).await;
    store_op(ctx, ctx.store.delete(queue).await)?;
    tracing::info!(%queue, "consumer stopped");
    Ok(())
}

/// Registry snapshot with live broker counters.
///
/// The completion estimate ignores the pause and business-hours gates. A
/// queue observed as deleted is purged on the spot.
pub async fn active_queues(ctx: &Arc<RelayContext>) -> Result<Vec<ActiveQueue>, RelayError> {
    let consumers = ctx.registry.snapshot().await;
    let mut rows = Vec::with_capacity(consumers.len());

    for consumer in consumers {
        let link = current_link(ctx).await?;
        let stats = match link.check_queue(&consumer.spec.queue).await {
            Ok(stats) => stats,
            Err(BrokerError::NotFound) => {
                ctx.registry.remove(&consumer.spec.queue).await;
                store_op(ctx, ctx.store.delete(&consumer.spec.queue).await)?;
                continue;
            }
            Err(err) => return Err(err.into()),
        };

        let avg_interval_seconds = consumer.spec.avg_interval_seconds();
        let estimate = estimate_seconds(stats.message_count, avg_interval_seconds);
        rows.push(ActiveQueue {
            queue: consumer.spec.queue,
            webhook: consumer.spec.webhook,
            paused: consumer.paused,
            message_count: stats.message_count,
            avg_interval_seconds,
            estimated_completion: format_completion(estimate),
        });
    }

    Ok(rows)
}

pub async fn queue_info(ctx: &Arc<RelayContext>, queue: &str) -> Result<QueueInfo, RelayError> {
    let link = current_link(ctx).await?;
    let stats = link.check_queue(queue).await.map_err(|err| match err {
        BrokerError::NotFound => RelayError::QueueNotFound(queue.to_string()),
        other => other.into(),
    })?;

    Ok(QueueInfo {
        queue: queue.to_string(),
        message_count: stats.message_count,
        consumer_count: stats.consumer_count,
        is_active: ctx.registry.contains(queue).await,
    })
}

/// Rebuild the registry from persisted specs against a fresh link.
///
/// Restoration is per-spec: a queue whose probe or subscribe fails is
/// skipped, never the queues after it. Specs whose queue vanished while the
/// process was away are dropped from the store. Only store failures abort
/// (they are fatal anyway). Returns how many consumers were started.
pub async fn restore_from_store(
    ctx: &Arc<RelayContext>,
    link: &BrokerLink,
) -> Result<usize, RelayError> {
    let specs = store_op(ctx, ctx.store.load_all().await)?;
    let mut started = 0;

    for spec in specs {
        let queue = spec.queue.clone();
        match link.check_queue(&queue).await {
            Ok(_) => {}
            Err(BrokerError::NotFound) => {
                tracing::info!(%queue, "queue vanished while offline, dropping persisted consumer");
                store_op(ctx, ctx.store.delete(&queue).await)?;
                continue;
            }
            Err(err) => {
                tracing::warn!(%queue, error = %err, "queue probe failed during restore, skipping");
                continue;
            }
        }

        match subscribe_and_run(ctx, link, spec).await {
            Ok(()) => started += 1,
            Err(err @ RelayError::Store(_)) => return Err(err),
            Err(err) => {
                tracing::warn!(%queue, error = %err, "resubscribe failed during restore, skipping");
            }
        }
    }

    Ok(started)
}

/// Fire-and-forget notification that a queue finished (drained or stopped).
pub(crate) fn notify_finish(
    ctx: &Arc<RelayContext>,
    queue: &str,
    last_message: Option<serde_json::Value>,
) {
    let ctx = ctx.clone();
    let queue = queue.to_string();
    tokio::spawn(async move {
        let payload = serde_json::json!({ "queue": queue, "lastMessage": last_message });
        let result = delivery::post_json(
            &ctx.http,
            ctx.config.webhook_secret.as_deref(),
            &ctx.config.finish_webhook,
            &payload,
        )
        .await;

        match result {
            Ok(response) if !response.status().is_success() => {
                tracing::warn!(%queue, status = %response.status(), "finish webhook rejected notification");
            }
            Ok(_) => {
                tracing::info!(%queue, "finish webhook notified");
            }
            Err(err) => {
                tracing::warn!(%queue, error = %err, "finish webhook unreachable");
            }
        }
    });
}

pub(crate) fn estimate_seconds(message_count: u32, avg_interval_seconds: f64) -> u64 {
    (message_count as f64 * avg_interval_seconds).round() as u64
}

/// Render a completion estimate as `"Hh Mm Ss"`.
pub(crate) fn format_completion(total_seconds: u64) -> String {
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;
    format!("{hours}h {minutes}m {seconds}s")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::{BusinessHours, ConsumerSpec};

    fn test_context() -> Arc<RelayContext> {
        let (events, _keepalive) = mpsc::unbounded_channel();
        // The receiver half is dropped; event sends are best-effort anyway.
        Arc::new(RelayContext {
            config: RelayConfig {
                rabbitmq_url: "amqp://localhost:5672".into(),
                finish_webhook: "http://localhost:9/finish".into(),
                db_path: "consumers.db".into(),
                api_port: 0,
                max_reconnect_attempts: 10,
                timezone: chrono_tz::America::Sao_Paulo,
                webhook_secret: None,
            },
            store: Arc::new(MemoryStore::new()),
            registry: Registry::new(),
            epoch: Epoch::new(),
            link: RwLock::new(None),
            events,
            http: reqwest::Client::new(),
            on_fatal: Arc::new(|_| {}),
        })
    }

    fn spec(queue: &str) -> ConsumerSpec {
        ConsumerSpec::build(
            queue,
            "http://example.com/hook",
            1_000,
            2_000,
            BusinessHours { start: 0, end: 24 },
        )
        .expect("valid spec")
    }

    #[test]
    fn completion_is_rendered_h_m_s() {
        assert_eq!(format_completion(0), "0h 0m 0s");
        assert_eq!(format_completion(59), "0h 0m 59s");
        assert_eq!(format_completion(3_600), "1h 0m 0s");
        assert_eq!(format_completion(9_015), "2h 30m 15s");
    }

    #[test]
    fn estimate_multiplies_count_by_average() {
        assert_eq!(estimate_seconds(0, 70.0), 0);
        assert_eq!(estimate_seconds(10, 70.0), 700);
        assert_eq!(estimate_seconds(3, 1.5), 5);
    }

    #[tokio::test]
    async fn start_rejects_queue_already_consuming() {
        let ctx = test_context();
        ctx.registry
            .insert(RuntimeConsumer::new(spec("q1"), "ctag-1".into(), 1))
            .await;

        let err = start_consumer(&ctx, spec("q1")).await.expect_err("rejected");
        assert!(matches!(err, RelayError::AlreadyConsuming(_)));
    }

    #[tokio::test]
    async fn pause_requires_an_active_consumer() {
        let ctx = test_context();
        let err = pause(&ctx, "q1").await.expect_err("rejected");
        assert!(matches!(err, RelayError::NotConsuming(_)));
    }

    #[tokio::test]
    async fn pause_then_resume_round_trips_the_persisted_flag() {
        let ctx = test_context();
        ctx.store.upsert(&spec("q1")).await.expect("upsert");
        ctx.registry
            .insert(RuntimeConsumer::new(spec("q1"), "ctag-1".into(), 1))
            .await;

        pause(&ctx, "q1").await.expect("pause");
        assert!(ctx.store.load_all().await.expect("load")[0].paused);
        assert!(ctx.registry.get("q1").await.expect("present").paused);

        resume(&ctx, "q1").await.expect("resume");
        assert!(!ctx.store.load_all().await.expect("load")[0].paused);
        assert!(!ctx.registry.get("q1").await.expect("present").paused);
    }

    #[tokio::test]
    async fn double_pause_is_rejected() {
        let ctx = test_context();
        ctx.store.upsert(&spec("q1")).await.expect("upsert");
        ctx.registry
            .insert(RuntimeConsumer::new(spec("q1"), "ctag-1".into(), 1))
            .await;

        pause(&ctx, "q1").await.expect("pause");
        let err = pause(&ctx, "q1").await.expect_err("rejected");
        assert!(matches!(err, RelayError::AlreadyPaused(_)));

        resume(&ctx, "q1").await.expect("resume");
        let err = resume(&ctx, "q1").await.expect_err("rejected");
        assert!(matches!(err, RelayError::NotPaused(_)));
    }

    #[tokio::test]
    async fn stop_requires_an_active_consumer() {
        let ctx = test_context();
        let err = stop(&ctx, "q1").await.expect_err("rejected");
        assert!(matches!(err, RelayError::NotConsuming(_)));
    }

    #[tokio::test]
    async fn active_queues_is_empty_without_consumers() {
        let ctx = test_context();
        let rows = active_queues(&ctx).await.expect("snapshot");
        assert!(rows.is_empty());
    }
}
