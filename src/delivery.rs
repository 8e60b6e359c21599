use std::sync::Arc;
use std::time::Duration;

use chrono::{Timelike, Utc};
use chrono_tz::Tz;
use futures_util::StreamExt;
use lapin::message::Delivery;
use lapin::options::{BasicAckOptions, BasicNackOptions};
use lapin::Consumer;
use reqwest::header::CONTENT_TYPE;
use serde_json::Value;

use crate::broker::{BrokerError, BrokerLink};
use crate::relay::{self, RelayContext};
use crate::signing;
use crate::store::SpecStore as _;

/// Result of one webhook POST.
///
/// Any HTTP response, success or error status, counts as handed off: the
/// webhook owns semantic validation and the broker is not its retry vehicle.
/// Only a missing response (connect failure, timeout) is transient.
pub(crate) enum ForwardOutcome {
    Accepted(reqwest::StatusCode),
    Transport(reqwest::Error),
}

/// Drive one consumer's delivery stream until it ends.
///
/// Stream termination while this link is still current means the broker
/// cancelled the consumer (queue deleted, forced cancel) or the channel
/// died; the supervisor is told which. A stale link's stream is left to die
/// quietly.
pub(crate) async fn consume_loop(
    ctx: Arc<RelayContext>,
    link: BrokerLink,
    mut consumer: Consumer,
    queue: String,
) {
    let epoch = link.epoch();
    let tag = consumer.tag().to_string();

    while let Some(next) = consumer.next().await {
        match next {
            Ok(delivery) => handle_delivery(&ctx, &link, &queue, epoch, delivery).await,
            Err(err) => {
                tracing::warn!(%queue, error = %err, "consumer stream failed");
                if ctx.epoch.current() == epoch {
                    link.emit_channel_error(&err);
                }
                return;
            }
        }
    }

    if ctx.epoch.current() != epoch {
        return;
    }
    if link.channel_alive() {
        tracing::info!(%queue, %tag, "broker cancelled consumer");
        link.emit_consumer_cancelled(&tag);
    } else {
        link.emit_channel_closed();
    }
}

/// Per-message pipeline: delay, pause gate, hours gate, decode, forward,
/// ack/nack, drain check, reschedule.
///
/// Every suspension point is followed by an epoch re-check; once the epoch
/// moved on, the delivery belongs to a dead channel and no broker operation
/// may touch it. The broker redelivers it on the fresh channel.
async fn handle_delivery(
    ctx: &Arc<RelayContext>,
    link: &BrokerLink,
    queue: &str,
    epoch: u64,
    delivery: Delivery,
) {
    if ctx.epoch.current() != epoch {
        return;
    }

    let delay_ms = match ctx.registry.get(queue).await {
        Some(consumer) => consumer.next_interval_ms.unwrap_or_else(|| {
            draw_interval(consumer.spec.min_interval_ms, consumer.spec.max_interval_ms)
        }),
        None => {
            // Stopped while the delivery was in flight; hand it back.
            nack_requeue(queue, &delivery).await;
            return;
        }
    };
    tokio::time::sleep(Duration::from_millis(delay_ms)).await;

    if ctx.epoch.current() != epoch {
        return;
    }

    // Re-read after the sleep: pause may have flipped meanwhile.
    let Some(consumer) = ctx.registry.get(queue).await else {
        nack_requeue(queue, &delivery).await;
        return;
    };

    if consumer.paused {
        nack_requeue(queue, &delivery).await;
        return;
    }

    let hour = local_hour(&ctx.config.timezone);
    if !within_business_hours(
        hour,
        consumer.spec.business_hours_start,
        consumer.spec.business_hours_end,
    ) {
        tracing::debug!(%queue, hour, "outside business hours, requeueing");
        nack_requeue(queue, &delivery).await;
        return;
    }

    let payload: Value = match serde_json::from_slice(&delivery.data) {
        Ok(payload) => payload,
        Err(err) => {
            tracing::warn!(%queue, error = %err, "payload is not valid JSON, requeueing");
            nack_requeue(queue, &delivery).await;
            return;
        }
    };

    match forward(ctx, &consumer.spec.webhook, &payload).await {
        ForwardOutcome::Transport(err) => {
            tracing::warn!(%queue, error = %err, "webhook unreachable, requeueing");
            nack_requeue(queue, &delivery).await;
            return;
        }
        ForwardOutcome::Accepted(status) => {
            if !status.is_success() {
                tracing::warn!(%queue, status = %status, "webhook returned an error status");
            }
            if let Err(err) = delivery.ack(BasicAckOptions::default()).await {
                tracing::warn!(%queue, error = %err, "failed to ack delivery");
                return;
            }
        }
    }

    ctx.registry.update_last(queue, payload).await;

    if ctx.epoch.current() != epoch {
        // The drain probe would race against recovery.
        return;
    }

    match link.check_queue(queue).await {
        Ok(stats) if stats.message_count == 0 => {
            teardown_drained(ctx, link, queue).await;
        }
        Ok(_) => {
            let next =
                draw_interval(consumer.spec.min_interval_ms, consumer.spec.max_interval_ms);
            ctx.registry.set_next_interval(queue, next).await;
        }
        Err(BrokerError::NotFound) => {
            tracing::info!(%queue, "queue deleted on broker, dropping consumer");
            ctx.registry.remove(queue).await;
            if let Err(err) = ctx.store.delete(queue).await {
                ctx.fatal(&format!("config store failure: {err}"));
            }
        }
        Err(err) => {
            tracing::warn!(%queue, error = %err, "queue probe failed after ack");
        }
    }
}

/// Drained queue: cancel the subscription, notify, drop from registry and
/// store. Both removals must happen or a restart resurrects the consumer.
async fn teardown_drained(ctx: &Arc<RelayContext>, link: &BrokerLink, queue: &str) {
    let Some(consumer) = ctx.registry.get(queue).await else {
        return;
    };

    tracing::info!(%queue, "queue drained, shutting the consumer down");
    if let Err(err) = link.cancel(&consumer.broker_tag).await {
        tracing::warn!(%queue, error = %err, "failed to cancel drained consumer");
    }

    relay::notify_finish(ctx, queue, consumer.last_message.clone());
    ctx.registry.remove(queue).await;
    if let Err(err) = ctx.store.delete(queue).await {
        ctx.fatal(&format!("config store failure: {err}"));
    }
}

async fn nack_requeue(queue: &str, delivery: &Delivery) {
    let options = BasicNackOptions {
        requeue: true,
        ..Default::default()
    };
    if let Err(err) = delivery.nack(options).await {
        tracing::warn!(%queue, error = %err, "failed to nack delivery");
    }
}

async fn forward(ctx: &RelayContext, webhook: &str, payload: &Value) -> ForwardOutcome {
    let result = post_json(
        &ctx.http,
        ctx.config.webhook_secret.as_deref(),
        webhook,
        payload,
    )
    .await;

    match result {
        Ok(response) => ForwardOutcome::Accepted(response.status()),
        Err(err) => ForwardOutcome::Transport(err),
    }
}

/// POST a JSON payload, attaching signature headers when a secret is set.
pub(crate) async fn post_json(
    http: &reqwest::Client,
    secret: Option<&[u8]>,
    url: &str,
    payload: &Value,
) -> Result<reqwest::Response, reqwest::Error> {
    let body = serde_json::to_vec(payload).unwrap_or_default();

    let mut request = http
        .post(url)
        .header(CONTENT_TYPE, "application/json")
        .body(body.clone());

    if let Some(secret) = secret {
        for (name, value) in signing::signature_headers(secret, &body) {
            request = request.header(name, value);
        }
    }

    request.send().await
}

/// Uniform draw over `[min, max]`, both endpoints reachable.
pub(crate) fn draw_interval(min_ms: u64, max_ms: u64) -> u64 {
    fastrand::u64(min_ms..=max_ms)
}

pub(crate) fn local_hour(tz: &Tz) -> u32 {
    Utc::now().with_timezone(tz).hour()
}

/// Half-open window check: `start <= hour < end`.
pub(crate) fn within_business_hours(hour: u32, start: u8, end: u8) -> bool {
    u32::from(start) <= hour && hour < u32::from(end)
}
