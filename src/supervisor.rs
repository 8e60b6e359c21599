use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::broker::{BrokerError, BrokerEvent, BrokerLink};
use crate::relay::{self, RelayContext};
use crate::store::SpecStore as _;

const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const CHANNEL_REBUILD_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Recovery {
    /// Rebuild only the channel on the surviving connection. Cheap (~2 s),
    /// no re-auth or TLS handshake.
    ChannelOnly,
    /// Tear down and reopen connection plus channel.
    Full,
}

/// Listens to broker lifecycle events and rebuilds the link.
///
/// Events stamped with an epoch older than the current one belong to a link
/// that was already replaced and are dropped, which makes duplicate and
/// overlapping events harmless. Recovery escalates: a failed channel rebuild
/// becomes a full reconnect, and exhausting the attempt budget ends the
/// process so the container supervisor restarts it with a clean snapshot.
pub struct Supervisor {
    ctx: Arc<RelayContext>,
    events: mpsc::UnboundedReceiver<BrokerEvent>,
    reconnect_in_flight: AtomicBool,
    attempts: u32,
}

impl Supervisor {
    pub fn new(ctx: Arc<RelayContext>, events: mpsc::UnboundedReceiver<BrokerEvent>) -> Self {
        Self {
            ctx,
            events,
            reconnect_in_flight: AtomicBool::new(false),
            attempts: 0,
        }
    }

    pub async fn run(mut self) {
        while let Some(event) = self.events.recv().await {
            if event.epoch() < self.ctx.epoch.current() {
                tracing::debug!(event = ?event, "ignoring event from a replaced link");
                continue;
            }

            match event {
                BrokerEvent::ConnectionClosed { .. } | BrokerEvent::ConnectionError { .. } => {
                    tracing::warn!(event = ?event, "connection lost, reconnecting");
                    self.recover(Recovery::Full).await;
                }
                BrokerEvent::ChannelClosed { .. } | BrokerEvent::ChannelError { .. } => {
                    let mode = if self.connection_alive().await {
                        Recovery::ChannelOnly
                    } else {
                        Recovery::Full
                    };
                    tracing::warn!(event = ?event, mode = ?mode, "channel lost, recovering");
                    self.recover(mode).await;
                }
                BrokerEvent::ConsumerCancelled { tag, .. } => {
                    self.handle_consumer_cancelled(&tag).await;
                }
            }
        }
    }

    async fn connection_alive(&self) -> bool {
        match self.ctx.link.read().await.as_ref() {
            Some(link) => link.connection_alive(),
            None => false,
        }
    }

    /// Broker-side cancel of a single consumer: the queue is gone or the
    /// subscription was revoked. Tear the consumer down without reconnecting.
    pub(crate) async fn handle_consumer_cancelled(&self, tag: &str) {
        let Some(consumer) = self.ctx.registry.find_by_tag(tag).await else {
            tracing::debug!(%tag, "cancelled consumer is no longer registered");
            return;
        };

        let queue = consumer.spec.queue.clone();
        tracing::info!(%queue, %tag, "consumer cancelled by broker, removing");

        relay::notify_finish(&self.ctx, &queue, consumer.last_message.clone());
        self.ctx.registry.remove(&queue).await;
        if let Err(err) = self.ctx.store.delete(&queue).await {
            self.ctx
                .fatal(&format!("config store failure: {err}"));
        }
    }

    async fn recover(&mut self, mut mode: Recovery) {
        if self.reconnect_in_flight.swap(true, Ordering::SeqCst) {
            return;
        }

        loop {
            self.attempts += 1;
            if self.attempts >= self.ctx.config.max_reconnect_attempts {
                self.close_link_best_effort().await;
                self.ctx
                    .fatal("reconnect attempts exhausted, exiting for a clean restart");
                break;
            }

            let delay = match mode {
                Recovery::ChannelOnly => CHANNEL_REBUILD_DELAY,
                Recovery::Full => RECONNECT_DELAY,
            };
            tokio::time::sleep(delay).await;

            let result = match mode {
                Recovery::ChannelOnly => self.rebuild_channel().await,
                Recovery::Full => self.rebuild_connection().await,
            };

            match result {
                Ok(link) => {
                    self.install_and_restore(link).await;
                    self.attempts = 0;
                    break;
                }
                Err(err) => {
                    tracing::warn!(
                        error = %err,
                        attempt = self.attempts,
                        mode = ?mode,
                        "recovery attempt failed"
                    );
                    mode = Recovery::Full;
                }
            }
        }

        self.reconnect_in_flight.store(false, Ordering::SeqCst);
    }

    async fn rebuild_channel(&self) -> Result<BrokerLink, BrokerError> {
        let current = { self.ctx.link.read().await.clone() };
        match current {
            Some(link) if link.connection_alive() => link.recreate_channel(&self.ctx.epoch).await,
            _ => Err(BrokerError::Transport(
                "connection is no longer alive".into(),
            )),
        }
    }

    async fn rebuild_connection(&self) -> Result<BrokerLink, BrokerError> {
        self.close_link_best_effort().await;
        BrokerLink::connect(
            &self.ctx.config.rabbitmq_url,
            self.ctx.events.clone(),
            &self.ctx.epoch,
        )
        .await
    }

    /// Swap in the fresh link, wipe the registry, and replay the store.
    ///
    /// The epoch was bumped when the link was built, so stale handlers from
    /// the previous channel fall through their gates while restoration runs.
    async fn install_and_restore(&self, link: BrokerLink) {
        *self.ctx.link.write().await = Some(link.clone());
        self.ctx.registry.clear().await;

        match relay::restore_from_store(&self.ctx, &link).await {
            Ok(count) => {
                tracing::info!(consumers = count, epoch = link.epoch(), "recovery complete");
            }
            Err(err) => {
                tracing::warn!(error = %err, "restoration after recovery was incomplete");
            }
        }
    }

    async fn close_link_best_effort(&self) {
        if let Some(link) = self.ctx.link.write().await.take() {
            link.close().await;
        }
    }
}
