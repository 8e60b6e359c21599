use std::sync::Arc;

use lapin::options::{
    BasicCancelOptions, BasicConsumeOptions, BasicQosOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ConnectionProperties, Consumer};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::epoch::Epoch;

const REPLY_SUCCESS: u16 = 200;
const AMQP_NOT_FOUND: u16 = 404;

/// Broker-side failure, reduced to what callers can act on.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The queue does not exist on the broker.
    #[error("queue not found")]
    NotFound,

    #[error("broker transport error: {0}")]
    Transport(String),
}

impl From<lapin::Error> for BrokerError {
    fn from(err: lapin::Error) -> Self {
        if is_not_found(&err) {
            BrokerError::NotFound
        } else {
            BrokerError::Transport(err.to_string())
        }
    }
}

fn is_not_found(err: &lapin::Error) -> bool {
    matches!(err, lapin::Error::ProtocolError(e) if e.get_id() == AMQP_NOT_FOUND)
}

/// Lifecycle signal observed on a broker link.
///
/// Every event carries the epoch of the link that emitted it, so the
/// supervisor can discard signals from a generation it already replaced.
/// Duplicate or overlapping events are safe to observe.
#[derive(Debug, Clone)]
pub enum BrokerEvent {
    ConnectionClosed { epoch: u64 },
    ConnectionError { epoch: u64, error: String },
    ChannelClosed { epoch: u64 },
    ChannelError { epoch: u64, error: String },
    ConsumerCancelled { epoch: u64, tag: String },
}

impl BrokerEvent {
    pub fn epoch(&self) -> u64 {
        match self {
            BrokerEvent::ConnectionClosed { epoch }
            | BrokerEvent::ConnectionError { epoch, .. }
            | BrokerEvent::ChannelClosed { epoch }
            | BrokerEvent::ChannelError { epoch, .. }
            | BrokerEvent::ConsumerCancelled { epoch, .. } => *epoch,
        }
    }
}

/// Queue counters reported by a passive declare.
#[derive(Debug, Clone, Copy)]
pub struct QueueStats {
    pub message_count: u32,
    pub consumer_count: u32,
}

/// One connection plus one consume channel to the broker.
///
/// The consume channel runs with prefetch 1, so at most one delivery across
/// all queues is unacked at any instant. Queue probes use a short-lived side
/// channel: a passive declare of a missing queue closes the channel it ran
/// on, and that must never be the consume channel.
#[derive(Clone)]
pub struct BrokerLink {
    connection: Arc<Connection>,
    channel: Channel,
    events: mpsc::UnboundedSender<BrokerEvent>,
    epoch: u64,
}

impl BrokerLink {
    /// Open a fresh connection and consume channel, bumping the epoch.
    pub async fn connect(
        url: &str,
        events: mpsc::UnboundedSender<BrokerEvent>,
        epoch_counter: &Epoch,
    ) -> Result<Self, BrokerError> {
        let connection = Connection::connect(url, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;
        channel.basic_qos(1, BasicQosOptions::default()).await?;

        let epoch = epoch_counter.bump();
        let link = Self {
            connection: Arc::new(connection),
            channel,
            events,
            epoch,
        };
        link.install_error_hook();
        tracing::info!(epoch, "broker link established");
        Ok(link)
    }

    /// Replace only the consume channel, reusing the live connection.
    pub async fn recreate_channel(&self, epoch_counter: &Epoch) -> Result<Self, BrokerError> {
        let channel = self.connection.create_channel().await?;
        channel.basic_qos(1, BasicQosOptions::default()).await?;

        let epoch = epoch_counter.bump();
        let link = Self {
            connection: Arc::clone(&self.connection),
            channel,
            events: self.events.clone(),
            epoch,
        };
        tracing::info!(epoch, "broker channel recreated");
        Ok(link)
    }

    fn install_error_hook(&self) {
        let events = self.events.clone();
        let epoch = self.epoch;
        self.connection.on_error(move |err| {
            let _ = events.send(BrokerEvent::ConnectionError {
                epoch,
                error: err.to_string(),
            });
        });
    }

    /// Epoch this link was created under.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn connection_alive(&self) -> bool {
        self.connection.status().connected()
    }

    pub fn channel_alive(&self) -> bool {
        self.channel.status().connected()
    }

    pub fn is_healthy(&self) -> bool {
        self.connection_alive() && self.channel_alive()
    }

    /// Probe a queue for its message and consumer counts.
    pub async fn check_queue(&self, queue: &str) -> Result<QueueStats, BrokerError> {
        let probe = self.connection.create_channel().await?;
        let options = QueueDeclareOptions {
            passive: true,
            ..Default::default()
        };

        match probe
            .queue_declare(queue, options, FieldTable::default())
            .await
        {
            Ok(state) => {
                // The probe channel is disposable; the broker already closed
                // it in the error branches.
                let _ = probe.close(REPLY_SUCCESS, "probe done").await;
                Ok(QueueStats {
                    message_count: state.message_count(),
                    consumer_count: state.consumer_count(),
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Register a consumer on the shared channel.
    pub async fn subscribe(&self, queue: &str) -> Result<Consumer, BrokerError> {
        self.channel
            .basic_consume(
                queue,
                "",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(Into::into)
    }

    pub async fn cancel(&self, broker_tag: &str) -> Result<(), BrokerError> {
        self.channel
            .basic_cancel(broker_tag, BasicCancelOptions::default())
            .await
            .map_err(Into::into)
    }

    /// Close channel and connection, ignoring errors.
    pub async fn close(&self) {
        let _ = self.channel.close(REPLY_SUCCESS, "shutting down").await;
        let _ = self.connection.close(REPLY_SUCCESS, "shutting down").await;
    }

    pub fn emit_channel_error(&self, error: &lapin::Error) {
        let _ = self.events.send(BrokerEvent::ChannelError {
            epoch: self.epoch,
            error: error.to_string(),
        });
    }

    pub fn emit_channel_closed(&self) {
        let _ = self
            .events
            .send(BrokerEvent::ChannelClosed { epoch: self.epoch });
    }

    pub fn emit_consumer_cancelled(&self, tag: &str) {
        let _ = self.events.send(BrokerEvent::ConsumerCancelled {
            epoch: self.epoch,
            tag: tag.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_report_their_epoch() {
        let events = [
            BrokerEvent::ConnectionClosed { epoch: 3 },
            BrokerEvent::ConnectionError {
                epoch: 3,
                error: "boom".into(),
            },
            BrokerEvent::ChannelClosed { epoch: 3 },
            BrokerEvent::ChannelError {
                epoch: 3,
                error: "boom".into(),
            },
            BrokerEvent::ConsumerCancelled {
                epoch: 3,
                tag: "ctag-1".into(),
            },
        ];
        for event in events {
            assert_eq!(event.epoch(), 3);
        }
    }
}
