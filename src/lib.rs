//! A RabbitMQ→webhook forwarding service with a control-plane HTTP API.
//!
//! Operators register *queue consumers* at runtime; each consumer pulls
//! messages from a named AMQP queue and forwards their JSON payloads to a
//! per-queue webhook under two constraints: a randomized inter-message delay
//! and a daily business-hours window. Consumer definitions survive restarts
//! through an embedded SQLite store.
//!
//! ## Guarantees
//! - At-least-once forwarding (prefetch 1, ack after the webhook responds)
//! - Per-queue delivery order between reconnects
//! - Persisted consumer definitions, restored on startup and reconnect
//! - Self-healing broker link: channel rebuild, full reconnect, then
//!   process exit for a supervisor-driven restart
//!
//! ## Non-Guarantees
//! - Exactly-once delivery
//! - Ordering across reconnects
//! - Coordination across replicas
//!
//! Work that was in flight when the channel died is neutralized by an epoch
//! gate rather than cancelled: the delivery's ack/nack is suppressed and the
//! broker redelivers on the fresh channel.

pub mod api;
pub mod broker;
pub mod config;
pub mod delivery;
pub mod epoch;
pub mod error;
pub mod registry;
pub mod relay;
pub mod signing;
pub mod store;
pub mod store_sqlite;
pub mod supervisor;
pub mod types;

pub use broker::{BrokerError, BrokerEvent, BrokerLink, QueueStats};
pub use config::{ConfigError, RelayConfig};
pub use epoch::Epoch;
pub use error::RelayError;
pub use registry::{Registry, RuntimeConsumer};
pub use relay::{FatalHandler, RelayContext};
pub use store::{MemoryStore, SpecStore, StoreError};
pub use store_sqlite::SqliteStore;
pub use supervisor::Supervisor;
pub use types::{BusinessHours, ConsumerSpec, ValidationError};
