//! brokerlink Bridge Core
//!
//! Connects to a topic-exchange broker (AMQP 0-9-1) and a publish/subscribe
//! broker (MQTT 3.1.1) in two roles each, publishes on behalf of callers and
//! collects received messages into one bounded buffer.
//!
//! # Overview
//!
//! - [`Bridge`] exposes connect, disconnect, publish, subscribe, unsubscribe
//!   and message retrieval for both protocols
//! - [`transport`] holds the broker abstractions and their implementations
//!   (`lapin`, `rumqttc` and an in-process [`MemoryBroker`])
//! - [`BridgeOptions`] tunes buffer capacity, default names and pub/sub timeouts
//!
//! # Example
//!
//! ```ignore
//! use brokerlink_core::{BridgeOptions, ConnectionConfig, LiveBridge, Protocol, PublishConfig};
//!
//! let bridge = LiveBridge::live(BridgeOptions::default())?;
//! bridge
//!     .connect_host(&ConnectionConfig::new(Protocol::PubSub, "localhost", 1883))
//!     .await?;
//! bridge
//!     .publish(&PublishConfig::new(Protocol::PubSub, "sensors/temp", "23.5"))
//!     .await?;
//! ```

mod bridge;
mod buffer;
mod config;
pub mod driver;
mod error;
mod listener;
mod options;
mod registry;
mod stats;
pub mod transport;

pub use bridge::{Bridge, LiveBridge};
pub use buffer::InboundBuffer;
pub use config::{ConnectionConfig, PublishConfig, SubscribeConfig};
pub use driver::TOLERATED_TARGET;
pub use error::{BridgeError, Result};
pub use listener::ListenerHandle;
pub use options::{
    BridgeOptions, DEFAULT_EXCHANGE, DEFAULT_MAX_QUEUE_SIZE, DEFAULT_QUEUE, EXCHANGE_PREFETCH,
    PUBSUB_QOS, PubSubOptions,
};
pub use registry::{ConnectionRegistry, RegistryGuard, RoleConnectionState, Teardown};
pub use stats::BridgeStats;
pub use transport::memory::{Failure, MemoryBroker};

// Re-export commonly used types from brokerlink-common
pub use brokerlink_common::{
    LogFormat, LoggingConfig, MessageEnvelope, MessageRecord, Protocol, Role,
};
