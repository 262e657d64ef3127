//! Transport abstractions over the broker protocol libraries.
//!
//! The bridge core talks to brokers only through the traits in this module:
//!
//! - [`ExchangeConnector`] → [`ExchangeConnection`] → [`ExchangeChannel`] for
//!   the topic-exchange protocol (AMQP 0-9-1)
//! - [`PubSubConnector`] → [`PubSubClient`] for the lightweight pub/sub
//!   protocol (MQTT 3.1.1)
//! - [`DeliveryStream`] / [`Delivery`] for inbound messages of either protocol
//!
//! Implementations:
//! - [`amqp::AmqpConnector`] backed by `lapin`
//! - [`mqtt::MqttConnector`] backed by `rumqttc`
//! - [`memory::MemoryBroker`], an in-process broker implementing both sides

pub mod amqp;
pub mod memory;
pub mod mqtt;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Result type alias using [`TransportError`].
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Errors reported by a transport implementation.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error(transparent)]
    Amqp(#[from] lapin::Error),

    #[error(transparent)]
    MqttClient(#[from] rumqttc::ClientError),

    #[error(transparent)]
    MqttConnection(#[from] rumqttc::ConnectionError),

    /// The broker refused the request.
    #[error("{0}")]
    Rejected(String),

    /// No acknowledgment arrived in time.
    #[error("no acknowledgment within {0:?}")]
    AckTimeout(Duration),

    /// The connection went away while the request was pending.
    #[error("connection closed")]
    Closed,
}

/// One inbound message.
#[async_trait]
pub trait Delivery: Send + Sync + 'static {
    /// Raw message body.
    fn payload(&self) -> &[u8];

    /// Positively acknowledge the delivery.
    async fn ack(&self) -> TransportResult<()>;

    /// Reject the delivery without requeueing it.
    async fn reject(&self) -> TransportResult<()>;
}

/// Ordered stream of deliveries for one subscription.
///
/// Yields `None` once the underlying subscription or connection is gone.
#[async_trait]
pub trait DeliveryStream: Send + 'static {
    type Delivery: Delivery;

    async fn next(&mut self) -> Option<TransportResult<Self::Delivery>>;
}

/// Opens connections to an exchange-protocol broker.
#[async_trait]
pub trait ExchangeConnector: Send + Sync + 'static {
    type Connection: ExchangeConnection;

    async fn connect(&self, uri: &str) -> TransportResult<Self::Connection>;
}

/// A live exchange-protocol connection.
#[async_trait]
pub trait ExchangeConnection: Send + Sync + 'static {
    type Channel: ExchangeChannel;

    async fn open_channel(&self) -> TransportResult<Self::Channel>;

    async fn close(&self) -> TransportResult<()>;
}

/// A channel multiplexed on an exchange-protocol connection.
#[async_trait]
pub trait ExchangeChannel: Send + Sync + 'static {
    type Consumer: DeliveryStream;

    /// Declare a durable topic exchange.
    async fn declare_exchange(&self, name: &str) -> TransportResult<()>;

    /// Declare a durable queue.
    async fn declare_queue(&self, name: &str) -> TransportResult<()>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str)
    -> TransportResult<()>;

    /// Publish a persistent message.
    async fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8])
    -> TransportResult<()>;

    async fn set_prefetch(&self, count: u16) -> TransportResult<()>;

    /// Start a manual-acknowledgment consumer on a queue.
    async fn consume(&self, queue: &str) -> TransportResult<Self::Consumer>;

    async fn close(&self) -> TransportResult<()>;
}

/// Everything a pub/sub client needs to reach its broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubConnectOptions {
    pub client_id: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    pub retry_interval: Duration,
    pub ack_timeout: Duration,
    pub disconnect_grace: Duration,
}

/// Opens pub/sub clients.
///
/// `connect` resolves once the broker accepted the session, or fails when the
/// broker refused the handshake. Callers bound the wait themselves; dropping
/// the future must release everything it opened.
#[async_trait]
pub trait PubSubConnector: Send + Sync + 'static {
    type Client: PubSubClient;

    async fn connect(&self, options: &PubSubConnectOptions) -> TransportResult<Self::Client>;
}

/// A live pub/sub client session.
#[async_trait]
pub trait PubSubClient: Send + Sync + 'static {
    type Subscription: DeliveryStream;

    /// Whether the session is currently up (false while reconnecting).
    fn is_connected(&self) -> bool;

    /// Publish and wait for the broker's acknowledgment.
    async fn publish(&self, topic: &str, qos: u8, payload: Vec<u8>) -> TransportResult<()>;

    /// Subscribe and wait for the broker's acknowledgment.
    async fn subscribe(&self, topic: &str, qos: u8) -> TransportResult<Self::Subscription>;

    /// Unsubscribe and wait for the broker's acknowledgment.
    async fn unsubscribe(&self, topic: &str) -> TransportResult<()>;

    async fn disconnect(&self);
}

/// Match an MQTT topic name against a topic filter (`+` and `#` wildcards).
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    // Wildcards never match topics starting with '$'
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_matches_exact() {
        assert!(topic_matches("sensors/temp", "sensors/temp"));
        assert!(!topic_matches("sensors/temp", "sensors/humidity"));
        assert!(!topic_matches("sensors/temp", "sensors/temp/room1"));
        assert!(!topic_matches("sensors/temp/room1", "sensors/temp"));
    }

    #[test]
    fn test_topic_matches_single_level() {
        assert!(topic_matches("sensors/+", "sensors/temp"));
        assert!(topic_matches("+/temp", "kitchen/temp"));
        assert!(!topic_matches("sensors/+", "sensors/temp/room1"));
        assert!(topic_matches("sensors/+", "sensors/"));
    }

    #[test]
    fn test_topic_matches_multi_level() {
        assert!(topic_matches("#", "anything/at/all"));
        assert!(topic_matches("sensors/#", "sensors/temp/room1"));
        assert!(topic_matches("sensors/#", "sensors"));
        assert!(!topic_matches("sensors/#", "actuators/valve"));
    }

    #[test]
    fn test_system_topics_hidden_from_wildcards() {
        assert!(!topic_matches("#", "$SYS/broker/uptime"));
        assert!(!topic_matches("+/broker/uptime", "$SYS/broker/uptime"));
        assert!(topic_matches("$SYS/#", "$SYS/broker/uptime"));
    }
}
