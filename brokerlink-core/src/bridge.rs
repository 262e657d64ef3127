//! The protocol bridge.

use std::sync::Arc;

use brokerlink_common::{MessageEnvelope, Payload, Protocol, Role};

use crate::buffer::InboundBuffer;
use crate::config::{ConnectionConfig, PublishConfig, SubscribeConfig};
use crate::driver::{ExchangeDriver, PubSubDriver};
use crate::error::Result;
use crate::options::BridgeOptions;
use crate::stats::{BridgeStats, Counters};
use crate::transport::amqp::AmqpConnector;
use crate::transport::mqtt::MqttConnector;
use crate::transport::{ExchangeConnector, PubSubConnector};

/// Bridge over real brokers.
pub type LiveBridge = Bridge<AmqpConnector, MqttConnector>;

/// Host and client connections to both brokers, plus the inbound buffer fed
/// by every active subscription.
///
/// All operations take `&self`; share the bridge with an `Arc` to call it from
/// several tasks. Calls for one protocol are serialised, calls for different
/// protocols run independently.
pub struct Bridge<E: ExchangeConnector, P: PubSubConnector> {
    options: BridgeOptions,
    buffer: Arc<InboundBuffer>,
    counters: Arc<Counters>,
    exchange: ExchangeDriver<E>,
    pubsub: PubSubDriver<P>,
}

impl LiveBridge {
    /// Create a bridge talking to real brokers.
    pub fn live(options: BridgeOptions) -> Result<Self> {
        Self::new(options, AmqpConnector::new(), MqttConnector::new())
    }
}

impl<E: ExchangeConnector, P: PubSubConnector> Bridge<E, P> {
    /// Create a bridge over the given connectors.
    pub fn new(options: BridgeOptions, exchange_connector: E, pubsub_connector: P) -> Result<Self> {
        options.validate()?;

        let buffer = Arc::new(InboundBuffer::new(options.max_queue_size));
        let counters = Arc::new(Counters::default());
        let exchange =
            ExchangeDriver::new(exchange_connector, &options, buffer.clone(), counters.clone());
        let pubsub = PubSubDriver::new(
            pubsub_connector,
            &options.pubsub,
            buffer.clone(),
            counters.clone(),
        );

        Ok(Self {
            options,
            buffer,
            counters,
            exchange,
            pubsub,
        })
    }

    pub fn options(&self) -> &BridgeOptions {
        &self.options
    }

    /// Connect with the role carried by `config`.
    pub async fn connect(&self, config: &ConnectionConfig) -> Result<()> {
        self.connect_role(config, config.role).await
    }

    /// Connect as host (publishing side), whatever the role in `config`.
    pub async fn connect_host(&self, config: &ConnectionConfig) -> Result<()> {
        self.connect_role(config, Role::Host).await
    }

    /// Connect as client (subscribing side), whatever the role in `config`.
    pub async fn connect_client(&self, config: &ConnectionConfig) -> Result<()> {
        self.connect_role(config, Role::Client).await
    }

    async fn connect_role(&self, config: &ConnectionConfig, role: Role) -> Result<()> {
        match config.protocol {
            Protocol::Exchange => self.exchange.connect(config, role).await,
            Protocol::PubSub => self.pubsub.connect(config, role).await,
        }
    }

    /// Disconnect the host connection of `protocol`.
    pub async fn disconnect(&self, protocol: Protocol) -> Result<()> {
        self.disconnect_role(protocol, Role::Host).await
    }

    pub async fn disconnect_host(&self, protocol: Protocol) -> Result<()> {
        self.disconnect_role(protocol, Role::Host).await
    }

    pub async fn disconnect_client(&self, protocol: Protocol) -> Result<()> {
        self.disconnect_role(protocol, Role::Client).await
    }

    /// Disconnect one role. Always succeeds, also when nothing is connected.
    pub async fn disconnect_role(&self, protocol: Protocol, role: Role) -> Result<()> {
        match protocol {
            Protocol::Exchange => self.exchange.disconnect(role).await,
            Protocol::PubSub => self.pubsub.disconnect(role).await,
        }
        Ok(())
    }

    /// Publish a message on the host connection of `config.protocol`.
    ///
    /// Messages that parse as a [`MessageRecord`](brokerlink_common::MessageRecord)
    /// are sent re-serialised, anything else is sent as-is.
    pub async fn publish(&self, config: &PublishConfig) -> Result<()> {
        let payload = Payload::parse(&config.message);
        let body = payload.encode()?;
        tracing::trace!(
            protocol = %config.protocol,
            topic = %config.topic,
            record = payload.is_record(),
            "Publishing"
        );

        match config.protocol {
            Protocol::Exchange => self.exchange.publish(&config.topic, &body).await,
            Protocol::PubSub => self.pubsub.publish(&config.topic, &body).await,
        }
    }

    /// Start receiving from `config.topic` on the client connection.
    pub async fn subscribe(&self, config: &SubscribeConfig) -> Result<()> {
        match config.protocol {
            Protocol::Exchange => self.exchange.subscribe(&config.topic).await,
            Protocol::PubSub => self.pubsub.subscribe(&config.topic).await,
        }
    }

    /// Stop receiving from `topic`. A no-op for the exchange protocol.
    pub async fn unsubscribe(&self, protocol: Protocol, topic: &str) -> Result<()> {
        match protocol {
            Protocol::Exchange => self.exchange.unsubscribe(topic).await,
            Protocol::PubSub => self.pubsub.unsubscribe(topic).await,
        }
    }

    /// Take every buffered envelope, oldest first.
    pub fn get_messages(&self) -> Vec<MessageEnvelope> {
        self.buffer.drain_all()
    }

    /// Whether `role` has a connection installed for `protocol`.
    pub async fn is_connected(&self, protocol: Protocol, role: Role) -> bool {
        match protocol {
            Protocol::Exchange => self.exchange.is_connected(role).await,
            Protocol::PubSub => self.pubsub.is_connected(role).await,
        }
    }

    pub async fn stats(&self) -> BridgeStats {
        BridgeStats {
            delivered: self.counters.delivered(),
            skipped: self.counters.skipped(),
            evicted: self.buffer.evicted(),
            tolerated_bind_failures: self.counters.tolerated_bind_failures(),
            listeners: self.exchange.listener_count().await + self.pubsub.listener_count().await,
            buffered: self.buffer.len(),
        }
    }

    /// Disconnect every role of both protocols.
    pub async fn shutdown(&self) {
        self.exchange.shutdown().await;
        self.pubsub.shutdown().await;
        tracing::info!("Bridge shut down");
    }
}
