//! Exchange-protocol side of the bridge.

use std::sync::Arc;

use async_trait::async_trait;

use brokerlink_common::{Protocol, Role};

use crate::buffer::InboundBuffer;
use crate::config::ConnectionConfig;
use crate::error::{BridgeError, Result};
use crate::listener::spawn_listener;
use crate::options::{BridgeOptions, EXCHANGE_PREFETCH};
use crate::registry::{ConnectionRegistry, Teardown};
use crate::stats::Counters;
use crate::transport::{
    ExchangeChannel, ExchangeConnection, ExchangeConnector, TransportError, TransportResult,
};

/// Log target of failures that are reported but do not fail the operation.
pub const TOLERATED_TARGET: &str = "brokerlink::tolerated";

/// A live exchange connection with its channel.
pub struct ExchangeHandle<C: ExchangeConnection> {
    connection: C,
    channel: C::Channel,
    /// Exchange used by publishes on this connection.
    exchange: String,
}

impl<C: ExchangeConnection> ExchangeHandle<C> {
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Declare the topology named by `config` on this handle's channel.
    async fn declare(&self, config: &ConnectionConfig) -> TransportResult<()> {
        if let Some(exchange) = config.exchange_name() {
            self.channel.declare_exchange(exchange).await?;
        }
        if let Some(queue) = config.queue_name() {
            self.channel.declare_queue(queue).await?;
        }
        if let (Some(queue), Some(exchange), Some(routing_key)) = (
            config.queue_name(),
            config.exchange_name(),
            config.routing_key(),
        ) {
            self.channel.bind_queue(queue, exchange, routing_key).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl<C: ExchangeConnection> Teardown for ExchangeHandle<C> {
    async fn teardown(self) {
        if let Err(e) = self.channel.close().await {
            tracing::debug!(error = %e, "Ignoring channel close error");
        }
        if let Err(e) = self.connection.close().await {
            tracing::debug!(error = %e, "Ignoring connection close error");
        }
    }
}

/// Connections, publishes and subscriptions of the exchange protocol.
pub struct ExchangeDriver<E: ExchangeConnector> {
    connector: E,
    registry: ConnectionRegistry<ExchangeHandle<E::Connection>>,
    default_exchange: String,
    default_queue: String,
    buffer: Arc<InboundBuffer>,
    counters: Arc<Counters>,
}

impl<E: ExchangeConnector> ExchangeDriver<E> {
    pub(crate) fn new(
        connector: E,
        options: &BridgeOptions,
        buffer: Arc<InboundBuffer>,
        counters: Arc<Counters>,
    ) -> Self {
        Self {
            connector,
            registry: ConnectionRegistry::new(Protocol::Exchange),
            default_exchange: options.default_exchange.clone(),
            default_queue: options.default_queue.clone(),
            buffer,
            counters,
        }
    }

    /// Open a connection for `role`, replacing any previous one.
    ///
    /// A failed connect leaves the previous connection of the role untouched.
    pub async fn connect(&self, config: &ConnectionConfig, role: Role) -> Result<()> {
        let mut registry = self.registry.lock().await;

        let handle = self
            .open(config)
            .await
            .map_err(|e| BridgeError::connection(Protocol::Exchange, role, e))?;

        tracing::info!(
            protocol = %Protocol::Exchange,
            role = %role,
            endpoint = %config.endpoint(),
            exchange = %handle.exchange(),
            "Connected"
        );
        registry.replace(role, handle).await;
        Ok(())
    }

    async fn open(
        &self,
        config: &ConnectionConfig,
    ) -> TransportResult<ExchangeHandle<E::Connection>> {
        let connection = self.connector.connect(&config.amqp_uri()).await?;

        let channel = match connection.open_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                if let Err(close_err) = connection.close().await {
                    tracing::debug!(error = %close_err, "Ignoring connection close error");
                }
                return Err(e);
            }
        };

        let handle = ExchangeHandle {
            connection,
            channel,
            exchange: config
                .exchange_name()
                .unwrap_or(self.default_exchange.as_str())
                .to_string(),
        };

        if let Err(e) = handle.declare(config).await {
            handle.teardown().await;
            return Err(e);
        }
        Ok(handle)
    }

    /// Close the connection of `role`. Closing an absent connection succeeds.
    pub async fn disconnect(&self, role: Role) {
        let mut registry = self.registry.lock().await;
        if registry.clear(role).await {
            tracing::info!(protocol = %Protocol::Exchange, role = %role, "Disconnected");
        }
    }

    /// Publish `payload` on the host connection with `routing_key`.
    pub async fn publish(&self, routing_key: &str, payload: &[u8]) -> Result<()> {
        let registry = self.registry.lock().await;
        let handle = registry
            .handle(Role::Host)
            .ok_or(BridgeError::NotConnected {
                protocol: Protocol::Exchange,
                role: Role::Host,
            })?;

        handle
            .channel
            .publish(&handle.exchange, routing_key, payload)
            .await
            .map_err(|e| BridgeError::operation(Protocol::Exchange, "publish", e))?;

        tracing::debug!(
            protocol = %Protocol::Exchange,
            exchange = %handle.exchange,
            routing_key = %routing_key,
            bytes = payload.len(),
            "Published"
        );
        Ok(())
    }

    /// Consume `topic` (a queue name, or the default queue when empty) on the
    /// client connection.
    pub async fn subscribe(&self, topic: &str) -> Result<()> {
        let mut registry = self.registry.lock().await;
        let handle = registry
            .handle(Role::Client)
            .ok_or(BridgeError::NotConnected {
                protocol: Protocol::Exchange,
                role: Role::Client,
            })?;

        let queue = if topic.is_empty() {
            self.default_queue.as_str()
        } else {
            topic
        };
        let subscribe_err =
            |e: TransportError| BridgeError::operation(Protocol::Exchange, "subscribe", e);

        handle.channel.declare_queue(queue).await.map_err(subscribe_err)?;

        if let Err(e) = self.bind_default(&handle.channel, queue, topic).await {
            self.counters.record_tolerated_bind_failure();
            tracing::warn!(
                target: TOLERATED_TARGET,
                protocol = %Protocol::Exchange,
                queue = %queue,
                exchange = %self.default_exchange,
                error = %e,
                "Binding to default exchange failed, consuming anyway"
            );
        }

        handle
            .channel
            .set_prefetch(EXCHANGE_PREFETCH)
            .await
            .map_err(subscribe_err)?;
        let consumer = handle.channel.consume(queue).await.map_err(subscribe_err)?;

        let listener = spawn_listener(
            Protocol::Exchange,
            queue,
            consumer,
            self.buffer.clone(),
            self.counters.clone(),
        );
        registry.add_listener(Role::Client, listener);

        tracing::info!(protocol = %Protocol::Exchange, queue = %queue, "Subscribed");
        Ok(())
    }

    async fn bind_default(
        &self,
        channel: &<E::Connection as ExchangeConnection>::Channel,
        queue: &str,
        routing_key: &str,
    ) -> TransportResult<()> {
        channel.declare_exchange(&self.default_exchange).await?;
        channel
            .bind_queue(queue, &self.default_exchange, routing_key)
            .await
    }

    /// Exchange consumers are not cancelled individually.
    pub async fn unsubscribe(&self, topic: &str) -> Result<()> {
        tracing::debug!(protocol = %Protocol::Exchange, topic = %topic, "Unsubscribe is a no-op");
        Ok(())
    }

    pub async fn is_connected(&self, role: Role) -> bool {
        self.registry.lock().await.handle(role).is_some()
    }

    pub(crate) async fn listener_count(&self) -> usize {
        self.registry.lock().await.listener_count()
    }

    pub(crate) async fn shutdown(&self) {
        self.registry.lock().await.clear_all().await;
    }
}
