//! Pub/sub side of the bridge.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use brokerlink_common::{Protocol, Role};

use crate::buffer::InboundBuffer;
use crate::config::ConnectionConfig;
use crate::error::{BridgeError, Result};
use crate::listener::spawn_listener;
use crate::options::{PUBSUB_QOS, PubSubOptions};
use crate::registry::{ConnectionRegistry, Teardown};
use crate::stats::Counters;
use crate::transport::{PubSubClient, PubSubConnectOptions, PubSubConnector};

/// A live pub/sub session.
pub struct PubSubHandle<C: PubSubClient> {
    client: C,
    client_id: String,
}

impl<C: PubSubClient> PubSubHandle<C> {
    pub fn client_id(&self) -> &str {
        &self.client_id
    }
}

#[async_trait]
impl<C: PubSubClient> Teardown for PubSubHandle<C> {
    async fn teardown(self) {
        self.client.disconnect().await;
        tracing::debug!(client_id = %self.client_id, "Pub/sub session closed");
    }
}

/// Build a client identifier unique per role and connect time.
pub fn client_id(prefix: &str, role: Role) -> String {
    format!("{}_{}_{}", prefix, role, Utc::now().timestamp_millis())
}

/// Connections, publishes and subscriptions of the pub/sub protocol.
pub struct PubSubDriver<P: PubSubConnector> {
    connector: P,
    registry: ConnectionRegistry<PubSubHandle<P::Client>>,
    options: PubSubOptions,
    buffer: Arc<InboundBuffer>,
    counters: Arc<Counters>,
}

impl<P: PubSubConnector> PubSubDriver<P> {
    pub(crate) fn new(
        connector: P,
        options: &PubSubOptions,
        buffer: Arc<InboundBuffer>,
        counters: Arc<Counters>,
    ) -> Self {
        Self {
            connector,
            registry: ConnectionRegistry::new(Protocol::PubSub),
            options: options.clone(),
            buffer,
            counters,
        }
    }

    fn connect_options(&self, config: &ConnectionConfig, role: Role) -> PubSubConnectOptions {
        PubSubConnectOptions {
            client_id: client_id(&self.options.client_id_prefix, role),
            host: config.host.clone(),
            port: config.port,
            username: config.username.clone(),
            password: config.password.clone(),
            keep_alive: self.options.keep_alive(),
            connect_timeout: self.options.connect_timeout(),
            retry_interval: self.options.retry_interval(),
            ack_timeout: self.options.ack_timeout(),
            disconnect_grace: self.options.disconnect_grace(),
        }
    }

    /// Open a session for `role`, replacing any previous one.
    ///
    /// Waits at most `connect_wait` for the broker to accept the session.
    pub async fn connect(&self, config: &ConnectionConfig, role: Role) -> Result<()> {
        let mut registry = self.registry.lock().await;

        let options = self.connect_options(config, role);
        let wait = self.options.connect_wait();

        let client = match tokio::time::timeout(wait, self.connector.connect(&options)).await {
            Ok(Ok(client)) => client,
            Ok(Err(e)) => {
                return Err(BridgeError::connection(Protocol::PubSub, role, e));
            }
            Err(_) => {
                tracing::warn!(
                    protocol = %Protocol::PubSub,
                    role = %role,
                    endpoint = %config.endpoint(),
                    "Connect timed out"
                );
                return Err(BridgeError::Timeout {
                    protocol: Protocol::PubSub,
                    role,
                    timeout: wait,
                });
            }
        };

        tracing::info!(
            protocol = %Protocol::PubSub,
            role = %role,
            endpoint = %config.endpoint(),
            client_id = %options.client_id,
            "Connected"
        );
        registry
            .replace(
                role,
                PubSubHandle {
                    client,
                    client_id: options.client_id,
                },
            )
            .await;
        Ok(())
    }

    /// Close the session of `role`. Closing an absent session succeeds.
    pub async fn disconnect(&self, role: Role) {
        let mut registry = self.registry.lock().await;
        if registry.clear(role).await {
            tracing::info!(protocol = %Protocol::PubSub, role = %role, "Disconnected");
        }
    }

    /// Publish `payload` on the host session and wait for the acknowledgment.
    pub async fn publish(&self, topic: &str, payload: &[u8]) -> Result<()> {
        let registry = self.registry.lock().await;
        let client = live_client(registry.handle(Role::Host), Role::Host)?;

        client
            .publish(topic, PUBSUB_QOS, payload.to_vec())
            .await
            .map_err(|e| BridgeError::operation(Protocol::PubSub, "publish", e))?;

        tracing::debug!(protocol = %Protocol::PubSub, topic = %topic, bytes = payload.len(), "Published");
        Ok(())
    }

    /// Subscribe the client session to `topic`.
    pub async fn subscribe(&self, topic: &str) -> Result<()> {
        let mut registry = self.registry.lock().await;
        let client = live_client(registry.handle(Role::Client), Role::Client)?;

        let subscription = client
            .subscribe(topic, PUBSUB_QOS)
            .await
            .map_err(|e| BridgeError::operation(Protocol::PubSub, "subscribe", e))?;

        // A resubscribe replaced the transport route, so the old listener ends.
        registry.stop_listeners(Role::Client, topic).await;
        let listener = spawn_listener(
            Protocol::PubSub,
            topic,
            subscription,
            self.buffer.clone(),
            self.counters.clone(),
        );
        registry.add_listener(Role::Client, listener);

        tracing::info!(protocol = %Protocol::PubSub, topic = %topic, "Subscribed");
        Ok(())
    }

    /// Unsubscribe the client session from `topic` and stop its listener.
    pub async fn unsubscribe(&self, topic: &str) -> Result<()> {
        let mut registry = self.registry.lock().await;
        let client = registry
            .handle(Role::Client)
            .map(|handle| &handle.client)
            .ok_or(BridgeError::NotConnected {
                protocol: Protocol::PubSub,
                role: Role::Client,
            })?;

        client
            .unsubscribe(topic)
            .await
            .map_err(|e| BridgeError::operation(Protocol::PubSub, "unsubscribe", e))?;

        let stopped = registry.stop_listeners(Role::Client, topic).await;
        tracing::info!(protocol = %Protocol::PubSub, topic = %topic, listeners = stopped, "Unsubscribed");
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

/// The client of `handle` if the session is currently up.
fn live_client<C: PubSubClient>(handle: Option<&PubSubHandle<C>>, role: Role) -> Result<&C> {
    match handle {
        Some(handle) if handle.client.is_connected() => Ok(&handle.client),
        _ => Err(BridgeError::NotConnected {
            protocol: Protocol::PubSub,
            role,
        }),
    }
}
