//! In-process broker implementing both transport sides.
//!
//! Used by tests and local runs without broker processes. Exchanges route
//! with topic semantics (`*`, `#` over `.`-separated words), the unnamed
//! exchange routes straight to the queue named by the routing key, and
//! pub/sub topics match MQTT filters. Any operation can be made to fail or
//! stall with [`MemoryBroker::fail`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{
    Delivery, DeliveryStream, ExchangeChannel, ExchangeConnection, ExchangeConnector,
    PubSubClient, PubSubConnectOptions, PubSubConnector, TransportError, TransportResult,
    topic_matches,
};

/// How an injected failure behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// The operation returns an error.
    Error,
    /// The operation never completes.
    Stall,
}

/// Shared handle to an in-process broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
}

#[derive(Default)]
struct State {
    next_id: u64,
    connections: HashSet<u64>,
    /// Open channel id to owning connection id.
    channels: HashMap<u64, u64>,
    /// Open client id to client identifier.
    clients: HashMap<u64, String>,
    exchanges: HashSet<String>,
    queues: HashMap<String, Queue>,
    bindings: Vec<Binding>,
    subscriptions: Vec<Subscription>,
    failures: HashMap<String, Failure>,
    events: Vec<String>,
    acked: u64,
    rejected: u64,
}

#[derive(Default)]
struct Queue {
    messages: VecDeque<Vec<u8>>,
    consumers: Vec<QueueConsumer>,
    next_consumer: usize,
}

struct QueueConsumer {
    channel: u64,
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    exchange: String,
    queue: String,
    routing_key: String,
}

struct Subscription {
    client: u64,
    filter: String,
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn channel_open(&self, channel: u64) -> bool {
        self.channels
            .get(&channel)
            .is_some_and(|conn| self.connections.contains(conn))
    }

    fn close_channel(&mut self, channel: u64) {
        self.channels.remove(&channel);
        for queue in self.queues.values_mut() {
            queue.consumers.retain(|c| c.channel != channel);
        }
    }

    fn close_connection(&mut self, conn: u64) {
        self.connections.remove(&conn);
        let owned: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, owner)| **owner == conn)
            .map(|(channel, _)| *channel)
            .collect();
        for channel in owned {
            self.close_channel(channel);
        }
    }

    fn close_client(&mut self, client: u64) {
        self.clients.remove(&client);
        self.subscriptions.retain(|s| s.client != client);
    }

    fn enqueue(&mut self, queue: &str, payload: Vec<u8>) {
        let Some(queue) = self.queues.get_mut(queue) else {
            return;
        };
        let mut payload = payload;
        while !queue.consumers.is_empty() {
            let index = queue.next_consumer % queue.consumers.len();
            match queue.consumers[index].tx.send(payload) {
                Ok(()) => {
                    queue.next_consumer = index + 1;
                    return;
                }
                Err(mpsc::error::SendError(returned)) => {
                    queue.consumers.remove(index);
                    payload = returned;
                }
            }
        }
        queue.messages.push_back(payload);
    }

    fn route(&mut self, exchange: &str, routing_key: &str, payload: &[u8]) -> TransportResult<()> {
        if exchange.is_empty() {
            self.enqueue(routing_key, payload.to_vec());
            return Ok(());
        }
        if !self.exchanges.contains(exchange) {
            return Err(TransportError::Rejected(format!(
                "no exchange '{}'",
                exchange
            )));
        }

        let mut targets: Vec<String> = Vec::new();
        for binding in &self.bindings {
            if binding.exchange == exchange
                && routing_key_matches(&binding.routing_key, routing_key)
                && !targets.contains(&binding.queue)
            {
                targets.push(binding.queue.clone());
            }
        }
        for queue in targets {
            self.enqueue(&queue, payload.to_vec());
        }
        Ok(())
    }

    fn dispatch(&mut self, topic: &str, payload: &[u8]) {
        self.subscriptions
            .retain(|s| !topic_matches(&s.filter, topic) || s.tx.send(payload.to_vec()).is_ok());
    }
}

/// Match an exchange routing key against a binding pattern.
fn routing_key_matches(pattern: &str, key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(p), Some(k)) if p == k => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    matches(&pattern, &key)
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every future call of `operation` behave as `failure`.
    ///
    /// Operation names: `connect`, `open_channel`, `declare_exchange`,
    /// `declare_queue`, `bind_queue`, `publish`, `set_prefetch`, `consume`,
    /// `pubsub_connect`, `subscribe`, `unsubscribe`.
    pub fn fail(&self, operation: &str, failure: Failure) {
        self.state
            .lock()
            .failures
            .insert(operation.to_string(), failure);
    }

    /// Remove an injected failure.
    pub fn heal(&self, operation: &str) {
        self.state.lock().failures.remove(operation);
    }

    /// Deliver a raw body to a queue, bypassing exchanges.
    pub fn inject(&self, queue: &str, body: impl Into<Vec<u8>>) {
        self.state.lock().enqueue(queue, body.into());
    }

    /// Deliver a raw body to every pub/sub subscription matching `topic`.
    pub fn inject_topic(&self, topic: &str, body: impl Into<Vec<u8>>) {
        let body = body.into();
        self.state.lock().dispatch(topic, &body);
    }

    /// Drop every pub/sub session as if the broker restarted.
    pub fn sever_clients(&self) {
        let mut state = self.state.lock();
        state.clients.clear();
        state.subscriptions.clear();
    }

    pub fn open_connections(&self) -> usize {
        self.state.lock().connections.len()
    }

    pub fn open_channels(&self) -> usize {
        let state = self.state.lock();
        state
            .channels
            .keys()
            .filter(|channel| state.channel_open(**channel))
            .count()
    }

    pub fn open_clients(&self) -> usize {
        self.state.lock().clients.len()
    }

    /// Client identifiers of the open pub/sub sessions.
    pub fn client_ids(&self) -> Vec<String> {
        self.state.lock().clients.values().cloned().collect()
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.state.lock().exchanges.contains(name)
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.state.lock().queues.contains_key(name)
    }

    /// Whether `queue` is bound to `exchange` with exactly `routing_key`.
    pub fn is_bound(&self, queue: &str, exchange: &str, routing_key: &str) -> bool {
        self.state.lock().bindings.iter().any(|b| {
            b.queue == queue && b.exchange == exchange && b.routing_key == routing_key
        })
    }

    /// Messages stored in a queue that no consumer has taken yet.
    pub fn queue_depth(&self, name: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(name)
            .map_or(0, |q| q.messages.len())
    }

    /// Number of pub/sub subscriptions currently registered.
    pub fn subscription_count(&self) -> usize {
        self.state.lock().subscriptions.len()
    }

    pub fn acked(&self) -> u64 {
        self.state.lock().acked
    }

    pub fn rejected(&self) -> u64 {
        self.state.lock().rejected
    }

    /// Operations performed so far, in order.
    pub fn events(&self) -> Vec<String> {
        self.state.lock().events.clone()
    }

    /// Record an operation, honouring any injected failure for it.
    async fn perform(&self, operation: &str, event: String) -> TransportResult<()> {
        let failure = {
            let mut state = self.state.lock();
            state.events.push(event);
            state.failures.get(operation).copied()
        };
        match failure {
            None => Ok(()),
            Some(Failure::Error) => Err(TransportError::Rejected(format!(
                "injected {} failure",
                operation
            ))),
            Some(Failure::Stall) => std::future::pending().await,
        }
    }
}

#[async_trait]
impl ExchangeConnector for MemoryBroker {
    type Connection = MemoryConnection;

    async fn connect(&self, uri: &str) -> TransportResult<Self::Connection> {
        self.perform("connect", format!("connect {}", uri)).await?;
        let id = {
            let mut state = self.state.lock();
            let id = state.next_id();
            state.connections.insert(id);
            id
        };
        Ok(MemoryConnection {
            broker: self.clone(),
            id,
        })
    }
}

/// Connection to a [`MemoryBroker`].
pub struct MemoryConnection {
    broker: MemoryBroker,
    id: u64,
}

#[async_trait]
impl ExchangeConnection for MemoryConnection {
    type Channel = MemoryChannel;

    async fn open_channel(&self) -> TransportResult<Self::Channel> {
        self.broker
            .perform("open_channel", "open_channel".to_string())
            .await?;
        let mut state = self.broker.state.lock();
        if !state.connections.contains(&self.id) {
            return Err(TransportError::Closed);
        }
        let id = state.next_id();
        state.channels.insert(id, self.id);
        Ok(MemoryChannel {
            broker: self.broker.clone(),
            id,
        })
    }

    async fn close(&self) -> TransportResult<()> {
        let mut state = self.broker.state.lock();
        state.events.push("close_connection".to_string());
        state.close_connection(self.id);
        Ok(())
    }
}

/// Channel on a [`MemoryConnection`].
pub struct MemoryChannel {
    broker: MemoryBroker,
    id: u64,
}

impl MemoryChannel {
    async fn perform(&self, operation: &str, event: String) -> TransportResult<()> {
        self.broker.perform(operation, event).await?;
        if self.broker.state.lock().channel_open(self.id) {
            Ok(())
        } else {
            Err(TransportError::Closed)
        }
    }
}

#[async_trait]
impl ExchangeChannel for MemoryChannel {
    type Consumer = MemoryConsumer;

    async fn declare_exchange(&self, name: &str) -> TransportResult<()> {
        self.perform("declare_exchange", format!("declare_exchange {}", name))
            .await?;
        self.broker.state.lock().exchanges.insert(name.to_string());
        Ok(())
    }

    async fn declare_queue(&self, name: &str) -> TransportResult<()> {
        self.perform("declare_queue", format!("declare_queue {}", name))
            .await?;
        self.broker
            .state
            .lock()
            .queues
            .entry(name.to_string())
            .or_default();
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> TransportResult<()> {
        self.perform(
            "bind_queue",
            format!("bind_queue {} {} {}", queue, exchange, routing_key),
        )
        .await?;
        let mut state = self.broker.state.lock();
        if !state.exchanges.contains(exchange) {
            return Err(TransportError::Rejected(format!(
                "no exchange '{}'",
                exchange
            )));
        }
        if !state.queues.contains_key(queue) {
            return Err(TransportError::Rejected(format!("no queue '{}'", queue)));
        }
        let binding = Binding {
            exchange: exchange.to_string(),
            queue: queue.to_string(),
            routing_key: routing_key.to_string(),
        };
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> TransportResult<()> {
        self.perform("publish", format!("publish {} {}", exchange, routing_key))
            .await?;
        self.broker.state.lock().route(exchange, routing_key, payload)
    }

    async fn set_prefetch(&self, count: u16) -> TransportResult<()> {
        self.perform("set_prefetch", format!("set_prefetch {}", count))
            .await
    }

    async fn consume(&self, queue: &str) -> TransportResult<Self::Consumer> {
        self.perform("consume", format!("consume {}", queue)).await?;
        let mut state = self.broker.state.lock();
        let Some(entry) = state.queues.get_mut(queue) else {
            return Err(TransportError::Rejected(format!("no queue '{}'", queue)));
        };

        let (tx, rx) = mpsc::unbounded_channel();
        for message in entry.messages.drain(..) {
            let _ = tx.send(message);
        }
        entry.consumers.push(QueueConsumer { channel: self.id, tx });

        Ok(MemoryConsumer {
            broker: self.broker.clone(),
            rx,
        })
    }

    async fn close(&self) -> TransportResult<()> {
        let mut state = self.broker.state.lock();
        state.events.push("close_channel".to_string());
        state.close_channel(self.id);
        Ok(())
    }
}

/// Deliveries of a queue consumer or pub/sub subscription.
pub struct MemoryConsumer {
    broker: MemoryBroker,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

#[async_trait]
impl DeliveryStream for MemoryConsumer {
    type Delivery = MemoryDelivery;

    async fn next(&mut self) -> Option<TransportResult<Self::Delivery>> {
        let payload = self.rx.recv().await?;
        Some(Ok(MemoryDelivery {
            broker: self.broker.clone(),
            payload,
        }))
    }
}

/// One delivered body; acknowledgments are counted by the broker.
pub struct MemoryDelivery {
    broker: MemoryBroker,
    payload: Vec<u8>,
}

#[async_trait]
impl Delivery for MemoryDelivery {
    fn payload(&self) -> &[u8] {
        &self.payload
    }

    async fn ack(&self) -> TransportResult<()> {
        self.broker.state.lock().acked += 1;
        Ok(())
    }

    async fn reject(&self) -> TransportResult<()> {
        self.broker.state.lock().rejected += 1;
        Ok(())
    }
}

#[async_trait]
impl PubSubConnector for MemoryBroker {
    type Client = MemoryClient;

    async fn connect(&self, options: &PubSubConnectOptions) -> TransportResult<Self::Client> {
        self.perform(
            "pubsub_connect",
            format!("pubsub_connect {}:{}", options.host, options.port),
        )
        .await?;
        let id = {
            let mut state = self.state.lock();
            let id = state.next_id();
            state.clients.insert(id, options.client_id.clone());
            id
        };
        Ok(MemoryClient {
            broker: self.clone(),
            id,
        })
    }
}

/// Pub/sub session on a [`MemoryBroker`].
pub struct MemoryClient {
    broker: MemoryBroker,
    id: u64,
}

impl MemoryClient {
    async fn perform(&self, operation: &str, event: String) -> TransportResult<()> {
        self.broker.perform(operation, event).await?;
        if self.is_connected() {
            Ok(())
        } else {
            Err(TransportError::Closed)
        }
    }
}

#[async_trait]
impl PubSubClient for MemoryClient {
    type Subscription = MemoryConsumer;

    fn is_connected(&self) -> bool {
        self.broker.state.lock().clients.contains_key(&self.id)
    }

    async fn publish(&self, topic: &str, _qos: u8, payload: Vec<u8>) -> TransportResult<()> {
        self.perform("publish", format!("pubsub_publish {}", topic))
            .await?;
        self.broker.state.lock().dispatch(topic, &payload);
        Ok(())
    }

    async fn subscribe(&self, topic: &str, _qos: u8) -> TransportResult<Self::Subscription> {
        self.perform("subscribe", format!("subscribe {}", topic))
            .await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.broker.state.lock();
        state
            .subscriptions
            .retain(|s| !(s.client == self.id && s.filter == topic));
        state.subscriptions.push(Subscription {
            client: self.id,
            filter: topic.to_string(),
            tx,
        });
        Ok(MemoryConsumer {
            broker: self.broker.clone(),
            rx,
        })
    }

    async fn unsubscribe(&self, topic: &str) -> TransportResult<()> {
        self.perform("unsubscribe", format!("unsubscribe {}", topic))
            .await?;
        self.broker
            .state
            .lock()
            .subscriptions
            .retain(|s| !(s.client == self.id && s.filter == topic));
        Ok(())
    }

    async fn disconnect(&self) {
        let mut state = self.broker.state.lock();
        state.events.push("pubsub_disconnect".to_string());
        state.close_client(self.id);
    }
}
