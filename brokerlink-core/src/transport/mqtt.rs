//! Pub/sub transport backed by `rumqttc`.
//!
//! Each client owns one event-loop task. The task drives the session,
//! reconnects after a fixed retry interval when the broker goes away, routes
//! inbound publishes to subscriptions, and matches PUBACK/SUBACK/UNSUBACK
//! packets to the request that is waiting for them.
//!
//! Requests are written to `rumqttc` under a lock, and the event loop reports
//! outgoing packet ids in request order, so the n-th queued waiter of a kind
//! owns the n-th outgoing packet id of that kind.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, ClientError, ConnectionError, Event, EventLoop, MqttOptions, NetworkOptions,
    Outgoing, Packet, QoS, SubscribeReasonCode,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::{
    Delivery, DeliveryStream, PubSubClient, PubSubConnectOptions, PubSubConnector,
    TransportError, TransportResult, topic_matches,
};

/// Capacity of the request channel between client and event loop.
const REQUEST_CAPACITY: usize = 64;

/// Buffered publishes per subscription before new ones are dropped.
const SUBSCRIPTION_CAPACITY: usize = 1000;

/// Connector opening `rumqttc` sessions.
#[derive(Debug, Clone, Copy, Default)]
pub struct MqttConnector;

impl MqttConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PubSubConnector for MqttConnector {
    type Client = MqttClient;

    async fn connect(&self, options: &PubSubConnectOptions) -> TransportResult<Self::Client> {
        let mut mqtt_options = MqttOptions::new(&options.client_id, &options.host, options.port);
        if !options.username.is_empty() {
            mqtt_options.set_credentials(&options.username, &options.password);
        }
        mqtt_options
            .set_keep_alive(options.keep_alive)
            .set_clean_session(true);

        let (client, mut eventloop) = AsyncClient::new(mqtt_options, REQUEST_CAPACITY);

        let mut network = NetworkOptions::new();
        network.set_connection_timeout(options.connect_timeout.as_secs());
        eventloop.set_network_options(network);

        let shared = Arc::new(Shared::default());
        let (ready_tx, ready_rx) = oneshot::channel();
        let (stopped_tx, stopped_rx) = oneshot::channel();

        // Dropping the guard (failed handshake, cancelled wait) aborts the loop.
        let driver = EventLoopTask {
            handle: tokio::spawn(drive(
                eventloop,
                shared.clone(),
                options.client_id.clone(),
                options.retry_interval,
                ready_tx,
                stopped_tx,
            )),
            stopped: Mutex::new(Some(stopped_rx)),
        };

        match ready_rx.await {
            Ok(Ok(())) => Ok(MqttClient {
                client,
                shared,
                request_order: tokio::sync::Mutex::new(()),
                ack_timeout: options.ack_timeout,
                disconnect_grace: options.disconnect_grace,
                driver,
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(TransportError::Closed),
        }
    }
}

/// A `rumqttc` client session.
pub struct MqttClient {
    client: AsyncClient,
    shared: Arc<Shared>,
    request_order: tokio::sync::Mutex<()>,
    ack_timeout: Duration,
    disconnect_grace: Duration,
    driver: EventLoopTask,
}

impl MqttClient {
    /// Send a request and wait for the matching acknowledgment.
    async fn request<F>(&self, kind: AckKind, send: F) -> TransportResult<()>
    where
        F: Future<Output = Result<(), ClientError>> + Send,
    {
        let ack = {
            let _order = self.request_order.lock().await;
            let (tx, rx) = oneshot::channel();
            self.shared.acks.lock().enqueue(kind, tx);
            if let Err(e) = send.await {
                self.shared.acks.lock().cancel_last(kind);
                return Err(e.into());
            }
            rx
        };

        match tokio::time::timeout(self.ack_timeout, ack).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(reason))) => Err(TransportError::Rejected(reason)),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => Err(TransportError::AckTimeout(self.ack_timeout)),
        }
    }
}

#[async_trait]
impl PubSubClient for MqttClient {
    type Subscription = MqttSubscription;

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    async fn publish(&self, topic: &str, qos: u8, payload: Vec<u8>) -> TransportResult<()> {
        let qos = to_qos(qos);
        let send = self.client.publish(topic, qos, false, payload);
        if qos == QoS::AtMostOnce {
            send.await?;
            return Ok(());
        }
        self.request(AckKind::Publish, send).await
    }

    async fn subscribe(&self, topic: &str, qos: u8) -> TransportResult<Self::Subscription> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        // A new subscription on the same filter replaces the previous one.
        self.shared.replace_route(topic, tx);

        let send = self.client.subscribe(topic, to_qos(qos));
        if let Err(e) = self.request(AckKind::Subscribe, send).await {
            self.shared.remove_route(topic);
            return Err(e);
        }
        Ok(MqttSubscription { rx })
    }

    async fn unsubscribe(&self, topic: &str) -> TransportResult<()> {
        let send = self.client.unsubscribe(topic);
        let result = self.request(AckKind::Unsubscribe, send).await;
        self.shared.remove_route(topic);
        result
    }

    async fn disconnect(&self) {
        if let Err(e) = self.client.disconnect().await {
            tracing::debug!(error = %e, "MQTT disconnect request failed");
        }

        let stopped = self.driver.stopped.lock().take();
        if let Some(stopped) = stopped {
            if tokio::time::timeout(self.disconnect_grace, stopped)
                .await
                .is_err()
            {
                tracing::debug!("MQTT event loop did not stop within grace period");
            }
        }

        self.driver.handle.abort();
        self.shared.connected.store(false, Ordering::SeqCst);
        self.shared.close();
    }
}

/// Publishes routed to one subscription.
pub struct MqttSubscription {
    rx: mpsc::Receiver<Vec<u8>>,
}

#[async_trait]
impl DeliveryStream for MqttSubscription {
    type Delivery = MqttDelivery;

    async fn next(&mut self) -> Option<TransportResult<Self::Delivery>> {
        let payload = self.rx.recv().await?;
        Some(Ok(MqttDelivery { payload }))
    }
}

/// An inbound publish. Acknowledgment happens inside the protocol.
pub struct MqttDelivery {
    payload: Vec<u8>,
}

#[async_trait]
impl Delivery for MqttDelivery {
    fn payload(&self) -> &[u8] {
        &self.payload
    }

    async fn ack(&self) -> TransportResult<()> {
        Ok(())
    }

    async fn reject(&self) -> TransportResult<()> {
        Ok(())
    }
}

struct EventLoopTask {
    handle: JoinHandle<()>,
    stopped: Mutex<Option<oneshot::Receiver<()>>>,
}

impl Drop for EventLoopTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum AckKind {
    Publish,
    Subscribe,
    Unsubscribe,
}

type AckOutcome = Result<(), String>;

/// Waiters for broker acknowledgments.
#[derive(Default)]
struct AckTracker {
    queued: HashMap<AckKind, VecDeque<oneshot::Sender<AckOutcome>>>,
    inflight: HashMap<(AckKind, u16), oneshot::Sender<AckOutcome>>,
}

impl AckTracker {
    fn enqueue(&mut self, kind: AckKind, waiter: oneshot::Sender<AckOutcome>) {
        self.queued.entry(kind).or_default().push_back(waiter);
    }

    fn cancel_last(&mut self, kind: AckKind) {
        if let Some(queue) = self.queued.get_mut(&kind) {
            queue.pop_back();
        }
    }

    /// Bind the oldest queued waiter to an outgoing packet id.
    fn assign(&mut self, kind: AckKind, pkid: u16) {
        // Retransmissions after a reconnect reuse the packet id.
        if self.inflight.contains_key(&(kind, pkid)) {
            return;
        }
        if let Some(waiter) = self.queued.get_mut(&kind).and_then(VecDeque::pop_front) {
            self.inflight.insert((kind, pkid), waiter);
        }
    }

    fn resolve(&mut self, kind: AckKind, pkid: u16, outcome: AckOutcome) {
        if let Some(waiter) = self.inflight.remove(&(kind, pkid)) {
            let _ = waiter.send(outcome);
        }
    }

    fn clear(&mut self) {
        self.queued.clear();
        self.inflight.clear();
    }
}

struct Route {
    filter: String,
    tx: mpsc::Sender<Vec<u8>>,
}

/// State shared between a client and its event loop.
#[derive(Default)]
struct Shared {
    connected: AtomicBool,
    routes: Mutex<Vec<Route>>,
    acks: Mutex<AckTracker>,
}

impl Shared {
    fn replace_route(&self, filter: &str, tx: mpsc::Sender<Vec<u8>>) {
        let mut routes = self.routes.lock();
        routes.retain(|route| route.filter != filter);
        routes.push(Route {
            filter: filter.to_string(),
            tx,
        });
    }

    fn remove_route(&self, filter: &str) {
        self.routes.lock().retain(|route| route.filter != filter);
    }

    fn dispatch(&self, topic: &str, payload: &[u8]) {
        let mut routes = self.routes.lock();
        routes.retain(|route| {
            if !topic_matches(&route.filter, topic) {
                return true;
            }
            match route.tx.try_send(payload.to_vec()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(topic = %topic, filter = %route.filter, "Subscription backlog full, dropping message");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    /// Drop every route and pending waiter, ending streams and requests.
    fn close(&self) {
        self.routes.lock().clear();
        self.acks.lock().clear();
    }
}

/// Drive the `rumqttc` event loop until the client disconnects or goes away.
async fn drive(
    mut eventloop: EventLoop,
    shared: Arc<Shared>,
    client_id: String,
    retry_interval: Duration,
    ready: oneshot::Sender<TransportResult<()>>,
    stopped: oneshot::Sender<()>,
) {
    let mut ready = Some(ready);

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                shared.connected.store(true, Ordering::SeqCst);
                tracing::info!(client_id = %client_id, "MQTT connected");
                if let Some(ready) = ready.take() {
                    let _ = ready.send(Ok(()));
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                tracing::trace!(topic = %publish.topic, bytes = publish.payload.len(), "MQTT publish received");
                shared.dispatch(&publish.topic, &publish.payload);
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => {
                shared.acks.lock().resolve(AckKind::Publish, ack.pkid, Ok(()));
            }
            Ok(Event::Incoming(Packet::PubComp(comp))) => {
                shared
                    .acks
                    .lock()
                    .resolve(AckKind::Publish, comp.pkid, Ok(()));
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                let outcome = if ack
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure))
                {
                    Err("subscription rejected by broker".to_string())
                } else {
                    Ok(())
                };
                shared
                    .acks
                    .lock()
                    .resolve(AckKind::Subscribe, ack.pkid, outcome);
            }
            Ok(Event::Incoming(Packet::UnsubAck(ack))) => {
                shared
                    .acks
                    .lock()
                    .resolve(AckKind::Unsubscribe, ack.pkid, Ok(()));
            }
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) if pkid != 0 => {
                shared.acks.lock().assign(AckKind::Publish, pkid);
            }
            Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => {
                shared.acks.lock().assign(AckKind::Subscribe, pkid);
            }
            Ok(Event::Outgoing(Outgoing::Unsubscribe(pkid))) => {
                shared.acks.lock().assign(AckKind::Unsubscribe, pkid);
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                tracing::debug!(client_id = %client_id, "MQTT disconnect sent");
                break;
            }
            Ok(_) => {}
            Err(ConnectionError::RequestsDone) => break,
            Err(ConnectionError::ConnectionRefused(code)) if ready.is_some() => {
                if let Some(ready) = ready.take() {
                    let _ = ready.send(Err(TransportError::Rejected(format!(
                        "broker refused connection: {:?}",
                        code
                    ))));
                }
                break;
            }
            Err(e) => {
                if shared.connected.swap(false, Ordering::SeqCst) {
                    tracing::warn!(client_id = %client_id, error = %e, "MQTT connection lost");
                } else {
                    tracing::debug!(client_id = %client_id, error = %e, "MQTT connect attempt failed, retrying");
                }
                tokio::time::sleep(retry_interval).await;
            }
        }
    }

    shared.connected.store(false, Ordering::SeqCst);
    let _ = stopped.send(());
}

fn to_qos(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ack_tracker_matches_in_request_order() {
        let mut tracker = AckTracker::default();
        let (first_tx, mut first_rx) = oneshot::channel();
        let (second_tx, mut second_rx) = oneshot::channel();
        tracker.enqueue(AckKind::Publish, first_tx);
        tracker.enqueue(AckKind::Publish, second_tx);

        tracker.assign(AckKind::Publish, 7);
        tracker.assign(AckKind::Publish, 8);
        tracker.resolve(AckKind::Publish, 8, Err("nope".to_string()));
        tracker.resolve(AckKind::Publish, 7, Ok(()));

        assert_eq!(first_rx.try_recv().unwrap(), Ok(()));
        assert_eq!(second_rx.try_recv().unwrap(), Err("nope".to_string()));
    }

    #[test]
    fn test_ack_tracker_ignores_retransmission() {
        let mut tracker = AckTracker::default();
        let (first_tx, mut first_rx) = oneshot::channel();
        let (second_tx, mut second_rx) = oneshot::channel();
        tracker.enqueue(AckKind::Publish, first_tx);
        tracker.assign(AckKind::Publish, 3);
        tracker.enqueue(AckKind::Publish, second_tx);

        // Same packet id seen again after a reconnect
        tracker.assign(AckKind::Publish, 3);
        tracker.resolve(AckKind::Publish, 3, Ok(()));

        assert_eq!(first_rx.try_recv().unwrap(), Ok(()));
        assert!(second_rx.try_recv().is_err());
    }

    #[test]
    fn test_ack_kinds_are_independent() {
        let mut tracker = AckTracker::default();
        let (sub_tx, mut sub_rx) = oneshot::channel();
        tracker.enqueue(AckKind::Subscribe, sub_tx);

        tracker.assign(AckKind::Publish, 1);
        tracker.resolve(AckKind::Publish, 1, Ok(()));
        assert!(sub_rx.try_recv().is_err());

        tracker.assign(AckKind::Subscribe, 1);
        tracker.resolve(AckKind::Subscribe, 1, Ok(()));
        assert_eq!(sub_rx.try_recv().unwrap(), Ok(()));
    }

    #[test]
    fn test_cancel_last_drops_waiter() {
        let mut tracker = AckTracker::default();
        let (tx, mut rx) = oneshot::channel();
        tracker.enqueue(AckKind::Unsubscribe, tx);
        tracker.cancel_last(AckKind::Unsubscribe);

        assert!(matches!(
            rx.try_recv(),
            Err(oneshot::error::TryRecvError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_dispatch_routes_by_filter() {
        let shared = Shared::default();
        let (temp_tx, mut temp_rx) = mpsc::channel(4);
        let (all_tx, mut all_rx) = mpsc::channel(4);
        shared.replace_route("sensors/temp", temp_tx);
        shared.replace_route("sensors/#", all_tx);

        shared.dispatch("sensors/temp", b"23.5");
        shared.dispatch("sensors/humidity", b"40");

        assert_eq!(temp_rx.recv().await.unwrap(), b"23.5".to_vec());
        assert_eq!(all_rx.recv().await.unwrap(), b"23.5".to_vec());
        assert_eq!(all_rx.recv().await.unwrap(), b"40".to_vec());
        assert!(temp_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_replace_route_ends_previous_stream() {
        let shared = Shared::default();
        let (old_tx, mut old_rx) = mpsc::channel(4);
        let (new_tx, mut new_rx) = mpsc::channel(4);
        shared.replace_route("a/b", old_tx);
        shared.replace_route("a/b", new_tx);

        shared.dispatch("a/b", b"x");
        assert_eq!(old_rx.recv().await, None);
        assert_eq!(new_rx.recv().await.unwrap(), b"x".to_vec());
    }

    #[test]
    fn test_to_qos() {
        assert_eq!(to_qos(0), QoS::AtMostOnce);
        assert_eq!(to_qos(1), QoS::AtLeastOnce);
        assert_eq!(to_qos(2), QoS::ExactlyOnce);
    }
}
