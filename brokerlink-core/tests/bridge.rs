//! Bridge behaviour against the in-process broker.
//!
//! Every test builds its own `MemoryBroker`, so tests never share state.

use std::time::Duration;

use brokerlink_core::{
    Bridge, BridgeError, BridgeOptions, ConnectionConfig, Failure, MemoryBroker, MessageEnvelope,
    Protocol, PublishConfig, Role, SubscribeConfig,
};
use tokio_test::{assert_err, assert_ok};

type TestBridge = Bridge<MemoryBroker, MemoryBroker>;

fn bridge_with_capacity(capacity: usize) -> (TestBridge, MemoryBroker) {
    let broker = MemoryBroker::new();
    let options = BridgeOptions::default().with_max_queue_size(capacity);
    let bridge = Bridge::new(options, broker.clone(), broker.clone()).expect("valid options");
    (bridge, broker)
}

fn bridge() -> (TestBridge, MemoryBroker) {
    bridge_with_capacity(100)
}

fn amqp() -> ConnectionConfig {
    ConnectionConfig::new(Protocol::Exchange, "localhost", 5672).with_credentials("guest", "guest")
}

fn mqtt() -> ConnectionConfig {
    ConnectionConfig::new(Protocol::PubSub, "localhost", 1883)
}

/// Drain the bridge until `count` envelopes arrived or a second passed.
async fn collect(bridge: &TestBridge, count: usize) -> Vec<MessageEnvelope> {
    let mut received = Vec::new();
    for _ in 0..100 {
        received.extend(bridge.get_messages());
        if received.len() >= count {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    received
}

/// Wait until listeners processed `count` deliveries (buffered or skipped).
async fn wait_processed(bridge: &TestBridge, count: u64) {
    for _ in 0..100 {
        let stats = bridge.stats().await;
        if stats.delivered + stats.skipped >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn contents(envelopes: &[MessageEnvelope]) -> Vec<&str> {
    envelopes.iter().map(MessageEnvelope::content).collect()
}

// ============================================================================
// Round trips
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_exchange_record_round_trip() {
    let (bridge, broker) = bridge();
    let topology = amqp()
        .with_exchange("orders")
        .with_queue("orders_q")
        .with_routing_key("new");

    assert_ok!(bridge.connect_host(&topology).await);
    assert!(broker.has_exchange("orders"));
    assert!(broker.has_queue("orders_q"));
    assert!(broker.is_bound("orders_q", "orders", "new"));

    assert_ok!(bridge.connect_client(&amqp()).await);
    assert_ok!(
        bridge
            .subscribe(&SubscribeConfig::new(Protocol::Exchange, "orders_q"))
            .await
    );
    assert_ok!(
        bridge
            .publish(&PublishConfig::new(
                Protocol::Exchange,
                "new",
                r#"{ "content": "hi", "id": 1 }"#
            ))
            .await
    );

    let received = collect(&bridge, 1).await;
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].protocol(), Protocol::Exchange);
    assert_eq!(received[0].content(), r#"{"id":1,"content":"hi"}"#);

    let record = received[0].decode_record().unwrap();
    assert_eq!(record.id, 1);
    assert_eq!(record.content, "hi");
    assert_eq!(broker.acked(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pubsub_text_round_trip() {
    let (bridge, broker) = bridge();
    assert_ok!(bridge.connect_host(&mqtt()).await);
    assert_ok!(bridge.connect_client(&mqtt()).await);
    assert_eq!(broker.open_clients(), 2);

    assert_ok!(
        bridge
            .subscribe(&SubscribeConfig::new(Protocol::PubSub, "sensors/temp"))
            .await
    );
    assert_ok!(
        bridge
            .publish(&PublishConfig::new(Protocol::PubSub, "sensors/temp", "23.5"))
            .await
    );

    let received = collect(&bridge, 1).await;
    assert_eq!(contents(&received), vec!["23.5"]);
    assert_eq!(received[0].protocol(), Protocol::PubSub);
    assert!(received[0].decode_record().is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pubsub_record_round_trip() {
    let (bridge, _broker) = bridge();
    assert_ok!(bridge.connect_host(&mqtt()).await);
    assert_ok!(bridge.connect_client(&mqtt()).await);

    assert_ok!(
        bridge
            .subscribe(&SubscribeConfig::new(Protocol::PubSub, "orders/new"))
            .await
    );
    assert_ok!(
        bridge
            .publish(&PublishConfig::new(
                Protocol::PubSub,
                "orders/new",
                r#"{ "content": "hello",  "id": 42, "unused": [1, 2] }"#
            ))
            .await
    );

    let received = collect(&bridge, 1).await;
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].protocol(), Protocol::PubSub);
    assert_eq!(received[0].content(), r#"{"id":42,"content":"hello"}"#);

    let record = received[0].decode_record().unwrap();
    assert_eq!(record.id, 42);
    assert_eq!(record.content, "hello");
    assert_eq!(record.timestamp, None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_json_array_message_is_sent_verbatim() {
    let (bridge, _broker) = bridge();
    assert_ok!(bridge.connect_host(&mqtt()).await);
    assert_ok!(bridge.connect_client(&mqtt()).await);

    assert_ok!(
        bridge
            .subscribe(&SubscribeConfig::new(Protocol::PubSub, "raw"))
            .await
    );
    assert_ok!(
        bridge
            .publish(&PublishConfig::new(Protocol::PubSub, "raw", r#"[1,"hi"]"#))
            .await
    );

    let received = collect(&bridge, 1).await;
    assert_eq!(contents(&received), vec![r#"[1,"hi"]"#]);
    assert!(received[0].decode_record().is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_both_protocols_share_buffer() {
    let (bridge, _broker) = bridge();
    for config in [amqp(), mqtt()] {
        assert_ok!(bridge.connect_host(&config).await);
        assert_ok!(bridge.connect_client(&config).await);
    }
    assert_ok!(
        bridge
            .subscribe(&SubscribeConfig::new(Protocol::Exchange, "jobs"))
            .await
    );
    assert_ok!(
        bridge
            .subscribe(&SubscribeConfig::new(Protocol::PubSub, "jobs/#"))
            .await
    );

    // Host publishes to the default exchange, which the subscriber bound with key "jobs"
    assert_ok!(
        bridge
            .publish(&PublishConfig::new(Protocol::Exchange, "jobs", "from amqp"))
            .await
    );
    assert_ok!(
        bridge
            .publish(&PublishConfig::new(Protocol::PubSub, "jobs/1", "from mqtt"))
            .await
    );

    let mut received = collect(&bridge, 2).await;
    received.sort_by_key(|e| e.protocol());
    assert_eq!(contents(&received), vec!["from amqp", "from mqtt"]);
    assert_eq!(received[0].protocol(), Protocol::Exchange);
    assert_eq!(received[1].protocol(), Protocol::PubSub);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_empty_exchange_topic_uses_default_queue() {
    let (bridge, broker) = bridge();
    assert_ok!(bridge.connect_client(&amqp()).await);
    assert_ok!(
        bridge
            .subscribe(&SubscribeConfig::new(Protocol::Exchange, ""))
            .await
    );

    assert!(broker.has_queue("amqp_queue"));
    broker.inject("amqp_queue", "queued");
    assert_eq!(contents(&collect(&bridge, 1).await), vec!["queued"]);
}

// ============================================================================
// Buffer
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_buffer_keeps_most_recent() {
    let (bridge, _broker) = bridge_with_capacity(3);
    assert_ok!(bridge.connect_host(&mqtt()).await);
    assert_ok!(bridge.connect_client(&mqtt()).await);
    assert_ok!(
        bridge
            .subscribe(&SubscribeConfig::new(Protocol::PubSub, "m"))
            .await
    );

    for i in 0..5 {
        assert_ok!(
            bridge
                .publish(&PublishConfig::new(Protocol::PubSub, "m", format!("m{}", i)))
                .await
        );
    }
    wait_processed(&bridge, 5).await;

    let stats = bridge.stats().await;
    assert_eq!(stats.delivered, 5);
    assert_eq!(stats.evicted, 2);
    assert_eq!(stats.buffered, 3);
    assert_eq!(contents(&bridge.get_messages()), vec!["m2", "m3", "m4"]);
}

#[tokio::test]
async fn test_get_messages_drains() {
    let (bridge, _broker) = bridge();
    assert!(bridge.get_messages().is_empty());

    assert_ok!(bridge.connect_client(&mqtt()).await);
    assert_ok!(
        bridge
            .subscribe(&SubscribeConfig::new(Protocol::PubSub, "t"))
            .await
    );
    assert_ok!(bridge.connect_host(&mqtt()).await);
    assert_ok!(
        bridge
            .publish(&PublishConfig::new(Protocol::PubSub, "t", "once"))
            .await
    );

    assert_eq!(collect(&bridge, 1).await.len(), 1);
    assert!(bridge.get_messages().is_empty());
}

// ============================================================================
// Not connected
// ============================================================================

#[tokio::test]
async fn test_publish_without_host_does_no_io() {
    let (bridge, broker) = bridge();

    // A client connection does not make publishing possible
    assert_ok!(bridge.connect_client(&amqp()).await);
    let events_before = broker.events().len();

    for protocol in Protocol::ALL {
        let err = bridge
            .publish(&PublishConfig::new(protocol, "t", "x"))
            .await
            .unwrap_err();
        assert!(err.is_not_connected(), "{}", err);
        assert_eq!(
            err.to_string(),
            format!("{} host not connected", protocol.as_str())
        );
    }
    assert_eq!(broker.events().len(), events_before);
}

#[tokio::test]
async fn test_subscribe_without_client() {
    let (bridge, broker) = bridge();
    assert_ok!(bridge.connect_host(&mqtt()).await);
    assert_ok!(bridge.connect_host(&amqp()).await);

    for protocol in Protocol::ALL {
        let err = bridge
            .subscribe(&SubscribeConfig::new(protocol, "t"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BridgeError::NotConnected {
                role: Role::Client,
                ..
            }
        ));
    }
    assert_eq!(broker.subscription_count(), 0);
}

#[tokio::test]
async fn test_lost_session_is_not_connected() {
    let (bridge, broker) = bridge();
    assert_ok!(bridge.connect_host(&mqtt()).await);
    broker.sever_clients();

    let err = bridge
        .publish(&PublishConfig::new(Protocol::PubSub, "t", "x"))
        .await
        .unwrap_err();
    assert!(err.is_not_connected());
}

// ============================================================================
// Connect and disconnect
// ============================================================================

#[tokio::test]
async fn test_reconnect_replaces_previous_connection() {
    let (bridge, broker) = bridge();

    assert_ok!(bridge.connect_host(&amqp()).await);
    assert_ok!(bridge.connect_host(&amqp()).await);
    assert_eq!(broker.open_connections(), 1);
    assert_eq!(broker.open_channels(), 1);

    assert_ok!(bridge.connect_host(&mqtt()).await);
    assert_ok!(bridge.connect_host(&mqtt()).await);
    assert_eq!(broker.open_clients(), 1);
}

#[tokio::test]
async fn test_roles_are_independent() {
    let (bridge, broker) = bridge();
    assert_ok!(bridge.connect_host(&amqp()).await);
    assert_ok!(bridge.connect_client(&amqp()).await);
    assert_eq!(broker.open_connections(), 2);

    assert_ok!(bridge.disconnect_client(Protocol::Exchange).await);
    assert!(bridge.is_connected(Protocol::Exchange, Role::Host).await);
    assert!(!bridge.is_connected(Protocol::Exchange, Role::Client).await);
    assert_eq!(broker.open_connections(), 1);
}

#[tokio::test]
async fn test_connect_uses_config_role() {
    let (bridge, _broker) = bridge();
    assert_ok!(bridge.connect(&mqtt().with_role(Role::Client)).await);
    assert!(bridge.is_connected(Protocol::PubSub, Role::Client).await);
    assert!(!bridge.is_connected(Protocol::PubSub, Role::Host).await);

    // Role in the config is ignored by the role-specific calls
    assert_ok!(bridge.connect_host(&mqtt().with_role(Role::Client)).await);
    assert!(bridge.is_connected(Protocol::PubSub, Role::Host).await);
}

#[tokio::test]
async fn test_failed_connect_leaves_nothing_open() {
    let (bridge, broker) = bridge();
    broker.fail("declare_queue", Failure::Error);

    let err = bridge
        .connect_host(&amqp().with_exchange("orders").with_queue("orders_q"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        BridgeError::Connection {
            protocol: Protocol::Exchange,
            role: Role::Host,
            ..
        }
    ));
    assert_eq!(broker.open_connections(), 0);
    assert_eq!(broker.open_channels(), 0);
    assert!(!bridge.is_connected(Protocol::Exchange, Role::Host).await);
}

#[tokio::test]
async fn test_failed_reconnect_keeps_previous_connection() {
    let (bridge, broker) = bridge();
    assert_ok!(bridge.connect_host(&amqp().with_exchange("orders")).await);

    broker.fail("open_channel", Failure::Error);
    assert_err!(bridge.connect_host(&amqp().with_exchange("orders")).await);
    assert_eq!(broker.open_connections(), 1);

    broker.heal("open_channel");
    assert_ok!(
        bridge
            .publish(&PublishConfig::new(Protocol::Exchange, "k", "still here"))
            .await
    );
}

#[tokio::test]
async fn test_pubsub_refusal_is_connection_error() {
    let (bridge, broker) = bridge();
    broker.fail("pubsub_connect", Failure::Error);

    let err = bridge.connect_client(&mqtt()).await.unwrap_err();
    assert!(matches!(
        err,
        BridgeError::Connection {
            protocol: Protocol::PubSub,
            role: Role::Client,
            ..
        }
    ));
    assert!(!bridge.is_connected(Protocol::PubSub, Role::Client).await);
}

#[tokio::test(start_paused = true)]
async fn test_pubsub_connect_times_out() {
    let (bridge, broker) = bridge();
    broker.fail("pubsub_connect", Failure::Stall);

    let err = bridge.connect_host(&mqtt()).await.unwrap_err();
    match err {
        BridgeError::Timeout {
            protocol, timeout, ..
        } => {
            assert_eq!(protocol, Protocol::PubSub);
            assert_eq!(timeout, Duration::from_secs(15));
        }
        other => panic!("expected timeout, got {}", other),
    }
    assert_eq!(broker.open_clients(), 0);
}

#[tokio::test]
async fn test_client_ids_carry_role() {
    let (bridge, broker) = bridge();
    assert_ok!(bridge.connect_host(&mqtt()).await);
    assert_ok!(bridge.connect_client(&mqtt()).await);

    let ids = broker.client_ids();
    assert_eq!(ids.len(), 2);
    assert!(ids.iter().any(|id| id.starts_with("mqtt_client_host_")));
    assert!(ids.iter().any(|id| id.starts_with("mqtt_client_client_")));
}

#[tokio::test]
async fn test_disconnect_is_idempotent() {
    let (bridge, broker) = bridge();
    for protocol in Protocol::ALL {
        assert_ok!(bridge.disconnect(protocol).await);
        assert_ok!(bridge.disconnect_client(protocol).await);
    }

    assert_ok!(bridge.connect_host(&amqp()).await);
    assert_ok!(bridge.disconnect(Protocol::Exchange).await);
    assert_ok!(bridge.disconnect(Protocol::Exchange).await);
    assert_eq!(broker.open_connections(), 0);
    assert!(!bridge.is_connected(Protocol::Exchange, Role::Host).await);

    let err = bridge
        .publish(&PublishConfig::new(Protocol::Exchange, "k", "x"))
        .await
        .unwrap_err();
    assert!(err.is_not_connected());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_closes_everything() {
    let (bridge, broker) = bridge();
    for config in [amqp(), mqtt()] {
        assert_ok!(bridge.connect_host(&config).await);
        assert_ok!(bridge.connect_client(&config).await);
    }
    assert_ok!(
        bridge
            .subscribe(&SubscribeConfig::new(Protocol::Exchange, "q"))
            .await
    );
    assert_ok!(
        bridge
            .subscribe(&SubscribeConfig::new(Protocol::PubSub, "t"))
            .await
    );
    assert_eq!(bridge.stats().await.listeners, 2);

    bridge.shutdown().await;

    assert_eq!(broker.open_connections(), 0);
    assert_eq!(broker.open_channels(), 0);
    assert_eq!(broker.open_clients(), 0);
    assert_eq!(bridge.stats().await.listeners, 0);
    for protocol in Protocol::ALL {
        for role in Role::ALL {
            assert!(!bridge.is_connected(protocol, role).await);
        }
    }
}

// ============================================================================
// Subscriptions
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_bind_failure_is_tolerated() {
    let (bridge, broker) = bridge();
    assert_ok!(bridge.connect_client(&amqp()).await);
    broker.fail("bind_queue", Failure::Error);

    assert_ok!(
        bridge
            .subscribe(&SubscribeConfig::new(Protocol::Exchange, "jobs"))
            .await
    );
    assert_eq!(bridge.stats().await.tolerated_bind_failures, 1);

    broker.inject("jobs", "direct");
    assert_eq!(contents(&collect(&bridge, 1).await), vec!["direct"]);
}

#[tokio::test]
async fn test_subscribe_failure_is_reported() {
    let (bridge, broker) = bridge();
    assert_ok!(bridge.connect_client(&amqp()).await);
    broker.fail("consume", Failure::Error);

    let err = bridge
        .subscribe(&SubscribeConfig::new(Protocol::Exchange, "jobs"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        BridgeError::Operation {
            protocol: Protocol::Exchange,
            operation: "subscribe",
            ..
        }
    ));
    assert_eq!(bridge.stats().await.listeners, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_non_text_deliveries_are_skipped() {
    let (bridge, broker) = bridge();
    assert_ok!(bridge.connect_client(&amqp()).await);
    assert_ok!(bridge.connect_client(&mqtt()).await);
    assert_ok!(
        bridge
            .subscribe(&SubscribeConfig::new(Protocol::Exchange, "bin"))
            .await
    );
    assert_ok!(
        bridge
            .subscribe(&SubscribeConfig::new(Protocol::PubSub, "bin/#"))
            .await
    );

    broker.inject("bin", vec![0xff, 0xfe, 0x00]);
    broker.inject("bin", "after");
    broker.inject_topic("bin/raw", vec![0xc3, 0x28]);
    broker.inject_topic("bin/raw", "after");

    wait_processed(&bridge, 4).await;
    let stats = bridge.stats().await;
    assert_eq!(stats.skipped, 2);
    assert_eq!(stats.delivered, 2);
    assert_eq!(broker.rejected(), 2);
    assert_eq!(broker.acked(), 2);
    assert_eq!(contents(&bridge.get_messages()), vec!["after", "after"]);
}

#[tokio::test]
async fn test_exchange_unsubscribe_is_noop() {
    let (bridge, _broker) = bridge();
    assert_ok!(bridge.unsubscribe(Protocol::Exchange, "anything").await);
    assert_ok!(bridge.unsubscribe(Protocol::Exchange, "").await);
}

#[tokio::test]
async fn test_pubsub_unsubscribe_requires_client() {
    let (bridge, _broker) = bridge();
    let err = bridge
        .unsubscribe(Protocol::PubSub, "sensors/temp")
        .await
        .unwrap_err();
    assert!(err.is_not_connected());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pubsub_unsubscribe_stops_listener() {
    let (bridge, broker) = bridge();
    assert_ok!(bridge.connect_client(&mqtt()).await);
    assert_ok!(
        bridge
            .subscribe(&SubscribeConfig::new(Protocol::PubSub, "sensors/temp"))
            .await
    );
    assert_eq!(bridge.stats().await.listeners, 1);

    assert_ok!(bridge.unsubscribe(Protocol::PubSub, "sensors/temp").await);
    assert_eq!(bridge.stats().await.listeners, 0);
    assert_eq!(broker.subscription_count(), 0);

    broker.inject_topic("sensors/temp", "late");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(bridge.get_messages().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_disconnect_stops_listeners() {
    let (bridge, broker) = bridge();
    assert_ok!(bridge.connect_client(&amqp()).await);
    assert_ok!(
        bridge
            .subscribe(&SubscribeConfig::new(Protocol::Exchange, "q"))
            .await
    );
    assert_eq!(bridge.stats().await.listeners, 1);

    assert_ok!(bridge.disconnect_client(Protocol::Exchange).await);
    assert_eq!(bridge.stats().await.listeners, 0);

    broker.inject("q", "stored");
    assert_eq!(broker.queue_depth("q"), 1);
}

// ============================================================================
// Configuration
// ============================================================================

#[test]
fn test_unknown_protocol_rejected() {
    let json = r#"{ "protocol": "kafka", "host": "h", "port": 9092 }"#;
    let err = serde_json::from_str::<ConnectionConfig>(json).unwrap_err();
    assert!(err.to_string().contains("Unsupported protocol"));
}

#[test]
fn test_invalid_options_rejected() {
    let broker = MemoryBroker::new();
    let result = Bridge::new(
        BridgeOptions::default().with_max_queue_size(0),
        broker.clone(),
        broker,
    );
    assert!(matches!(result, Err(BridgeError::Config(_))));
}
