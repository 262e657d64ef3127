//! Bridge tuning options and default names.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};

/// Exchange used when a host declared none, and bound by subscribers.
pub const DEFAULT_EXCHANGE: &str = "amqp_exchange";

/// Queue consumed when a subscription names no topic.
pub const DEFAULT_QUEUE: &str = "amqp_queue";

/// Default capacity of the inbound buffer.
pub const DEFAULT_MAX_QUEUE_SIZE: usize = 100;

/// Quality-of-service level used for every pub/sub publish and subscribe.
pub const PUBSUB_QOS: u8 = 1;

/// Prefetch window of exchange consumers.
pub const EXCHANGE_PREFETCH: u16 = 1;

/// Options of the bridge core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeOptions {
    /// Maximum number of envelopes held for the consumer.
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// Fallback exchange name for publishing and subscriber bindings.
    #[serde(default = "default_exchange")]
    pub default_exchange: String,

    /// Queue consumed when a subscription topic is empty.
    #[serde(default = "default_queue")]
    pub default_queue: String,

    /// Pub/sub client settings.
    #[serde(default)]
    pub pubsub: PubSubOptions,
}

fn default_max_queue_size() -> usize {
    DEFAULT_MAX_QUEUE_SIZE
}

fn default_exchange() -> String {
    DEFAULT_EXCHANGE.to_string()
}

fn default_queue() -> String {
    DEFAULT_QUEUE.to_string()
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            max_queue_size: default_max_queue_size(),
            default_exchange: default_exchange(),
            default_queue: default_queue(),
            pubsub: PubSubOptions::default(),
        }
    }
}

impl BridgeOptions {
    /// Set the inbound buffer capacity.
    pub fn with_max_queue_size(mut self, max_queue_size: usize) -> Self {
        self.max_queue_size = max_queue_size;
        self
    }

    /// Validate the options.
    pub fn validate(&self) -> Result<()> {
        if self.max_queue_size == 0 {
            return Err(BridgeError::config("max_queue_size must be at least 1"));
        }
        if self.default_exchange.trim().is_empty() {
            return Err(BridgeError::config("default_exchange must not be empty"));
        }
        if self.default_queue.trim().is_empty() {
            return Err(BridgeError::config("default_queue must not be empty"));
        }
        self.pubsub.validate()
    }
}

/// Pub/sub client connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PubSubOptions {
    /// Prefix of generated client identifiers.
    #[serde(default = "default_client_id_prefix")]
    pub client_id_prefix: String,

    /// Keep-alive interval in seconds.
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,

    /// Network connect timeout in seconds.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Delay between automatic reconnect attempts in seconds.
    #[serde(default = "default_retry_interval_secs")]
    pub retry_interval_secs: u64,

    /// Bounded wait for the first successful handshake in seconds.
    #[serde(default = "default_connect_wait_secs")]
    pub connect_wait_secs: u64,

    /// Bounded wait for PUBACK, SUBACK and UNSUBACK in seconds.
    #[serde(default = "default_ack_timeout_secs")]
    pub ack_timeout_secs: u64,

    /// Time given to an orderly DISCONNECT before the client is dropped.
    #[serde(default = "default_disconnect_grace_ms")]
    pub disconnect_grace_ms: u64,
}

fn default_client_id_prefix() -> String {
    "mqtt_client".to_string()
}

fn default_keep_alive_secs() -> u64 {
    30
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_retry_interval_secs() -> u64 {
    5
}

fn default_connect_wait_secs() -> u64 {
    15
}

fn default_ack_timeout_secs() -> u64 {
    10
}

fn default_disconnect_grace_ms() -> u64 {
    250
}

impl Default for PubSubOptions {
    fn default() -> Self {
        Self {
            client_id_prefix: default_client_id_prefix(),
            keep_alive_secs: default_keep_alive_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            retry_interval_secs: default_retry_interval_secs(),
            connect_wait_secs: default_connect_wait_secs(),
            ack_timeout_secs: default_ack_timeout_secs(),
            disconnect_grace_ms: default_disconnect_grace_ms(),
        }
    }
}

impl PubSubOptions {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    pub fn connect_wait(&self) -> Duration {
        Duration::from_secs(self.connect_wait_secs)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_secs)
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_millis(self.disconnect_grace_ms)
    }

    fn validate(&self) -> Result<()> {
        // rumqttc rejects keep-alive intervals below 5 seconds
        if self.keep_alive_secs < 5 {
            return Err(BridgeError::config("pubsub.keep_alive_secs must be at least 5"));
        }
        if self.connect_wait_secs == 0 || self.ack_timeout_secs == 0 {
            return Err(BridgeError::config(
                "pubsub.connect_wait_secs and pubsub.ack_timeout_secs must be positive",
            ));
        }
        Ok(())
    }
}
