//! Per-call configuration values of the bridge operations.

use serde::{Deserialize, Serialize};

use brokerlink_common::{Protocol, Role};

/// Connection parameters for one `connect` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Protocol to connect with.
    pub protocol: Protocol,

    /// Broker host name or address.
    pub host: String,

    /// Broker port.
    pub port: u16,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,

    /// Exchange to declare (exchange protocol only).
    #[serde(default)]
    pub exchange: Option<String>,

    /// Queue to declare (exchange protocol only).
    #[serde(default)]
    pub queue: Option<String>,

    /// Routing key binding the queue to the exchange (exchange protocol only).
    #[serde(default, alias = "routingKey")]
    pub routing_key: Option<String>,

    /// Connection role; unknown or missing values mean host.
    #[serde(default)]
    pub role: Role,
}

impl ConnectionConfig {
    pub fn new(protocol: Protocol, host: impl Into<String>, port: u16) -> Self {
        Self {
            protocol,
            host: host.into(),
            port,
            username: String::new(),
            password: String::new(),
            exchange: None,
            queue: None,
            routing_key: None,
            role: Role::Host,
        }
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    pub fn with_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = Some(exchange.into());
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = Some(routing_key.into());
        self
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    /// Declared exchange name, ignoring empty strings.
    pub fn exchange_name(&self) -> Option<&str> {
        non_empty(&self.exchange)
    }

    /// Declared queue name, ignoring empty strings.
    pub fn queue_name(&self) -> Option<&str> {
        non_empty(&self.queue)
    }

    /// Binding routing key, ignoring empty strings.
    pub fn routing_key(&self) -> Option<&str> {
        non_empty(&self.routing_key)
    }

    /// Broker URI of the exchange protocol.
    pub fn amqp_uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/",
            self.username, self.password, self.host, self.port
        )
    }

    /// Broker address with credentials elided, for logging.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.is_empty())
}

/// Parameters of one `publish` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishConfig {
    pub protocol: Protocol,
    /// Routing key (exchange protocol) or topic (pub/sub protocol).
    pub topic: String,
    /// Message text; structured records are canonicalised before sending.
    pub message: String,
}

impl PublishConfig {
    pub fn new(protocol: Protocol, topic: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            protocol,
            topic: topic.into(),
            message: message.into(),
        }
    }
}

/// Parameters of one `subscribe` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeConfig {
    pub protocol: Protocol,
    /// Queue name (exchange protocol) or topic filter (pub/sub protocol).
    #[serde(default)]
    pub topic: String,
}

impl SubscribeConfig {
    pub fn new(protocol: Protocol, topic: impl Into<String>) -> Self {
        Self {
            protocol,
            topic: topic.into(),
        }
    }
}
