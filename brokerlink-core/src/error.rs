//! Error types for the bridge core.

use std::time::Duration;

use thiserror::Error;

use brokerlink_common::{Protocol, Role};

/// Result type alias using [`BridgeError`].
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Errors surfaced by bridge operations.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Protocol tag that names neither supported protocol.
    #[error("Unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Handshake, authentication or network failure while connecting.
    #[error("{protocol} {role} connection failed: {message}")]
    Connection {
        protocol: Protocol,
        role: Role,
        message: String,
    },

    /// No definitive connect result within the bounded wait.
    #[error("{protocol} {role} connection timed out after {}s", timeout.as_secs())]
    Timeout {
        protocol: Protocol,
        role: Role,
        timeout: Duration,
    },

    /// Publish or subscribe attempted without a live connection for the role.
    #[error("{protocol} {role} not connected")]
    NotConnected { protocol: Protocol, role: Role },

    /// A protocol operation on a live connection failed.
    #[error("{protocol} {operation} failed: {message}")]
    Operation {
        protocol: Protocol,
        operation: &'static str,
        message: String,
    },

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl BridgeError {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a connection error.
    pub fn connection(protocol: Protocol, role: Role, message: impl ToString) -> Self {
        Self::Connection {
            protocol,
            role,
            message: message.to_string(),
        }
    }

    /// Create an operation error.
    pub fn operation(protocol: Protocol, operation: &'static str, message: impl ToString) -> Self {
        Self::Operation {
            protocol,
            operation,
            message: message.to_string(),
        }
    }

    /// Whether this is a "not connected" state error.
    pub fn is_not_connected(&self) -> bool {
        matches!(self, Self::NotConnected { .. })
    }
}

impl From<brokerlink_common::Error> for BridgeError {
    fn from(err: brokerlink_common::Error) -> Self {
        match err {
            brokerlink_common::Error::UnsupportedProtocol(tag) => Self::UnsupportedProtocol(tag),
            brokerlink_common::Error::Json(e) => Self::Serialization(e.to_string()),
            other => Self::Config(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_connected_message() {
        let err = BridgeError::NotConnected {
            protocol: Protocol::Exchange,
            role: Role::Host,
        };
        assert_eq!(err.to_string(), "amqp host not connected");
        assert!(err.is_not_connected());
    }

    #[test]
    fn test_timeout_message() {
        let err = BridgeError::Timeout {
            protocol: Protocol::PubSub,
            role: Role::Client,
            timeout: Duration::from_secs(15),
        };
        assert_eq!(err.to_string(), "mqtt client connection timed out after 15s");
    }

    #[test]
    fn test_operation_message_keeps_cause() {
        let err = BridgeError::operation(Protocol::PubSub, "publish", "broker closed connection");
        assert_eq!(
            err.to_string(),
            "mqtt publish failed: broker closed connection"
        );
    }

    #[test]
    fn test_from_common_error() {
        let err: BridgeError = brokerlink_common::Error::UnsupportedProtocol("xmpp".into()).into();
        assert!(matches!(err, BridgeError::UnsupportedProtocol(tag) if tag == "xmpp"));
    }
}
