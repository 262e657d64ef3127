//! Protocol drivers behind the bridge operations.
//!
//! Each driver owns the connector and the connection registry of one protocol
//! and implements connect, disconnect, publish, subscribe and unsubscribe for
//! it. Both feed the same inbound buffer.

pub mod exchange;
pub mod pubsub;

pub use exchange::{ExchangeDriver, ExchangeHandle, TOLERATED_TARGET};
pub use pubsub::{PubSubDriver, PubSubHandle, client_id};
