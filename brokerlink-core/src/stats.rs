//! Bridge statistics.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Point-in-time counters of a bridge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeStats {
    /// Envelopes pushed into the inbound buffer.
    pub delivered: u64,
    /// Deliveries dropped because their body was not valid text.
    pub skipped: u64,
    /// Envelopes evicted from the inbound buffer by overflow.
    pub evicted: u64,
    /// Subscriber bindings to the default exchange that failed and were ignored.
    pub tolerated_bind_failures: u64,
    /// Listener tasks currently registered.
    pub listeners: usize,
    /// Envelopes waiting in the inbound buffer.
    pub buffered: usize,
}

impl BridgeStats {
    /// Serialize as a JSON value for logging.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Live counters shared with listener tasks.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    delivered: AtomicU64,
    skipped: AtomicU64,
    tolerated_bind_failures: AtomicU64,
}

impl Counters {
    pub(crate) fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_tolerated_bind_failure(&self) {
        self.tolerated_bind_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub(crate) fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    pub(crate) fn tolerated_bind_failures(&self) -> u64 {
        self.tolerated_bind_failures.load(Ordering::Relaxed)
    }
}
