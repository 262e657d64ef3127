//! Bounded inbound buffer shared by listener tasks and the consumer.

use std::collections::VecDeque;

use parking_lot::Mutex;

use brokerlink_common::MessageEnvelope;

/// Fixed-capacity FIFO of received envelopes.
///
/// When a push would exceed the capacity the oldest envelopes are evicted, so
/// the buffer always holds the most recent `capacity` envelopes in arrival
/// order.
#[derive(Debug)]
pub struct InboundBuffer {
    capacity: usize,
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    queue: VecDeque<MessageEnvelope>,
    evicted: u64,
}

impl InboundBuffer {
    /// Create a buffer holding at most `capacity` envelopes (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            inner: Mutex::new(Inner {
                queue: VecDeque::with_capacity(capacity),
                evicted: 0,
            }),
        }
    }

    /// Append an envelope, evicting from the front on overflow.
    pub fn push(&self, envelope: MessageEnvelope) {
        let mut inner = self.inner.lock();
        inner.queue.push_back(envelope);
        while inner.queue.len() > self.capacity {
            inner.queue.pop_front();
            inner.evicted += 1;
        }
    }

    /// Take every buffered envelope in arrival order, leaving the buffer empty.
    pub fn drain_all(&self) -> Vec<MessageEnvelope> {
        let mut inner = self.inner.lock();
        inner.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of envelopes discarded by overflow since creation.
    pub fn evicted(&self) -> u64 {
        self.inner.lock().evicted
    }
}
