//! Listener tasks moving deliveries into the inbound buffer.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use brokerlink_common::{MessageEnvelope, Protocol, decode_text};

use crate::buffer::InboundBuffer;
use crate::stats::Counters;
use crate::transport::{Delivery, DeliveryStream};

/// Handle to a running listener task.
///
/// Dropping the handle also stops the task.
#[derive(Debug)]
pub struct ListenerHandle {
    topic: String,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    /// Queue name or topic filter the listener consumes.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signal the task to stop and wait for it to exit.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            if e.is_panic() {
                tracing::warn!(topic = %self.topic, "Listener task panicked");
            }
        }
    }
}

/// Spawn a task consuming `stream` until it ends or the handle stops it.
///
/// Text bodies become envelopes tagged with `protocol` and are acknowledged
/// after buffering. Bodies that are not valid UTF-8 are counted, logged and
/// rejected without requeue.
pub(crate) fn spawn_listener<S>(
    protocol: Protocol,
    topic: &str,
    stream: S,
    buffer: Arc<InboundBuffer>,
    counters: Arc<Counters>,
) -> ListenerHandle
where
    S: DeliveryStream,
{
    let (stop_tx, mut stop_rx) = watch::channel(false);
    let task_topic = topic.to_string();

    let task = tokio::spawn(async move {
        let mut stream = stream;
        tracing::debug!(protocol = %protocol, topic = %task_topic, "Listener started");

        loop {
            let item = tokio::select! {
                _ = stop_rx.changed() => break,
                item = stream.next() => item,
            };

            match item {
                Some(Ok(delivery)) => {
                    handle_delivery(protocol, &task_topic, &delivery, &buffer, &counters).await;
                }
                Some(Err(e)) => {
                    tracing::warn!(protocol = %protocol, topic = %task_topic, error = %e, "Delivery stream error");
                }
                None => break,
            }
        }

        tracing::debug!(protocol = %protocol, topic = %task_topic, "Listener stopped");
    });

    ListenerHandle {
        topic: topic.to_string(),
        stop: stop_tx,
        task,
    }
}

async fn handle_delivery<D: Delivery>(
    protocol: Protocol,
    topic: &str,
    delivery: &D,
    buffer: &InboundBuffer,
    counters: &Counters,
) {
    match decode_text(delivery.payload()) {
        Some(text) => {
            buffer.push(MessageEnvelope::new(protocol, text));
            counters.record_delivered();
            if let Err(e) = delivery.ack().await {
                tracing::warn!(protocol = %protocol, topic = %topic, error = %e, "Failed to acknowledge delivery");
            }
        }
        None => {
            counters.record_skipped();
            tracing::warn!(
                protocol = %protocol,
                topic = %topic,
                bytes = delivery.payload().len(),
                "Skipping delivery with non-UTF-8 body"
            );
            if let Err(e) = delivery.reject().await {
                tracing::warn!(protocol = %protocol, topic = %topic, error = %e, "Failed to reject delivery");
            }
        }
    }
}
