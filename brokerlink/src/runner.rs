//! Bridge lifecycle: startup, polling loop and shutdown.

use std::future::Future;

use anyhow::Context;
use tokio::signal;

use brokerlink_core::transport::{ExchangeConnector, PubSubConnector};
use brokerlink_core::{Bridge, MessageEnvelope};

use crate::config::BrokerlinkConfig;

/// Drives a bridge from a [`BrokerlinkConfig`].
///
/// Handles:
/// - Connecting every configured role
/// - Starting subscriptions and startup publications
/// - Draining and logging received messages on a fixed interval
/// - Graceful shutdown on Ctrl+C
pub struct Runner<E: ExchangeConnector, P: PubSubConnector> {
    config: BrokerlinkConfig,
    bridge: Bridge<E, P>,
}

impl<E: ExchangeConnector, P: PubSubConnector> Runner<E, P> {
    pub fn new(config: BrokerlinkConfig, bridge: Bridge<E, P>) -> Self {
        Self { config, bridge }
    }

    pub fn bridge(&self) -> &Bridge<E, P> {
        &self.bridge
    }

    /// Connect, subscribe and publish as configured.
    ///
    /// On failure every connection opened so far is closed again.
    pub async fn start(&self) -> anyhow::Result<()> {
        if let Err(e) = self.start_inner().await {
            self.bridge.shutdown().await;
            return Err(e);
        }
        Ok(())
    }

    async fn start_inner(&self) -> anyhow::Result<()> {
        for connection in &self.config.connections {
            self.bridge.connect(connection).await.with_context(|| {
                format!(
                    "Failed to connect {} {} at {}",
                    connection.protocol,
                    connection.role,
                    connection.endpoint()
                )
            })?;
        }

        for subscription in &self.config.subscriptions {
            self.bridge
                .subscribe(subscription)
                .await
                .with_context(|| {
                    format!(
                        "Failed to subscribe {} '{}'",
                        subscription.protocol, subscription.topic
                    )
                })?;
        }

        for publication in &self.config.publications {
            self.bridge.publish(publication).await.with_context(|| {
                format!(
                    "Failed to publish {} '{}'",
                    publication.protocol, publication.topic
                )
            })?;
        }

        tracing::info!(
            connections = self.config.connections.len(),
            subscriptions = self.config.subscriptions.len(),
            publications = self.config.publications.len(),
            "Bridge started"
        );
        Ok(())
    }

    /// Log every buffered envelope. Returns how many were drained.
    pub fn drain(&self) -> usize {
        let envelopes = self.bridge.get_messages();
        for envelope in &envelopes {
            log_envelope(envelope);
        }
        envelopes.len()
    }

    /// Run until Ctrl+C is received.
    pub async fn run(self) -> anyhow::Result<()> {
        self.run_until(async {
            if let Err(e) = signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            }
        })
        .await
    }

    /// Poll the bridge until `shutdown` completes, then close every connection.
    pub async fn run_until<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut ticker = tokio::time::interval(self.config.poll_interval());

        tracing::info!(
            poll_interval_ms = self.config.poll_interval_ms,
            "Bridge running. Press Ctrl+C to stop."
        );

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Received shutdown signal");
                    break;
                }
                _ = ticker.tick() => {
                    if self.drain() > 0 {
                        let stats = self.bridge.stats().await;
                        tracing::debug!(stats = %stats.to_json(), "Bridge stats");
                    }
                }
            }
        }

        // Whatever arrived since the last tick
        self.drain();
        self.bridge.shutdown().await;

        tracing::info!("Goodbye!");
        Ok(())
    }
}

fn log_envelope(envelope: &MessageEnvelope) {
    match envelope.decode_record() {
        Ok(record) => tracing::info!(
            protocol = %envelope.protocol(),
            received = %envelope.timestamp(),
            id = record.id,
            content = %record.content,
            "Received record"
        ),
        Err(_) => tracing::info!(
            protocol = %envelope.protocol(),
            received = %envelope.timestamp(),
            content = %envelope.content(),
            "Received message"
        ),
    }
}
