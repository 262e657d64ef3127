//! brokerlink configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use brokerlink_common::{LoggingConfig, Protocol, Role, load_config};
use brokerlink_core::{BridgeOptions, ConnectionConfig, PublishConfig, SubscribeConfig};

/// Prefix of the environment variables overriding connection settings.
const ENV_PREFIX: &str = "BROKERLINK";

/// Complete brokerlink configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerlinkConfig {
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Bridge core options.
    #[serde(default)]
    pub bridge: BridgeOptions,

    /// Connections opened at startup, in order.
    #[serde(default)]
    pub connections: Vec<ConnectionConfig>,

    /// Subscriptions started once every connection is up.
    #[serde(default)]
    pub subscriptions: Vec<SubscribeConfig>,

    /// Messages published once after subscribing.
    #[serde(default)]
    pub publications: Vec<PublishConfig>,

    /// How often received messages are drained and logged.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    1000
}

impl BrokerlinkConfig {
    /// Load configuration from a JSON5 file, apply environment overrides and
    /// validate the result.
    pub fn load_from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let mut config: Self = load_config(path)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate_config()?;
        Ok(config)
    }

    /// Override connection settings from `BROKERLINK_{AMQP|MQTT}_{HOST|PORT|USERNAME|PASSWORD}`.
    ///
    /// Applies to every connection of the matching protocol.
    pub fn apply_env<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        for connection in &mut self.connections {
            let prefix = format!(
                "{}_{}",
                ENV_PREFIX,
                connection.protocol.as_str().to_ascii_uppercase()
            );

            if let Some(host) = lookup(&format!("{}_HOST", prefix)) {
                connection.host = host;
            }
            if let Some(port) = lookup(&format!("{}_PORT", prefix)) {
                connection.port = port
                    .trim()
                    .parse()
                    .map_err(|_| anyhow::anyhow!("{}_PORT is not a valid port: {}", prefix, port))?;
            }
            if let Some(username) = lookup(&format!("{}_USERNAME", prefix)) {
                connection.username = username;
            }
            if let Some(password) = lookup(&format!("{}_PASSWORD", prefix)) {
                connection.password = password;
            }
        }
        Ok(())
    }

    /// Validate the configuration.
    pub fn validate_config(&self) -> anyhow::Result<()> {
        self.bridge.validate()?;

        if self.connections.is_empty() {
            anyhow::bail!("At least one connection must be configured");
        }
        if self.poll_interval_ms == 0 {
            anyhow::bail!("poll_interval_ms must be positive");
        }

        for (i, connection) in self.connections.iter().enumerate() {
            if connection.host.trim().is_empty() {
                anyhow::bail!("Connection {} has empty host", i);
            }
            if connection.port == 0 {
                anyhow::bail!("Connection {} has port 0", i);
            }
        }

        for (i, subscription) in self.subscriptions.iter().enumerate() {
            if !self.has_connection(subscription.protocol, Role::Client) {
                anyhow::bail!(
                    "Subscription {} needs a {} client connection",
                    i,
                    subscription.protocol
                );
            }
        }

        for (i, publication) in self.publications.iter().enumerate() {
            if !self.has_connection(publication.protocol, Role::Host) {
                anyhow::bail!(
                    "Publication {} needs a {} host connection",
                    i,
                    publication.protocol
                );
            }
        }

        Ok(())
    }

    fn has_connection(&self, protocol: Protocol, role: Role) -> bool {
        self.connections
            .iter()
            .any(|c| c.protocol == protocol && c.role == role)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
