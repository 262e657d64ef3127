//! brokerlink: headless AMQP and MQTT bridge.
//!
//! Connects the configured host and client roles, subscribes the configured
//! queues and topics, and logs every received message until Ctrl+C.

mod args;
mod config;
mod runner;

use anyhow::Result;
use args::Args;
use brokerlink_common::init_tracing;
use brokerlink_core::LiveBridge;
use config::BrokerlinkConfig;
use runner::Runner;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Load configuration
    let config = BrokerlinkConfig::load_from_file(&args.config)?;

    // Initialize logging with optional CLI override
    let mut logging = config.logging.clone();
    if let Some(level) = &args.log_level {
        logging.level = level.clone();
    }
    init_tracing(&logging)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %args.config.display(),
        "Starting brokerlink"
    );

    let bridge = LiveBridge::live(config.bridge.clone())?;
    let runner = Runner::new(config, bridge);

    runner.start().await?;

    // Run until Ctrl+C (handles shutdown gracefully)
    runner.run().await
}
