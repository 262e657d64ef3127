//! CLI argument parsing.

use std::path::PathBuf;

use clap::Parser;

/// Default configuration file.
pub const DEFAULT_CONFIG: &str = "brokerlink.json5";

/// brokerlink command line.
#[derive(Parser, Debug, Clone)]
#[command(version, about = "AMQP and MQTT protocol bridge")]
pub struct Args {
    /// Path to configuration file.
    #[arg(short, long, default_value = DEFAULT_CONFIG)]
    pub config: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    pub log_level: Option<String>,
}

impl Args {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }
}
