use thiserror::Error;

/// Common error type for brokerlink components.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unsupported protocol: {0}")]
    UnsupportedProtocol(String),
}

/// Result type alias using brokerlink's Error.
pub type Result<T> = std::result::Result<T, Error>;
