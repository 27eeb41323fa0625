//! Error types for the batch

/// Errors raised while building a batch or loading its settings
#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error("Configuration error: no store client supplied")]
    MissingClient,

    #[error("Configuration error: flush interval must be greater than zero")]
    InvalidFlushInterval,

    #[error("Configuration error: a Tokio runtime is required to arm the flush timer")]
    NoRuntime,

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

pub type Result<T> = std::result::Result<T, BatchError>;
