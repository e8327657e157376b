use thiserror::Error;

/// Crate-wide error type. Every fallible function in this broker returns
/// `Result<T, BrokerError>`.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("dispatch error: {0}")]
    Dispatch(String),

    #[error("reasoner error: {0}")]
    Reasoner(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Serde(#[from] toml::de::Error),
}
