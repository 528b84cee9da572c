use thiserror::Error;

/// Result type for rate limit operations
pub type Result<T> = std::result::Result<T, RateLimitError>;

/// Errors that can occur in the rate limit service
#[derive(Error, Debug)]
pub enum RateLimitError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid rate limit policy: {0}")]
    InvalidConfig(String),

    #[error("Invalid route name: {0}")]
    InvalidRoute(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Store operation timed out: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<config::ConfigError> for RateLimitError {
    fn from(err: config::ConfigError) -> Self {
        RateLimitError::Config(err.to_string())
    }
}

impl From<serde_yaml::Error> for RateLimitError {
    fn from(err: serde_yaml::Error) -> Self {
        RateLimitError::Config(format!("Failed to parse YAML: {}", err))
    }
}

impl RateLimitError {
    /// Whether this error came from the backing store rather than the caller
    pub fn is_store_fault(&self) -> bool {
        matches!(
            self,
            RateLimitError::Redis(_) | RateLimitError::Store(_) | RateLimitError::Timeout(_)
        )
    }
}
