use thiserror::Error;

/// Errors crossing the boundary between the endpoint and its substrates
#[derive(Debug, Error)]
pub enum HsNetError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Timed out")]
    Timeout,

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type for substrate operations
pub type Result<T> = std::result::Result<T, HsNetError>;

impl HsNetError {
    pub fn network(msg: impl Into<String>) -> Self {
        Self::Network(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_converts() {
        let err: HsNetError = crate::config::ConfigError::invalid("paths", "0").into();
        assert!(matches!(err, HsNetError::Config(_)));
        assert!(err.to_string().contains("paths"));
    }
}
