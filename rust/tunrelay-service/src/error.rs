use thiserror::Error;
use tunrelay_stack::RelayError;

/// Service-level error types
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Relay stack error: {0}")]
    Stack(#[from] RelayError),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Tunnel error: {0}")]
    Tunnel(String),
}

pub type Result<T> = std::result::Result<T, ServiceError>;

impl ServiceError {
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config(message.into())
    }

    pub fn tunnel<S: Into<String>>(message: S) -> Self {
        Self::Tunnel(message.into())
    }

    /// Get error code/category for external use
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) | Self::Yaml(_) => "CONFIG",
            Self::Io(_) => "IO",
            Self::Stack(_) => "STACK",
            Self::Tunnel(_) => "TUNNEL",
        }
    }
}
