// Central Error Type for the Application

use thiserror::Error;

/// Application-level error type
///
/// The pipeline distinguishes three families: broker failures (`Broker`, which
/// carries the connection error), wire-format failures (`Serialization`) and
/// decision failures (`Processing`).
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Domain error: {0}")]
    Domain(#[from] crate::domain::DomainError),

    #[error("Broker error: {0}")]
    Broker(#[from] crate::port::BrokerError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Processing error: {0}")]
    Processing(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// True when the broker could not be reached or the handshake failed
    pub fn is_connection(&self) -> bool {
        matches!(self, AppError::Broker(crate::port::BrokerError::Connection(_)))
    }
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;
