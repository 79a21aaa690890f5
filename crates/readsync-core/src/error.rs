use std::fmt;
use thiserror::Error;

/// Errors that can occur anywhere in the receipt engine
#[derive(Error, Debug)]
pub enum Error {
    /// A receipt payload was rejected at ingestion
    #[error("Receipt error: {0}")]
    Receipt(#[from] ReceiptError),

    /// A storage or directory collaborator failed
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The engine configuration is not usable
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type for receipt engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while validating an inbound read receipt
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReceiptError {
    /// The payload carried no reader, or an empty one
    #[error("Receipt has no reader")]
    MissingReader,

    /// The payload carried no timestamp
    #[error("Receipt has no timestamp")]
    MissingTimestamp,

    /// The timestamp is not a valid sent-at value
    #[error("Invalid receipt timestamp: {0}")]
    InvalidTimestamp(i64),
}

/// Errors that can occur when talking to the storage gateway or the conversation directory
#[derive(Error, Debug)]
pub enum StoreError {
    /// A generic backend failure
    #[error("Storage backend error: {0}")]
    Backend(String),

    /// The backend is temporarily unreachable
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    /// An error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An error from the sled database
    #[error("Sled error: {0}")]
    Sled(#[from] sled::Error),
}

impl StoreError {
    /// Create a new Backend error
    pub fn backend<E: fmt::Display>(error: E) -> Self {
        Self::Backend(error.to_string())
    }
}

/// Errors raised by configuration validation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A field holds a value the engine cannot run with
    #[error("Invalid value for {field}: {message}")]
    Invalid { field: String, message: String },
}

impl ConfigError {
    pub fn invalid(field: &str, message: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.to_string(),
            message: message.into(),
        }
    }
}
