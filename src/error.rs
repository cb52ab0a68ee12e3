//! Error types for the Chainmesh library

use thiserror::Error;

/// Result type alias for Chainmesh operations
pub type Result<T> = std::result::Result<T, ChainmeshError>;

/// Main error type for Chainmesh operations
#[derive(Error, Debug)]
pub enum ChainmeshError {
    /// Network-related errors
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// Cryptographic errors
    #[error("Cryptographic error: {0}")]
    Crypto(#[from] CryptoError),

    /// Repository errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),

    /// A block or chain was refused by the validation rules
    #[error("Validation error: {0}")]
    Validation(String),

    /// Block payload exceeds the construction-time bound
    #[error("Block payload size {size} exceeds maximum {max}")]
    PayloadTooLarge { size: usize, max: usize },

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic errors with message
    #[error("{0}")]
    Generic(String),
}

/// Network-specific error types
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Failed to bind the listener
    #[error("Failed to bind to {addr}: {source}")]
    BindFailed {
        addr: String,
        source: std::io::Error,
    },

    /// Failed to dial a peer
    #[error("Failed to connect to {addr}: {source}")]
    ConnectionFailed {
        addr: String,
        source: std::io::Error,
    },

    /// The connection is gone; nothing can be sent on it
    #[error("Connection to {addr} is closed")]
    ConnectionClosed { addr: String },

    /// The peer's outbound queue is full
    #[error("Outbound queue to {addr} is full")]
    QueueFull { addr: String },

    /// Invalid message format
    #[error("Invalid message format: {reason}")]
    InvalidMessage { reason: String },

    /// Timeout occurred
    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: std::time::Duration },

    /// Invalid peer address
    #[error("Invalid peer address: {addr}")]
    InvalidAddress { addr: String },
}

/// Cryptographic error types
#[derive(Error, Debug)]
pub enum CryptoError {
    /// Invalid signature
    #[error("Invalid signature")]
    InvalidSignature,

    /// Invalid public key
    #[error("Invalid public key: {reason}")]
    InvalidPublicKey { reason: String },

    /// Invalid private key
    #[error("Invalid private key: {reason}")]
    InvalidPrivateKey { reason: String },

    /// The private key does not belong to the given public key
    #[error("Private key does not match public key {public_key}")]
    KeyMismatch { public_key: String },

    /// Signing requested on a verify-only identity
    #[error("Identity {public_key} cannot sign")]
    MissingPrivateKey { public_key: String },
}

/// Repository error types
#[derive(Error, Debug)]
pub enum StorageError {
    /// Key not found
    #[error("Key not found: {key}")]
    KeyNotFound { key: String },

    /// Storage is not reachable
    #[error("Storage unavailable: {reason}")]
    Unavailable { reason: String },
}

/// Serialization error types
#[derive(Error, Debug)]
pub enum SerializationError {
    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Binary serialization error
    #[error("Binary serialization error: {0}")]
    Binary(#[from] bincode::Error),
}

impl ChainmeshError {
    /// Create a validation error
    pub fn validation<T: Into<String>>(msg: T) -> Self {
        ChainmeshError::Validation(msg.into())
    }

    /// Create a configuration error
    pub fn config<T: Into<String>>(msg: T) -> Self {
        ChainmeshError::Config(msg.into())
    }

    /// Create a generic error
    pub fn generic<T: Into<String>>(msg: T) -> Self {
        ChainmeshError::Generic(msg.into())
    }
}

impl From<serde_json::Error> for ChainmeshError {
    fn from(err: serde_json::Error) -> Self {
        ChainmeshError::Serialization(SerializationError::Json(err))
    }
}

impl From<bincode::Error> for ChainmeshError {
    fn from(err: bincode::Error) -> Self {
        ChainmeshError::Serialization(SerializationError::Binary(err))
    }
}
