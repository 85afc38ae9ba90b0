//! Error types for the Quotaguard service.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for Quotaguard operations.
#[derive(Error, Debug)]
pub enum QuotaError {
    /// Configuration-related errors. Always fatal at startup.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Counter store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// HTTP server errors
    #[error("Server error: {0}")]
    Serve(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Quotaguard operations.
pub type Result<T> = std::result::Result<T, QuotaError>;
