//! Error types for the rate limiting subsystem.

use thiserror::Error;

/// Main error type for rate limiter operations.
///
/// Only the limiter core, entry stores and the pipeline adapter return these.
/// The policy wrapper and the content facade absorb them and fail open.
#[derive(Error, Debug)]
pub enum RateLimitError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors raised while layering configuration sources
    #[error("Settings error: {0}")]
    Settings(#[from] config::ConfigError),

    /// The key-value backend rejected a request or replied with garbage
    #[error("Backend error: {0}")]
    Backend(String),

    /// Transport errors talking to the key-value backend
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON encoding or decoding errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for rate limiter operations.
pub type Result<T> = std::result::Result<T, RateLimitError>;
