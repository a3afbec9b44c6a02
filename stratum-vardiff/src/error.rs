//! Common error types for stratum-vardiff.
//!
//! This module provides a centralized Error enum using thiserror,
//! with conversions from underlying error types used throughout the crate.
//! Note that the retarget path itself never fails; these errors come from
//! configuration loading and the external collaborators.

use thiserror::Error;

/// Main error type for stratum-vardiff operations.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors from tokio or std
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed TOML configuration
    #[error("Configuration parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// HTTP transport errors talking to the node
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Node answered, but not with something usable
    #[error("RPC error: {0}")]
    Rpc(String),

    /// Persistence layer errors
    #[error("Store error: {0}")]
    Store(String),
}

/// Convenience type alias for Results using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
