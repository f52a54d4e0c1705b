//! Error handling for the filter chain engine
//!
//! This module defines the crate-level error type used by configuration
//! loading, the block runner and the binary. Errors raised at the chain and
//! stage boundaries live in [`crate::pipeline::error`].

use crate::pipeline::error::ChainError;
use thiserror::Error;

/// Main error type for engine operations outside the per-stage call boundary
#[derive(Error, Debug)]
pub enum EngineError {
    /// Errors related to configuration loading/saving
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors raised by the chain lifecycle
    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    /// Errors related to channel communication
    #[error("Channel error: {0}")]
    Channel(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<EngineError>,
    },
}

impl EngineError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        EngineError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for EngineError {
    fn from(err: toml::de::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}

impl From<toml::ser::Error> for EngineError {
    fn from(err: toml::ser::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: Into<EngineError>,
{
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.into().with_context(f()))
    }
}
