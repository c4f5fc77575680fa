//! Error types shared by every benchkit backend.
//!
//! Uses `thiserror` with three domain variants (configuration, unsupported
//! operation, upstream load) plus plumbing variants for I/O and codecs.

use thiserror::Error;

/// Boxed source error carried by [`BackendError::UpstreamLoad`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Top-level error type for backend construction and calls.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Unsupported library/task/quantization/feature combination, detected
    /// at construction before any loading work starts.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The task kind or operation is not handled by this backend.
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// Failure raised by the hub, the engine or the server while loading.
    /// The source is kept unchanged.
    #[error("Failed to load {what}: {source}")]
    UpstreamLoad {
        what: String,
        #[source]
        source: BoxError,
    },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Model is not loaded: {0}")]
    NotLoaded(String),

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Tensor error: {0}")]
    Tensor(String),

    #[error("Server error: {0}")]
    Server(String),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Safetensors error: {0}")]
    SafeTensors(#[from] safetensors::SafeTensorError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl BackendError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::UnsupportedOperation(msg.into())
    }

    pub fn upstream(what: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::UpstreamLoad {
            what: what.into(),
            source: source.into(),
        }
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn engine(msg: impl std::fmt::Display) -> Self {
        Self::Engine(msg.to_string())
    }

    pub fn tensor(msg: impl std::fmt::Display) -> Self {
        Self::Tensor(msg.to_string())
    }

    pub fn server(msg: impl Into<String>) -> Self {
        Self::Server(msg.into())
    }

    /// Whether this error belongs to the configuration class.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }

    /// Whether this error belongs to the unsupported-operation class.
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::UnsupportedOperation(_))
    }
}

/// Convenience result alias.
pub type Result<T> = std::result::Result<T, BackendError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_keeps_source() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "config.json");
        let err = BackendError::upstream("model config", io);
        let source = std::error::Error::source(&err).expect("source is kept");
        assert_eq!(source.to_string(), "config.json");
        assert!(err.to_string().starts_with("Failed to load model config"));
    }

    #[test]
    fn test_error_classes() {
        assert!(BackendError::configuration("x").is_configuration());
        assert!(BackendError::unsupported("x").is_unsupported());
        assert!(!BackendError::server("x").is_unsupported());
    }
}
