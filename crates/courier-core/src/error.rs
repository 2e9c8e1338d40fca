//! Error types for courier.
//!
//! Local failures (timeouts, transport loss, serialization) and remote-origin
//! failures share one enum so that callers can keep a single `?` path around
//! proxied interface calls while still telling the two apart.

use std::time::Duration;
use thiserror::Error;

/// Well-known fault kinds produced by the dispatcher itself rather than by
/// an implementation.
pub mod fault_kind {
    /// No candidate method matched name, arity and parameter types.
    pub const METHOD_NOT_FOUND: &str = "courier::MethodNotFound";
    /// The interface is registered but no instance could be resolved.
    pub const SERVICE_UNAVAILABLE: &str = "courier::ServiceUnavailable";
    /// The request envelope is inconsistent (value/type count mismatch).
    pub const INVALID_REQUEST: &str = "courier::InvalidRequest";
    /// The implementation's result could not be serialized.
    pub const SERIALIZATION: &str = "courier::Serialization";
    /// The implementation failed with a type-erased error (`anyhow::Error`,
    /// a boxed error or a plain string), so its concrete type is unknown.
    pub const IMPLEMENTATION: &str = "courier::ImplementationError";
    /// The implementation panicked.
    pub const PANIC: &str = "panic";
}

/// A failure that happened on the receiver, as observed by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct RemoteError {
    /// Type identifier of the original error.
    pub original_type: String,
    /// Message of the original error.
    pub message: String,
    /// Remote context (error chain) captured by the receiver.
    pub detail: Option<String>,
}

impl RemoteError {
    pub fn new(original_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            original_type: original_type.into(),
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn original_type(&self) -> &str {
        &self.original_type
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }

    pub fn is_method_not_found(&self) -> bool {
        self.original_type == fault_kind::METHOD_NOT_FOUND
    }

    pub fn is_service_unavailable(&self) -> bool {
        self.original_type == fault_kind::SERVICE_UNAVAILABLE
    }
}

/// Main error type for courier.
#[derive(Debug, Error)]
pub enum CourierError {
    #[error("No reply received within {0:?}")]
    Timeout(Duration),

    #[error("Remote error ({}): {}", .0.original_type, .0.message)]
    Remote(RemoteError),

    #[error("Serialization error: {message}")]
    Serialization {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("Transport error: {message}")]
    Transport { message: String },

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Transport has been disposed")]
    Disposed,

    #[error("Configuration error: {message}")]
    Config { message: String },
}

/// Result type alias for courier operations.
pub type Result<T> = std::result::Result<T, CourierError>;

impl From<std::io::Error> for CourierError {
    fn from(err: std::io::Error) -> Self {
        CourierError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for CourierError {
    fn from(err: serde_json::Error) -> Self {
        CourierError::Serialization {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<RemoteError> for CourierError {
    fn from(err: RemoteError) -> Self {
        CourierError::Remote(err)
    }
}

impl CourierError {
    pub fn serialization(message: impl Into<String>) -> Self {
        CourierError::Serialization {
            message: message.into(),
            source: None,
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        CourierError::Transport {
            message: message.into(),
        }
    }

    /// True when the failure happened on the receiver.
    pub fn is_remote(&self) -> bool {
        matches!(self, CourierError::Remote(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, CourierError::Timeout(_))
    }

    /// The remote error, if this failure happened on the receiver.
    pub fn as_remote(&self) -> Option<&RemoteError> {
        match self {
            CourierError::Remote(err) => Some(err),
            _ => None,
        }
    }
}
