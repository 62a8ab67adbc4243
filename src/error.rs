//! Error types for the Sigstore operator

use thiserror::Error;

/// Main error type for reconciliation and operator start-up
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Optimistic concurrency failure: the object changed since it was read
    #[error("Conflict writing {kind} {name}: the object has been modified")]
    Conflict { kind: String, name: String },

    /// Object could not be converted to or from its wire representation
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Operator configuration is invalid or could not be loaded
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// User-supplied spec failed validation
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Irrecoverable failure that needs operator intervention
    #[error("Terminal error: {0}")]
    Terminal(String),

    /// A required metadata field was not set on an object
    #[error("Object is missing required key: {0}")]
    MissingObjectKey(&'static str),
}

impl Error {
    /// Create a terminal error
    pub fn terminal(msg: impl Into<String>) -> Self {
        Self::Terminal(msg.into())
    }

    /// Check if the error is worth retrying on a later pass
    ///
    /// Conflicts and API failures are transient. Everything that points at
    /// bad data or bad configuration is not.
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::KubeError(kube::Error::Api(e)) => e.code == 409 || e.code == 429 || e.code >= 500,
            Error::KubeError(_) => true,
            Error::Conflict { .. } => true,
            Error::SerializationError(_)
            | Error::ConfigError(_)
            | Error::ValidationError(_)
            | Error::Terminal(_)
            | Error::MissingObjectKey(_) => false,
        }
    }

    /// Check if the error must never be retried without a spec change
    pub fn is_terminal(&self) -> bool {
        matches!(self, Error::Terminal(_) | Error::ValidationError(_))
    }
}

/// Result type alias for operator operations
pub type Result<T, E = Error> = std::result::Result<T, E>;
