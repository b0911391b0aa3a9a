use thiserror::Error;

/// Errors raised while building, training or persisting stopping policies
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed experiment configuration or game definition; raised before training starts
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Numeric input outside the domain of an operation
    #[error("domain error: {0}")]
    Domain(String),

    /// The environment failed while a rollout was in progress
    #[error("rollout failed: {0}")]
    Rollout(String),

    /// A dict/JSON representation could not be converted back
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Error::Configuration(msg.into())
    }

    pub fn domain(msg: impl Into<String>) -> Self {
        Error::Domain(msg.into())
    }

    pub fn rollout(msg: impl Into<String>) -> Self {
        Error::Rollout(msg.into())
    }

    pub fn serialization(msg: impl Into<String>) -> Self {
        Error::Serialization(msg.into())
    }

    /// Missing key in a dict representation
    pub fn missing_key(key: &str, kind: &str) -> Self {
        Error::Serialization(format!("key `{}` not found in {} dict", key, kind))
    }

    /// Short machine-readable tag, used when a failure is recorded instead of raised
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Configuration(_) => "configuration",
            Error::Domain(_) => "domain",
            Error::Rollout(_) => "rollout",
            Error::Serialization(_) => "serialization",
            Error::Io(_) => "io",
            Error::Json(_) => "json",
        }
    }
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;
