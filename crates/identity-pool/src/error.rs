//! Error types for pool operations

/// Errors from pool operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No selectable identity, or the referenced row does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Rejected input, reported against a single field.
    #[error("invalid {field}: {message}")]
    Validation { field: String, message: String },

    /// Persistence failed. Nothing was published to readers.
    #[error("storage error: {0}")]
    Storage(String),

    #[error("encryption error: {0}")]
    Encryption(String),
}

impl Error {
    pub(crate) fn validation(field: &str, message: impl Into<String>) -> Self {
        Error::Validation {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

impl From<field_crypto::Error> for Error {
    fn from(e: field_crypto::Error) -> Self {
        Error::Encryption(e.to_string())
    }
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
