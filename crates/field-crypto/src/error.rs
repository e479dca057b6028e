//! Error types for field encryption

/// Errors from key handling and sealing.
///
/// Opening a sealed value never errors; see `FieldEncryptor::decrypt`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid encryption key: {0}")]
    InvalidKey(String),

    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),
}

/// Result alias for crypto operations.
pub type Result<T> = std::result::Result<T, Error>;
