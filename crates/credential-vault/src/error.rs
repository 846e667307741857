//! Error types for credential storage and encryption

/// Errors from store and cipher operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("credential parse error: {0}")]
    Parse(String),

    #[error("credential not found: {0}")]
    NotFound(String),

    #[error("credential already exists: {0}")]
    AlreadyExists(String),

    #[error("encryption error: {0}")]
    Crypto(String),

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),
}

/// Result alias for vault operations.
pub type Result<T> = std::result::Result<T, Error>;
