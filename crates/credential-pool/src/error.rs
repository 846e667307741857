//! Error types for pool operations

/// Errors from pool operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("service name must not be empty")]
    EmptyServiceName,

    #[error("no credentials registered for service: {0}")]
    UnknownService(String),

    #[error("pool exhausted: {0}")]
    PoolExhausted(String),

    #[error("invalid handle: {0}")]
    InvalidHandle(String),

    #[error("selection for {service} lost {attempts} conditional writes in a row")]
    Contention { service: String, attempts: u32 },

    #[error("credential store error: {0}")]
    Vault(#[from] credential_vault::Error),
}

impl Error {
    /// Whether a caller may reasonably retry the same request later.
    pub fn is_temporary(&self) -> bool {
        matches!(self, Error::PoolExhausted(_) | Error::Contention { .. })
    }

    /// Message safe to show an end user. Never includes key material or
    /// pool internals.
    pub fn user_message(&self) -> &'static str {
        match self {
            Error::PoolExhausted(_) | Error::Contention { .. } => {
                "Service temporarily unavailable, please try again shortly."
            }
            Error::UnknownService(_) | Error::EmptyServiceName => {
                "This feature is not configured."
            }
            Error::InvalidHandle(_) | Error::Vault(_) => "Internal error.",
        }
    }
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausted_maps_to_try_again_message() {
        let err = Error::PoolExhausted("{}".into());
        assert!(err.is_temporary());
        assert!(err.user_message().contains("try again"));
    }

    #[test]
    fn contention_is_temporary() {
        let err = Error::Contention {
            service: "gemini".into(),
            attempts: 8,
        };
        assert!(err.is_temporary());
        assert_eq!(
            err.to_string(),
            "selection for gemini lost 8 conditional writes in a row"
        );
    }

    #[test]
    fn configuration_errors_are_not_temporary() {
        assert!(!Error::UnknownService("x".into()).is_temporary());
        assert!(!Error::EmptyServiceName.is_temporary());
        let vault: Error = credential_vault::Error::NotFound("k".into()).into();
        assert!(!vault.is_temporary());
        assert_eq!(vault.user_message(), "Internal error.");
    }
}
