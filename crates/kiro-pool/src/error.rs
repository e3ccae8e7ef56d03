//! Error types for pool operations

/// Errors from account selection and token acquisition.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("account pool is empty")]
    Empty,

    #[error(transparent)]
    Auth(#[from] kiro_auth::Error),
}

impl Error {
    /// Whether the underlying failure was a token-endpoint rejection with
    /// the given status.
    pub fn is_endpoint_status(&self, status: u16) -> bool {
        matches!(self, Error::Auth(inner) if inner.is_endpoint_status(status))
    }
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
