//! Error types for upstream authentication operations

/// Errors from credential loading and token refresh.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("token endpoint returned {status}: {body}")]
    TokenEndpoint { status: u16, body: String },

    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("credential parse error: {0}")]
    CredentialParse(String),

    #[error("credential store error: {0}")]
    Store(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl Error {
    /// Whether this is a token-endpoint rejection with the given status.
    pub fn is_endpoint_status(&self, wanted: u16) -> bool {
        matches!(self, Error::TokenEndpoint { status, .. } if *status == wanted)
    }
}

/// Result alias for auth operations.
pub type Result<T> = std::result::Result<T, Error>;
