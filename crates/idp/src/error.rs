//! Error types for identity provider operations

use crate::token::ProviderErrorBody;

/// Errors from token endpoint and key set operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("token endpoint returned {status}: {body}")]
    Provider { status: u16, body: ProviderErrorBody },

    #[error("invalid token response: {0}")]
    InvalidResponse(String),

    #[error("key set fetch failed: {0}")]
    KeyFetch(String),

    #[error("invalid endpoint URL: {0}")]
    InvalidEndpoint(String),
}

impl Error {
    /// The parsed provider error body, if the token endpoint answered with one.
    pub fn provider_body(&self) -> Option<&ProviderErrorBody> {
        match self {
            Error::Provider { body, .. } => Some(body),
            _ => None,
        }
    }

    /// Provider says the user has not consented to the requested scopes.
    pub fn is_consent_required(&self) -> bool {
        self.provider_body()
            .is_some_and(ProviderErrorBody::is_consent_required)
    }

    /// Provider rejected the grant itself (revoked or expired refresh token,
    /// stale assertion). Interaction is needed to recover.
    pub fn is_invalid_grant(&self) -> bool {
        self.provider_body()
            .is_some_and(ProviderErrorBody::is_invalid_grant)
    }
}

/// Result alias for identity provider operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Reasons a token failed verification. Any variant means "reject".
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerifyError {
    #[error("token signature is invalid")]
    InvalidSignature,

    #[error("token has expired")]
    Expired,

    #[error("token audience does not match {expected}")]
    AudienceMismatch { expected: String },

    #[error("token issuer does not match {expected}")]
    IssuerMismatch { expected: String },

    #[error("no signing key with kid {0}")]
    KeyNotFound(String),

    #[error("token header has no kid")]
    MissingKeyId,

    #[error("unsupported signing algorithm {0}")]
    UnsupportedAlgorithm(String),

    #[error("malformed token: {0}")]
    Malformed(String),

    #[error("signing keys unavailable: {0}")]
    KeyFetch(String),
}
