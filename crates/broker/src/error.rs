//! Error types for broker operations
//!
//! Every variant except `Store` is a request outcome the caller can act on
//! (log in again, follow a consent link, reject the request). Storage faults
//! are infrastructure failures and stay errors.

use idp::VerifyError;

use crate::outcome::TokenOutcome;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// No cached token, refresh token or account can produce a token.
    #[error("interactive login required")]
    LoginRequired,

    /// The user must approve the requested scopes at `consent_url`.
    #[error("consent required for the requested scopes")]
    ConsentRequired { consent_url: String },

    #[error("token exchange failed: {0}")]
    ExchangeFailed(String),

    #[error("token verification failed: {0}")]
    Verification(#[from] VerifyError),

    /// An inbound token header is absent.
    #[error("missing {0} header")]
    MissingTokens(&'static str),

    #[error("verified token has no oid/tid claims")]
    MissingIdentityClaims,

    /// Access token and ID token were issued to different users.
    #[error("access token and ID token identify different users")]
    IdentityMismatch,

    #[error("token cache error: {0}")]
    Store(#[from] token_cache::Error),

    /// Callback `state` does not match a pending login (forged, replayed or expired).
    #[error("unknown or expired login state")]
    UnknownLoginState,
}

impl BrokerError {
    /// Fold this error into the outcome reported to callers.
    ///
    /// Storage faults are returned unchanged as `Err`.
    pub fn into_outcome(self) -> Result<TokenOutcome> {
        match self {
            BrokerError::LoginRequired | BrokerError::UnknownLoginState => {
                Ok(TokenOutcome::LoginRequired)
            }
            BrokerError::ConsentRequired { consent_url } => {
                Ok(TokenOutcome::ConsentRequired { consent_url })
            }
            BrokerError::ExchangeFailed(reason) => Ok(TokenOutcome::ExchangeFailed { reason }),
            e @ (BrokerError::Verification(_)
            | BrokerError::MissingTokens(_)
            | BrokerError::MissingIdentityClaims
            | BrokerError::IdentityMismatch) => Ok(TokenOutcome::VerificationFailed {
                reason: e.to_string(),
            }),
            e @ BrokerError::Store(_) => Err(e),
        }
    }
}

/// Result alias for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;
