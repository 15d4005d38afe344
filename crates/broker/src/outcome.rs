//! Request-facing types: inbound tokens, authenticated users, issued tokens
//! and the outcome reported back to callers.

use std::fmt;

use common::Secret;
use idp::VerifiedClaims;
use serde::Serialize;

/// Tokens presented by an inbound request. Both are required.
#[derive(Default)]
pub struct InboundTokens {
    /// Access token for this service's own API (also the OBO assertion)
    pub access_token: Option<String>,
    pub id_token: Option<String>,
}

impl fmt::Debug for InboundTokens {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundTokens")
            .field("has_access_token", &self.access_token.is_some())
            .field("has_id_token", &self.id_token.is_some())
            .finish()
    }
}

/// A request whose access token and ID token both verified.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    /// `"{oid}.{tid}"`, the token cache partition key
    pub user_key: String,
    pub id_claims: VerifiedClaims,
    pub access_claims: VerifiedClaims,
    /// The verified inbound access token, presented as the OBO assertion
    pub assertion: Secret<String>,
}

impl AuthenticatedUser {
    pub fn email(&self) -> Option<&str> {
        self.id_claims.email()
    }

    pub fn display_name(&self) -> Option<&str> {
        self.id_claims.name()
    }
}

/// An access token ready to be used as a bearer token.
///
/// Cache hits and refreshes carry the matching ID token; on-behalf-of tokens
/// for downstream resources do not.
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct TokenPair {
    pub access_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    /// Epoch seconds
    pub expires_on: u64,
    pub scopes: Vec<String>,
}

impl fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenPair")
            .field("has_id_token", &self.id_token.is_some())
            .field("expires_on", &self.expires_on)
            .field("scopes", &self.scopes)
            .finish()
    }
}

/// Authorization URL for a new login or re-consent.
#[derive(Debug, Clone, Serialize)]
pub struct LoginRequest {
    pub url: String,
    pub state: String,
}

/// A completed authorization-code login.
#[derive(Debug, Clone, Serialize)]
pub struct LoginResult {
    pub user_key: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
    #[serde(skip)]
    pub tokens: TokenPair,
}

/// What a token request resolved to.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TokenOutcome {
    TokenReady(TokenPair),
    LoginRequired,
    ConsentRequired { consent_url: String },
    VerificationFailed { reason: String },
    ExchangeFailed { reason: String },
}
