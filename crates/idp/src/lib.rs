//! Identity provider protocol library
//!
//! Everything the broker needs to speak OpenID Connect to a single identity
//! provider: signing-key resolution, token verification, token endpoint
//! grants and authorization URL construction. The crate holds no per-user
//! state; caching of issued tokens lives in `token-cache`.
//!
//! Protocol flow:
//! 1. Caller builds a login URL via `pkce::build_authorization_url()`
//! 2. Provider redirects back with a code; `TokenClient::exchange_code()` redeems it
//! 3. `TokenVerifier::verify()` checks the returned ID token against the JWKS
//!    resolved by `KeyResolver`
//! 4. Later calls use `TokenClient::refresh()` for silent refresh and
//!    `TokenClient::on_behalf_of()` for downstream tokens

pub mod endpoints;
pub mod error;
pub mod keys;
pub mod pkce;
pub mod token;
pub mod verify;

#[cfg(any(test, feature = "test-util"))]
pub mod testutil;

pub use endpoints::{ClientApp, ProviderEndpoints};
pub use error::{Error, Result, VerifyError};
pub use keys::{KeyResolver, SigningKey};
pub use pkce::{Prompt, build_authorization_url, compute_challenge, generate_state, generate_verifier};
pub use token::{ProviderErrorBody, TokenClient, TokenResponse};
pub use verify::{TokenVerifier, VerifiedClaims};
